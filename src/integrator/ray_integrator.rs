//! Occupancy integration of individual range rays.
//!
//! The depth-image pipeline needs a full frame; LiDARs deliver
//! measurements as single rays with poses. Each ray frees the space it
//! traverses and applies the measurement band response around its
//! endpoint, using the same voxel kernels as the frame updater. Blocks
//! touched by free space integrate at the free-space scale, blocks near
//! the endpoint at the finest scale. Propagation is deferred to
//! [`RayIntegrator::finish`] so a batch of rays propagates once.

use std::collections::HashSet;

use nalgebra::{Isometry3, Vector3};

use crate::config::OccupancyConfig;
use crate::map::OccupancyMap;
use crate::octree::propagator::{propagate_block_up_occupancy, propagate_to_root_occupancy};
use crate::octree::{BlockIdx, Timestamp, VoxelBlock};
use crate::sensor::SensorModel;

use super::occupancy_updater::update_voxel;

pub(crate) struct RayIntegrator<'a, S: SensorModel> {
    map: &'a mut OccupancyMap,
    sensor: &'a S,
    frame: Timestamp,
    config: OccupancyConfig,
    touched: HashSet<BlockIdx>,
}

impl<'a, S: SensorModel> RayIntegrator<'a, S> {
    pub fn new(map: &'a mut OccupancyMap, sensor: &'a S, frame: Timestamp) -> Self {
        let config = map.config().clone();
        Self {
            map,
            sensor,
            frame,
            config,
            touched: HashSet::new(),
        }
    }

    /// Fuse one measured ray. `ray_s` is the measured point in the
    /// sensor frame; its norm is the measured range.
    pub fn integrate(&mut self, ray_s: &Vector3<f32>, t_ws: &Isometry3<f32>) {
        let range = ray_s.norm();
        let dir_s = ray_s / range;
        if range < self.sensor.near_dist(&dir_s) || range > self.sensor.far_dist(&dir_s) {
            return;
        }
        let resolution = self.map.resolution();
        let origin_w = t_ws.translation.vector;
        let dir_w = t_ws * dir_s;
        let tau = self.config.tau(range, resolution);
        let three_sigma = self.config.three_sigma(range, resolution);

        let band_start = range - three_sigma;
        let t_end = range + tau;
        let mut t = self.sensor.near_dist(&dir_s);
        while t < t_end {
            let in_band = t >= band_start;
            let point_w = nalgebra::Point3::from(origin_w + dir_w * t);
            let Some(voxel) = self.map.point_to_voxel(&point_w) else {
                t += resolution;
                continue;
            };
            let Some(block_idx) = self.map.octree_mut().allocate_block_at(voxel) else {
                t += resolution;
                continue;
            };
            let block = self.map.octree_mut().block_mut(block_idx);
            if block.min_scale() == -1 {
                let scale = if in_band {
                    0
                } else {
                    self.config.fs_integr_scale
                };
                block.allocate_down_to(scale);
                block.init_curr_count();
            }
            let scale = block.current_scale();
            let idx = block.voxel_idx(voxel, scale);
            let range_diff = t - range;
            let newly = update_voxel(
                &mut block.mean_slice_mut(scale)[idx],
                range_diff,
                tau,
                three_sigma,
                &self.config,
            );
            if let Some(newly) = newly {
                block.incr_curr_observed_count(newly);
            }
            if self.touched.insert(block_idx) {
                block.set_timestamp(self.frame);
                block.incr_curr_integr_count();
            }

            // Half-voxel steps at the local scale keep diagonal rays
            // from skipping voxels.
            t += 0.5 * resolution * (1 << scale) as f32;
        }
    }

    /// Propagate everything the batch touched and return the surviving
    /// blocks.
    pub fn finish(self) -> Vec<BlockIdx> {
        let RayIntegrator {
            map,
            frame,
            config,
            touched,
            ..
        } = self;
        let mut touched: Vec<BlockIdx> = touched.into_iter().collect();
        touched.sort_unstable_by_key(|b| b.index());
        for &block_idx in &touched {
            propagate_block_up_occupancy(map.octree_mut().block_mut(block_idx));
        }
        let coords: Vec<_> = touched
            .iter()
            .map(|&idx| (idx, map.octree().block(idx).coord()))
            .collect();
        propagate_to_root_occupancy(
            map.octree_mut(),
            &touched,
            &[],
            frame,
            config.min_occupancy(),
        );
        coords
            .into_iter()
            .filter(|&(idx, coord)| map.octree().fetch_block(coord) == Some(idx))
            .map(|(idx, _)| idx)
            .collect()
    }
}
