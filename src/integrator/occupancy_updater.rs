//! Occupancy fusion kernels.
//!
//! The update runs in two phases per frame. Phase one walks the
//! carver's node list, freeing whole subtrees at node level and running
//! the uniform free kernel on the blocks underneath. Phase two runs the
//! per-voxel kernel on the carver's block list in parallel: each block
//! re-integrates at its current scale, unless the sensor recommends a
//! different scale, in which case the frame goes into a buffer pyramid
//! that only replaces the current data once ratified. Propagation then
//! rebuilds the block pyramids and the ancestor aggregates, pruning
//! subtrees that became uniformly free.

use log::debug;
use nalgebra::{Isometry3, Point3, Vector3};

use crate::config::{OccupancyConfig, Scheduling};
use crate::core::voxel::{VoxelCoord, BLOCK_MAX_SCALE, BLOCK_SIZE};
use crate::core::{DepthImage, OccupancyData, VoxelData};
use crate::map::OccupancyMap;
use crate::octree::propagator::{propagate_block_up_occupancy, propagate_to_root_occupancy};
use crate::octree::{BlockIdx, NodeIdx, OccupancyBlock, OctantKey, Timestamp, VoxelBlock};
use crate::sensor::SensorModel;

use super::for_each_block;
use super::volume_carver::VolumeCarverOutput;

/// Fuse the piecewise occupancy response for a measurement residual.
///
/// `range_diff` is the signed distance of the voxel behind the measured
/// surface, scaled onto the ray. Voxels more than `tau` behind the
/// surface are not updated. Returns whether the voxel was newly
/// observed, or `None` when no update applies.
pub(crate) fn update_voxel(
    data: &mut OccupancyData,
    range_diff: f32,
    tau: f32,
    three_sigma: f32,
    config: &OccupancyConfig,
) -> Option<bool> {
    let sample = if range_diff < -three_sigma {
        config.log_odd_min
    } else if range_diff < 0.5 * tau {
        // Linear ramp from fully free toward the surface boundary.
        (config.log_odd_min - config.log_odd_min / three_sigma * (range_diff + three_sigma))
            .min(config.log_odd_max)
    } else if range_diff < tau {
        (-config.log_odd_min * tau / (2.0 * three_sigma)).min(config.log_odd_max)
    } else {
        return None;
    };
    let newly_observed = !data.observed;
    data.integrate(sample, config.max_weight);
    Some(newly_observed)
}

/// Fuse the free-space response. Returns whether the voxel was newly
/// observed.
pub(crate) fn free_voxel(data: &mut OccupancyData, config: &OccupancyConfig) -> bool {
    let newly_observed = !data.observed;
    data.integrate(config.log_odd_min, config.max_weight);
    newly_observed
}

/// Per-frame context captured once and shared by the kernels.
pub(crate) struct OccupancyContext<'a, S: SensorModel> {
    pub sensor: &'a S,
    pub depth_img: &'a DepthImage,
    pub t_sw: Isometry3<f32>,
    pub resolution: f32,
    pub origin_w: Point3<f32>,
    pub config: OccupancyConfig,
    pub frame: Timestamp,
}

impl<S: SensorModel> OccupancyContext<'_, S> {
    /// Centre of a voxel cube in the sensor frame.
    fn sample_point_s(&self, voxel: VoxelCoord, stride: i32) -> Point3<f32> {
        let half = 0.5 * stride as f32;
        let point_w = self.origin_w
            + (Vector3::from(voxel) + Vector3::new(half, half, half)) * self.resolution;
        self.t_sw * point_w
    }

    /// Select the integration scale for a block.
    ///
    /// The recommendation comes from the sensor footprint, clamped to
    /// one step around the last scale; uniformly free blocks relax to
    /// the free-space integration scale.
    fn select_scale(&self, block: &OccupancyBlock, centre_s: &Point3<f32>, low_variance: bool) -> (i32, i32) {
        let never_integrated = block.min_scale() == -1;
        let last_scale = if never_integrated {
            0
        } else {
            block.current_scale()
        };
        let computed = self.sensor.compute_integration_scale(
            centre_s,
            self.resolution,
            last_scale,
            block.min_scale(),
            BLOCK_MAX_SCALE,
        );
        let clearly_free = block.max_field() < 0.95 * self.config.log_odd_min;
        let min_scale = if low_variance && (never_integrated || clearly_free) {
            self.config.fs_integr_scale
        } else {
            (last_scale - 1).max(0)
        };
        let max_scale = if never_integrated {
            BLOCK_MAX_SCALE
        } else {
            (last_scale + 1).min(BLOCK_MAX_SCALE)
        };
        (last_scale, computed.max(min_scale).min(max_scale))
    }

    /// Uniform free-space kernel: no projection, every voxel gets the
    /// free response.
    pub(crate) fn free_block(&self, block: &mut OccupancyBlock) {
        block.set_timestamp(self.frame);
        let centre_s = self.sample_point_s(block.coord(), BLOCK_SIZE);
        let (last_scale, recommended) = self.select_scale(block, &centre_s, true);

        if block.min_scale() == -1 {
            block.allocate_down_to(recommended);
            block.init_curr_count();
            block.set_init_data(OccupancyData::default());
        } else if recommended != last_scale {
            if recommended != block.buffer_scale() {
                block.init_buffer(recommended);
                if recommended < last_scale {
                    seed_buffer_from_parent(block, last_scale);
                }
            }
            let n = (BLOCK_SIZE >> recommended).pow(3) as usize;
            for idx in 0..n {
                let newly = free_voxel(block.buffer_voxel(idx), &self.config);
                block.incr_buffer_observed_count(newly);
            }
            block.incr_buffer_integr_count(true);
            block.switch_data();
            // The current pyramid ages by one frame while the buffer is
            // open; its statistics stay exact.
            return;
        } else {
            block.reset_buffer();
        }

        let scale = block.current_scale();
        let n = (BLOCK_SIZE >> scale).pow(3) as usize;
        for idx in 0..n {
            let newly = free_voxel(&mut block.mean_slice_mut(scale)[idx], &self.config);
            block.incr_curr_observed_count(newly);
        }
        block.incr_curr_integr_count();
    }

    /// Per-voxel measurement kernel.
    pub(crate) fn update_block(
        &self,
        block: &mut OccupancyBlock,
        low_variance: bool,
        projects_inside: bool,
    ) {
        block.set_timestamp(self.frame);
        let centre_s = self.sample_point_s(block.coord(), BLOCK_SIZE);
        let m_centre = self.sensor.measurement_from_point(&centre_s);
        let tau = self.config.tau(m_centre, self.resolution);
        let three_sigma = self.config.three_sigma(m_centre, self.resolution);
        let (last_scale, recommended) = self.select_scale(block, &centre_s, low_variance);

        if block.min_scale() == -1 {
            block.allocate_down_to(recommended);
            block.init_curr_count();
            block.set_init_data(OccupancyData::default());
        } else if recommended != last_scale {
            if recommended != block.buffer_scale() {
                block.init_buffer(recommended);
                if recommended < last_scale {
                    seed_buffer_from_parent(block, last_scale);
                }
            }
            self.integrate_scale(block, recommended, low_variance, tau, three_sigma, true);
            block.incr_buffer_integr_count(projects_inside);
            block.switch_data();
            return;
        } else {
            block.reset_buffer();
        }

        let scale = block.current_scale();
        self.integrate_scale(block, scale, low_variance, tau, three_sigma, false);
        block.incr_curr_integr_count();
    }

    /// Project and fuse every voxel of one scale, into the buffer or the
    /// current pyramid.
    fn integrate_scale(
        &self,
        block: &mut OccupancyBlock,
        scale: i32,
        low_variance: bool,
        tau: f32,
        three_sigma: f32,
        into_buffer: bool,
    ) {
        let stride = 1 << scale;
        let side = BLOCK_SIZE >> scale;
        let coord = block.coord();
        for zi in 0..side {
            for yi in 0..side {
                for xi in 0..side {
                    let voxel = coord + VoxelCoord::new(xi * stride, yi * stride, zi * stride);
                    let point_s = self.sample_point_s(voxel, stride);
                    let Some(depth) = self.sensor.depth_at(&point_s, self.depth_img) else {
                        continue;
                    };
                    let idx = (xi + yi * side + zi * side * side) as usize;
                    let newly = if low_variance {
                        let data = if into_buffer {
                            block.buffer_voxel(idx)
                        } else {
                            &mut block.mean_slice_mut(scale)[idx]
                        };
                        Some(free_voxel(data, &self.config))
                    } else {
                        let m = self.sensor.measurement_from_point(&point_s);
                        if m <= 0.0 {
                            continue;
                        }
                        let range = point_s.coords.norm();
                        let range_diff = (m - depth) * (range / m);
                        let data = if into_buffer {
                            block.buffer_voxel(idx)
                        } else {
                            &mut block.mean_slice_mut(scale)[idx]
                        };
                        update_voxel(data, range_diff, tau, three_sigma, &self.config)
                    };
                    if let Some(newly) = newly {
                        if into_buffer {
                            block.incr_buffer_observed_count(newly);
                        } else {
                            block.incr_curr_observed_count(newly);
                        }
                    }
                }
            }
        }
    }
}

/// Copy each parent sample onto its eight buffer children, unobserved
/// so the observation count re-accumulates at the new scale.
fn seed_buffer_from_parent(block: &mut OccupancyBlock, parent_scale: i32) {
    let parent_side = BLOCK_SIZE >> parent_scale;
    let child_side = parent_side * 2;
    for z in 0..parent_side {
        for y in 0..parent_side {
            for x in 0..parent_side {
                let parent_idx = (x + y * parent_side + z * parent_side * parent_side) as usize;
                let parent_data = block.mean_slice(parent_scale)[parent_idx];
                for (i, j, k) in CHILD_OFFSETS {
                    let child_idx = ((2 * x + i)
                        + (2 * y + j) * child_side
                        + (2 * z + k) * child_side * child_side)
                        as usize;
                    let child = block.buffer_voxel(child_idx);
                    child.occupancy = parent_data.occupancy;
                    child.weight = parent_data.weight;
                    child.observed = false;
                }
            }
        }
    }
}

const CHILD_OFFSETS: [(i32, i32, i32); 8] = [
    (0, 0, 0),
    (1, 0, 0),
    (0, 1, 0),
    (1, 1, 0),
    (0, 0, 1),
    (1, 0, 1),
    (0, 1, 1),
    (1, 1, 1),
];

/// Free a subtree: leaf nodes absorb the free response directly, while
/// partially refined nodes push it down to their (possibly freshly
/// allocated) children.
fn free_node_recurse<S: SensorModel>(
    map: &mut OccupancyMap,
    ctx: &OccupancyContext<'_, S>,
    node_idx: NodeIdx,
    freed_blocks: &mut Vec<BlockIdx>,
    seed_nodes: &mut Vec<NodeIdx>,
) {
    if map.octree().node(node_idx).is_leaf() {
        let node = map.octree_mut().node_mut(node_idx);
        node.data.integrate(ctx.config.log_odd_min, ctx.config.max_weight);
        node.min_data = node.data;
        node.max_data = node.data;
        if let Some(parent) = node.parent {
            seed_nodes.push(parent);
        }
        return;
    }
    for child_idx in 0..8 {
        match map.octree_mut().allocate_child(node_idx, child_idx) {
            OctantKey::Block(block_idx) => {
                ctx.free_block(map.octree_mut().block_mut(block_idx));
                freed_blocks.push(block_idx);
                seed_nodes.push(node_idx);
            }
            OctantKey::Node(child) => {
                free_node_recurse(map, ctx, child, freed_blocks, seed_nodes);
            }
        }
    }
}

/// Run the full occupancy update for one frame. Returns the touched
/// blocks that survived propagation-time pruning.
pub(crate) fn update<S: SensorModel>(
    map: &mut OccupancyMap,
    sensor: &S,
    depth_img: &DepthImage,
    t_ws: &Isometry3<f32>,
    frame: Timestamp,
    allocation: VolumeCarverOutput,
    scheduling: Scheduling,
) -> Vec<BlockIdx> {
    let ctx = OccupancyContext {
        sensor,
        depth_img,
        t_sw: t_ws.inverse(),
        resolution: map.resolution(),
        origin_w: map.origin(),
        config: map.config().clone(),
        frame,
    };

    // Phase one: bulk free, serial (it allocates octants).
    let mut freed_blocks = Vec::new();
    let mut seed_nodes = Vec::new();
    for &node_idx in &allocation.node_list {
        free_node_recurse(map, &ctx, node_idx, &mut freed_blocks, &mut seed_nodes);
    }

    // Phase two: per-voxel kernels, block-parallel.
    let mut jobs: Vec<Option<(bool, bool)>> = Vec::new();
    jobs.resize(map.octree().block_slot_count(), None);
    for (i, &block_idx) in allocation.block_list.iter().enumerate() {
        jobs[block_idx.index()] = Some((allocation.low_variance[i], allocation.projects_inside[i]));
    }
    for_each_block(
        scheduling,
        map.octree_mut().blocks_raw_mut(),
        &jobs,
        |block, &(low_variance, projects_inside)| {
            ctx.update_block(block, low_variance, projects_inside);
        },
    );

    // Propagation: block pyramids first, then the ancestor walk.
    let mut touched: Vec<BlockIdx> = allocation.block_list;
    touched.extend_from_slice(&freed_blocks);
    touched.sort_unstable_by_key(|b| b.index());
    touched.dedup();

    let mut up_jobs: Vec<Option<()>> = Vec::new();
    up_jobs.resize(map.octree().block_slot_count(), None);
    for &block_idx in &touched {
        up_jobs[block_idx.index()] = Some(());
    }
    for_each_block(
        scheduling,
        map.octree_mut().blocks_raw_mut(),
        &up_jobs,
        |block, _| propagate_block_up_occupancy(block),
    );

    let coords: Vec<(BlockIdx, VoxelCoord)> = touched
        .iter()
        .map(|&idx| (idx, map.octree().block(idx).coord()))
        .collect();
    let min_occupancy = ctx.config.min_occupancy();
    propagate_to_root_occupancy(map.octree_mut(), &touched, &seed_nodes, frame, min_occupancy);

    // Pruning may have freed some of the touched blocks.
    let survivors: Vec<BlockIdx> = coords
        .into_iter()
        .filter(|&(idx, coord)| map.octree().fetch_block(coord) == Some(idx))
        .map(|(idx, _)| idx)
        .collect();
    if survivors.len() < touched.len() {
        debug!(
            "frame {frame}: pruning released {} blocks",
            touched.len() - survivors.len()
        );
    }
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OccupancyConfig {
        OccupancyConfig::default()
    }

    #[test]
    fn test_response_curve_regions() {
        let cfg = config();
        let tau = 0.2;
        let three_sigma = 0.1;

        // Well in front of the surface: fully free.
        let mut d = OccupancyData::default();
        assert_eq!(update_voxel(&mut d, -0.2, tau, three_sigma, &cfg), Some(true));
        assert_eq!(d.occupancy, cfg.log_odd_min);

        // At the surface crossing the ramp reaches zero.
        let mut d = OccupancyData::default();
        update_voxel(&mut d, 0.0, tau, three_sigma, &cfg).unwrap();
        assert!(d.occupancy.abs() < 1e-5);

        // Just behind the surface: occupied plateau.
        let mut d = OccupancyData::default();
        update_voxel(&mut d, 0.15, tau, three_sigma, &cfg).unwrap();
        let plateau = (-cfg.log_odd_min * tau / (2.0 * three_sigma)).min(cfg.log_odd_max);
        assert!((d.occupancy - plateau).abs() < 1e-5);

        // Far behind the surface: no update.
        let mut d = OccupancyData::default();
        assert_eq!(update_voxel(&mut d, 0.3, tau, three_sigma, &cfg), None);
        assert_eq!(d.weight, 0.0);
    }

    #[test]
    fn test_ramp_is_monotonic() {
        let cfg = config();
        let tau = 0.2;
        let three_sigma = 0.1;
        let mut previous = f32::MIN;
        for i in 0..20 {
            let range_diff = -0.15 + i as f32 * 0.01;
            let mut d = OccupancyData::default();
            if update_voxel(&mut d, range_diff, tau, three_sigma, &cfg).is_some() {
                assert!(d.occupancy >= previous - 1e-5);
                previous = d.occupancy;
            }
        }
    }

    #[test]
    fn test_free_voxel_saturates() {
        let cfg = config();
        let mut d = OccupancyData::default();
        for _ in 0..200 {
            free_voxel(&mut d, &cfg);
        }
        assert!((d.field() - cfg.min_occupancy()).abs() < 1e-2);
    }
}
