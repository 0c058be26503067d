//! TSDF fusion kernels.
//!
//! Both kernels sample the block's voxel grid into the sensor, look up
//! the depth measurement each voxel projects onto, and fuse the scaled
//! residual into the truncated field. The multi-resolution kernel
//! additionally selects the integration scale per block and keeps the
//! scale pyramid consistent through down- and up-propagation; the
//! single-resolution kernel is the same machinery pinned to scale 0.

use nalgebra::{Isometry3, Point3, Vector3};

use crate::config::Scheduling;
use crate::core::voxel::{VoxelCoord, BLOCK_MAX_SCALE, BLOCK_SIZE};
use crate::map::TsdfMap;
use crate::octree::propagator::{
    propagate_block_down_tsdf, propagate_block_up_tsdf, propagate_timestamp_to_root,
};
use crate::octree::{BlockIdx, Timestamp, VoxelBlock};
use crate::sensor::SensorModel;

use super::{for_each_block, Measurements};

/// Geometry and measurement context captured once per frame.
struct FrameContext<'a, S: SensorModel> {
    sensor: &'a S,
    depth_img: &'a crate::core::DepthImage,
    /// World-to-sensor transform.
    t_sw: Isometry3<f32>,
    /// Sensor-to-world transform, for colour lookups.
    #[cfg(feature = "colour")]
    t_ws: Isometry3<f32>,
    #[cfg(feature = "colour")]
    colour: Option<ColourContext<'a, S>>,
    resolution: f32,
    origin_w: Point3<f32>,
    truncation_boundary: f32,
    max_weight: f32,
    frame: Timestamp,
}

#[cfg(feature = "colour")]
struct ColourContext<'a, S: SensorModel> {
    sensor: &'a S,
    image: &'a crate::core::Image<crate::core::ColourData>,
    /// World-to-colour-sensor transform.
    t_cw: Isometry3<f32>,
}

impl<'a, S: SensorModel> FrameContext<'a, S> {
    fn new(map: &TsdfMap, measurements: &'a Measurements<'a, S>, frame: Timestamp) -> Self {
        Self {
            sensor: measurements.depth.sensor,
            depth_img: measurements.depth.image,
            t_sw: measurements.depth.t_ws.inverse(),
            #[cfg(feature = "colour")]
            t_ws: measurements.depth.t_ws,
            #[cfg(feature = "colour")]
            colour: measurements.colour.as_ref().map(|c| ColourContext {
                sensor: c.sensor,
                image: c.image,
                t_cw: c.t_ws.inverse(),
            }),
            resolution: map.resolution(),
            origin_w: map.origin(),
            truncation_boundary: map.config().truncation_boundary(map.resolution()),
            max_weight: map.config().max_weight,
            frame,
        }
    }

    /// Centre of a voxel cube in the sensor frame.
    fn sample_point_s(&self, voxel: VoxelCoord, stride: i32) -> Point3<f32> {
        let half = 0.5 * stride as f32;
        let point_w = self.origin_w
            + (Vector3::from(voxel) + Vector3::new(half, half, half)) * self.resolution;
        self.t_sw * point_w
    }

    /// Fuse one voxel sample; returns whether the voxel was in band.
    fn fuse_voxel(&self, block: &mut crate::octree::TsdfBlock, voxel: VoxelCoord, scale: i32) -> bool {
        let point_s = self.sample_point_s(voxel, 1 << scale);
        if point_s.coords.norm() > self.sensor.far_dist(&point_s.coords) {
            return false;
        }
        let Some(depth) = self.sensor.depth_at(&point_s, self.depth_img) else {
            return false;
        };
        let m = self.sensor.measurement_from_point(&point_s);
        if m <= 0.0 {
            return false;
        }
        let sdf = (depth - m) / m * point_s.coords.norm();
        let idx = block.voxel_idx(voxel, scale);
        #[cfg(feature = "colour")]
        let weight_before = block.data(idx).weight;
        let (data, delta) = block.data_union_mut(idx);
        if !data.update(sdf, self.truncation_boundary, self.max_weight) {
            return false;
        }
        delta.delta_weight += 1.0;
        #[cfg(feature = "colour")]
        if let Some(colour) = &self.colour {
            let point_c = colour.t_cw * (self.t_ws * point_s);
            if let Some(pixel) = colour.sensor.project(&point_c).ok() {
                if let Some(sample) = colour
                    .image
                    .get(pixel.x.round() as i32, pixel.y.round() as i32)
                {
                    block.data_mut(idx).colour.update(*sample, weight_before);
                }
            }
        }
        true
    }
}

/// Single-resolution TSDF update: every voxel of every block at scale 0.
pub(crate) fn update_single<S: SensorModel>(
    map: &mut TsdfMap,
    blocks: &[BlockIdx],
    measurements: &Measurements<'_, S>,
    frame: Timestamp,
    scheduling: Scheduling,
) {
    let ctx = FrameContext::new(map, measurements, frame);
    let jobs = block_jobs(map, blocks);
    for_each_block(
        scheduling,
        map.octree_mut().blocks_raw_mut(),
        &jobs,
        |block, _: &()| {
            block.set_timestamp(ctx.frame);
            block.set_current_scale(0);
            block.update_min_scale(0);
            let coord = block.coord();
            for z in 0..BLOCK_SIZE {
                for y in 0..BLOCK_SIZE {
                    for x in 0..BLOCK_SIZE {
                        ctx.fuse_voxel(block, coord + VoxelCoord::new(x, y, z), 0);
                    }
                }
            }
        },
    );
    propagate_timestamp_to_root(map.octree_mut(), blocks, frame);
}

/// Multi-resolution TSDF update with adaptive scale selection.
pub(crate) fn update_multi<S: SensorModel>(
    map: &mut TsdfMap,
    blocks: &[BlockIdx],
    measurements: &Measurements<'_, S>,
    frame: Timestamp,
    scheduling: Scheduling,
) {
    let ctx = FrameContext::new(map, measurements, frame);
    let jobs = block_jobs(map, blocks);
    for_each_block(
        scheduling,
        map.octree_mut().blocks_raw_mut(),
        &jobs,
        |block, _: &()| {
            block.set_timestamp(ctx.frame);
            let block_centre_s = ctx.sample_point_s(block.coord(), BLOCK_SIZE);
            let last_scale = block.current_scale();

            // At most one step finer than the last integration.
            let scale = ctx
                .sensor
                .compute_integration_scale(
                    &block_centre_s,
                    ctx.resolution,
                    last_scale,
                    block.min_scale(),
                    BLOCK_MAX_SCALE,
                )
                .max(last_scale - 1);
            block.update_min_scale(scale);

            if scale < last_scale {
                propagate_block_down_tsdf(block, scale, ctx.max_weight);
            }
            block.set_current_scale(scale);

            let stride = 1 << scale;
            let coord = block.coord();
            for z in (0..BLOCK_SIZE).step_by(stride as usize) {
                for y in (0..BLOCK_SIZE).step_by(stride as usize) {
                    for x in (0..BLOCK_SIZE).step_by(stride as usize) {
                        ctx.fuse_voxel(block, coord + VoxelCoord::new(x, y, z), scale);
                    }
                }
            }

            propagate_block_up_tsdf(block, scale);
        },
    );
    propagate_timestamp_to_root(map.octree_mut(), blocks, frame);
}

fn block_jobs(map: &TsdfMap, blocks: &[BlockIdx]) -> Vec<Option<()>> {
    let mut jobs = vec![None; map.octree().block_slot_count()];
    for &idx in blocks {
        jobs[idx.index()] = Some(());
    }
    jobs
}
