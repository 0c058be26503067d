//! Frame integration: allocation, per-block fusion, propagation.
//!
//! One frame moves through three strictly ordered stages:
//!
//! ```text
//! allocator ─> parallel block update ─> propagation to the root
//! ```
//!
//! The allocator is the only stage that creates octants; the update
//! stage mutates disjoint blocks in parallel; propagation rebuilds the
//! ancestor aggregates. The TSDF pipeline allocates by carving along
//! each depth pixel's ray; the occupancy pipeline carves the frustum
//! volume hierarchically and additionally frees whole subtrees.

pub(crate) mod occupancy_updater;
pub(crate) mod ray_integrator;
pub(crate) mod raycast_carver;
pub(crate) mod tsdf_updater;
pub(crate) mod volume_carver;

use log::debug;
use nalgebra::{Isometry3, Vector3};
use rayon::prelude::*;

use crate::config::{IntegratorConfig, Scheduling, TsdfResolution};
use crate::core::DepthImage;
use crate::map::{OccupancyMap, TsdfMap};
use crate::octree::{BlockIdx, Timestamp};
use crate::sensor::SensorModel;

/// A depth image with the sensor that produced it and its world pose.
pub struct DepthMeasurement<'a, S: SensorModel> {
    pub sensor: &'a S,
    pub image: &'a DepthImage,
    /// Sensor-to-world transform.
    pub t_ws: Isometry3<f32>,
}

/// A colour image with its own sensor model and world pose.
#[cfg(feature = "colour")]
pub struct ColourMeasurement<'a, S: SensorModel> {
    pub sensor: &'a S,
    pub image: &'a crate::core::Image<crate::core::ColourData>,
    pub t_ws: Isometry3<f32>,
}

/// The measurement bundle entering the core for one frame.
pub struct Measurements<'a, S: SensorModel> {
    pub depth: DepthMeasurement<'a, S>,
    #[cfg(feature = "colour")]
    pub colour: Option<ColourMeasurement<'a, S>>,
}

impl<'a, S: SensorModel> Measurements<'a, S> {
    /// A depth-only bundle.
    pub fn depth_only(sensor: &'a S, image: &'a DepthImage, t_ws: Isometry3<f32>) -> Self {
        Self {
            depth: DepthMeasurement {
                sensor,
                image,
                t_ws,
            },
            #[cfg(feature = "colour")]
            colour: None,
        }
    }
}

/// Drives integration of measurements into a map.
#[derive(Debug, Clone, Default)]
pub struct MapIntegrator {
    config: IntegratorConfig,
}

impl MapIntegrator {
    pub fn new(config: IntegratorConfig) -> Self {
        Self { config }
    }

    /// Integrate a depth frame into a TSDF map.
    ///
    /// Returns the blocks touched this frame.
    pub fn integrate_depth_tsdf<S: SensorModel>(
        &self,
        map: &mut TsdfMap,
        measurements: &Measurements<'_, S>,
        frame: Timestamp,
    ) -> Vec<BlockIdx> {
        let tau = map.config().truncation_boundary(map.resolution());
        let blocks = raycast_carver::allocate(
            map,
            measurements.depth.sensor,
            measurements.depth.image,
            &measurements.depth.t_ws,
            2.0 * tau,
            self.config.scheduling,
        );
        debug!(
            "frame {frame}: raycast carving touched {} blocks ({} allocated total)",
            blocks.len(),
            map.octree().block_count()
        );
        match map.config().resolution {
            TsdfResolution::Single => {
                tsdf_updater::update_single(map, &blocks, measurements, frame, self.config.scheduling)
            }
            TsdfResolution::Multi => {
                tsdf_updater::update_multi(map, &blocks, measurements, frame, self.config.scheduling)
            }
        }
        blocks
    }

    /// Integrate a depth frame into an occupancy map.
    ///
    /// Returns the blocks surviving this frame (freed subtrees may prune
    /// blocks that were touched).
    pub fn integrate_depth_occupancy<S: SensorModel>(
        &self,
        map: &mut OccupancyMap,
        measurements: &Measurements<'_, S>,
        frame: Timestamp,
    ) -> Vec<BlockIdx> {
        let allocation = volume_carver::carve(
            map,
            measurements.depth.sensor,
            measurements.depth.image,
            &measurements.depth.t_ws,
        );
        debug!(
            "frame {frame}: volume carving produced {} blocks, {} free nodes",
            allocation.block_list.len(),
            allocation.node_list.len()
        );
        occupancy_updater::update(
            map,
            measurements.depth.sensor,
            measurements.depth.image,
            &measurements.depth.t_ws,
            frame,
            allocation,
            self.config.scheduling,
        )
    }

    /// Integrate a single range ray into an occupancy map.
    ///
    /// `ray_s` is the measured point in the sensor frame.
    pub fn integrate_ray<S: SensorModel>(
        &self,
        map: &mut OccupancyMap,
        sensor: &S,
        ray_s: &Vector3<f32>,
        t_ws: &Isometry3<f32>,
        frame: Timestamp,
    ) -> Vec<BlockIdx> {
        let mut integrator = ray_integrator::RayIntegrator::new(map, sensor, frame);
        integrator.integrate(ray_s, t_ws);
        integrator.finish()
    }

    /// Integrate a time-interval batch of (pose, ray) pairs, deferring
    /// propagation until the whole batch is fused.
    pub fn integrate_ray_batch<S: SensorModel>(
        &self,
        map: &mut OccupancyMap,
        sensor: &S,
        batch: &[(Isometry3<f32>, Vector3<f32>)],
        frame: Timestamp,
    ) -> Vec<BlockIdx> {
        let mut integrator = ray_integrator::RayIntegrator::new(map, sensor, frame);
        for (t_ws, ray_s) in batch {
            integrator.integrate(ray_s, t_ws);
        }
        integrator.finish()
    }
}

/// Run a kernel over the selected blocks of the arena, in parallel or
/// serially depending on the scheduling hook. `jobs` maps arena slots to
/// per-block kernel input.
pub(crate) fn for_each_block<B, T, F>(
    scheduling: Scheduling,
    blocks: &mut [B],
    jobs: &[Option<T>],
    kernel: F,
) where
    B: Send,
    T: Sync,
    F: Fn(&mut B, &T) + Send + Sync,
{
    debug_assert!(jobs.len() <= blocks.len());
    match scheduling {
        Scheduling::WorkStealing => {
            blocks
                .par_iter_mut()
                .zip(jobs.par_iter())
                .for_each(|(block, job)| {
                    if let Some(job) = job {
                        kernel(block, job);
                    }
                });
        }
        Scheduling::Serial => {
            for (block, job) in blocks.iter_mut().zip(jobs.iter()) {
                if let Some(job) = job {
                    kernel(block, job);
                }
            }
        }
    }
}

/// Map pixel indices to values, in parallel or serially.
pub(crate) fn map_pixels<T, F>(scheduling: Scheduling, count: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Send + Sync,
{
    match scheduling {
        Scheduling::WorkStealing => (0..count).into_par_iter().map(f).collect(),
        Scheduling::Serial => (0..count).map(f).collect(),
    }
}
