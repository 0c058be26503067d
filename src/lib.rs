//! # GhanaMap: Volumetric 3D Mapping for Dense SLAM
//!
//! A sparse multi-resolution voxel mapping library: an octree of
//! fixed-size voxel blocks, integration kernels fusing depth images or
//! range rays into a TSDF or log-odds occupancy field, and a raycaster
//! for surface queries.
//!
//! # Architecture
//!
//! The crate is organized into 5 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   raycaster                         │  ← Surface queries
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  integrator/                        │  ← Fusion pipeline
//! │     (carvers, TSDF/occupancy kernels, rays)         │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                octree/ + map                        │  ← Sparse storage
//! │   (octants, blocks, visitor, propagator, frames)    │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   sensor/                           │  ← Projection models
//! │              (pinhole, lidar)                       │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │             (voxels, data, images)                  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline
//!
//! One frame flows through strictly ordered stages: the allocator
//! materializes the blocks a measurement touches (ray carving for TSDF,
//! hierarchical volume carving for occupancy), the updater runs its
//! fusion kernel on every block in parallel, and the propagator lifts
//! aggregates through the tree so queries and the raycaster can skip
//! space hierarchically.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ghana_map::{
//!     MapConfig, MapIntegrator, Measurements, OccupancyConfig, OccupancyMap,
//! };
//! use ghana_map::core::DepthImage;
//! use ghana_map::sensor::{PinholeCamera, PinholeCameraConfig};
//! use nalgebra::Isometry3;
//!
//! let mut map = OccupancyMap::new(&MapConfig::default(), OccupancyConfig::default()).unwrap();
//! let sensor = PinholeCamera::new(PinholeCameraConfig::default());
//! let integrator = MapIntegrator::default();
//!
//! let depth = DepthImage::new(640, 480, 2.0);
//! let pose = Isometry3::identity();
//! let touched = integrator.integrate_depth_occupancy(
//!     &mut map,
//!     &Measurements::depth_only(&sensor, &depth, pose),
//!     0,
//! );
//! println!("updated {} blocks", touched.len());
//! ```
//!
//! # Coordinate Frames
//!
//! World coordinates are metric and right-handed; the map cube spans
//! `[origin, origin + dim)`. Voxel coordinates are integer cell indices
//! within the cube, and sampling is cell-centered.

pub mod config;
pub mod core;
pub mod error;
pub mod integrator;
pub mod map;
pub mod octree;
pub mod raycaster;
pub mod sensor;

pub use config::{
    IntegratorConfig, MapConfig, MappingConfig, OccupancyConfig, Scheduling, TsdfConfig,
    TsdfResolution,
};
pub use error::{MapError, Result};
pub use integrator::{DepthMeasurement, MapIntegrator, Measurements};
pub use map::{OccupancyMap, TsdfMap, VoxelMap};
pub use raycaster::{
    raycast_occupancy, raycast_tsdf, raycast_volume_occupancy, raycast_volume_tsdf, SurfaceHit,
};

#[cfg(feature = "colour")]
pub use integrator::ColourMeasurement;
