//! Configuration for the map, the field models and the integrator.
//!
//! All sections derive serde so a complete mapping setup can be loaded
//! from a single TOML file:
//!
//! ```toml
//! [map]
//! resolution = 0.05
//! size = 512
//!
//! [tsdf]
//! truncation_boundary_factor = 8.0
//!
//! [occupancy]
//! log_odd_min = -5.015
//! ```

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MapError, Result};

/// Geometry of the voxel map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Voxel edge length in meters.
    pub resolution: f32,

    /// Requested map side length in voxels.
    ///
    /// Rounded up to the next power of two that is at least two voxel
    /// blocks wide.
    pub size: i32,

    /// World position of the corner of voxel (0, 0, 0) in meters.
    ///
    /// The default centers the map cube on the world origin.
    pub origin: [f32; 3],
}

impl Default for MapConfig {
    fn default() -> Self {
        let resolution = 0.05; // 5cm voxels
        let size = 512; // 25.6m per side
        Self {
            resolution,
            size,
            origin: [-0.5 * size as f32 * resolution; 3],
        }
    }
}

impl MapConfig {
    /// Map side length in meters (before power-of-two rounding).
    pub fn dim(&self) -> f32 {
        self.size as f32 * self.resolution
    }

    /// World position of the corner of voxel (0, 0, 0).
    pub fn origin_point(&self) -> Point3<f32> {
        Point3::new(self.origin[0], self.origin[1], self.origin[2])
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.resolution > 0.0) {
            return Err(MapError::Config(format!(
                "map resolution must be positive, got {}",
                self.resolution
            )));
        }
        if self.size <= 0 {
            return Err(MapError::Config(format!(
                "map size must be positive, got {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// TSDF field configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsdfConfig {
    /// Half-width of the truncation band, in voxels.
    ///
    /// The metric truncation boundary is this factor times the map
    /// resolution.
    pub truncation_boundary_factor: f32,

    /// Maximum fusion weight per voxel.
    ///
    /// Caps the running average so the field stays responsive to change.
    pub max_weight: f32,

    /// Resolution mode of the integration kernel.
    pub resolution: TsdfResolution,
}

impl Default for TsdfConfig {
    fn default() -> Self {
        Self {
            truncation_boundary_factor: 8.0, // 40cm band at 5cm voxels
            max_weight: 100.0,
            resolution: TsdfResolution::Multi,
        }
    }
}

impl TsdfConfig {
    /// Metric truncation boundary for a given map resolution.
    pub fn truncation_boundary(&self, map_res: f32) -> f32 {
        self.truncation_boundary_factor * map_res
    }
}

/// Whether TSDF integration runs at a fixed per-voxel scale or selects
/// the scale per block from the sensor footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsdfResolution {
    /// Always integrate at scale 0.
    Single,
    /// Adaptive scale selection with down/up propagation.
    Multi,
}

/// Log-odds occupancy field configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyConfig {
    /// Log-odds increment of a fully free observation.
    ///
    /// Negative value. Typical: -5.015
    pub log_odd_min: f32,

    /// Log-odds increment cap of an occupied observation.
    pub log_odd_max: f32,

    /// Maximum fusion weight per voxel.
    pub max_weight: f32,

    /// Field value separating free from occupied space.
    ///
    /// log(0.5) = 0 in log-odds.
    pub surface_boundary: f32,

    /// Scale used when integrating uniform free space into a block.
    pub fs_integr_scale: i32,

    /// Slope of the surface-thickness parameter tau over range.
    pub k_tau: f32,

    /// Slope of the measurement-noise parameter sigma over range.
    pub k_sigma: f32,

    /// Lower clamp of tau, in voxels.
    pub tau_min_factor: f32,

    /// Upper clamp of tau, in voxels.
    pub tau_max_factor: f32,

    /// Lower clamp of three sigma, in voxels.
    pub sigma_min_factor: f32,

    /// Upper clamp of three sigma, in voxels.
    pub sigma_max_factor: f32,

    /// Largest node side, in voxels, collapsed as uniform free space by
    /// the volume carver.
    pub max_free_node_size: i32,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            log_odd_min: -5.015,
            log_odd_max: 5.015,
            max_weight: 100.0,
            surface_boundary: 0.0,
            fs_integr_scale: 1,
            k_tau: 0.026,
            k_sigma: 0.052,
            tau_min_factor: 3.0,
            tau_max_factor: 12.0,
            sigma_min_factor: 1.0,
            sigma_max_factor: 3.0,
            max_free_node_size: 64,
        }
    }
}

impl OccupancyConfig {
    /// Most negative reachable field value: `log_odd_min * max_weight`.
    pub fn min_occupancy(&self) -> f32 {
        self.log_odd_min * self.max_weight
    }

    /// Surface thickness at the given range, clamped to its voxel bounds.
    pub fn tau(&self, range: f32, map_res: f32) -> f32 {
        (self.k_tau * range).clamp(
            self.tau_min_factor * map_res,
            self.tau_max_factor * map_res,
        )
    }

    /// Three-sigma measurement uncertainty at the given range, clamped to
    /// its voxel bounds.
    pub fn three_sigma(&self, range: f32, map_res: f32) -> f32 {
        (3.0 * self.k_sigma * range).clamp(
            self.sigma_min_factor * map_res,
            self.sigma_max_factor * map_res,
        )
    }
}

/// How a pipeline stage distributes its independent work units.
///
/// Kernels are written once; this hook selects the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheduling {
    /// Work-stealing thread pool (rayon).
    #[default]
    WorkStealing,
    /// Single-threaded execution, useful for debugging and determinism.
    Serial,
}

/// Integrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegratorConfig {
    /// Scheduling of block-parallel and pixel-parallel stages.
    pub scheduling: Scheduling,
}

/// Complete mapping configuration, loadable from one TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub tsdf: TsdfConfig,
    #[serde(default)]
    pub occupancy: OccupancyConfig,
    #[serde(default)]
    pub integrator: IntegratorConfig,
}

impl MappingConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: MappingConfig = toml::from_str(&text)?;
        config.map.validate()?;
        Ok(config)
    }
}
