//! Spinning LiDAR model with an azimuth/elevation range image.

use nalgebra::{Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

use super::{integration_scale_with_hysteresis, Projection, SensorModel};

/// Spherical range-image LiDAR parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SphericalLidarConfig {
    /// Azimuth bins over a full revolution.
    pub width: usize,

    /// Number of beams.
    pub height: usize,

    /// Elevation of the highest beam in radians.
    pub elevation_max: f32,

    /// Elevation of the lowest beam in radians.
    pub elevation_min: f32,

    /// Closest valid range in meters.
    pub near_range: f32,

    /// Farthest valid range in meters.
    pub far_range: f32,
}

impl Default for SphericalLidarConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 64,
            elevation_max: 16.6f32.to_radians(),
            elevation_min: -16.6f32.to_radians(),
            near_range: 0.5,
            far_range: 50.0,
        }
    }
}

/// Spinning LiDAR producing a range image.
///
/// The measurement stored per pixel is the range (Euclidean distance)
/// of the return, so the depth limits are the same along every ray.
#[derive(Debug, Clone)]
pub struct SphericalLidar {
    config: SphericalLidarConfig,
    /// Azimuth step between columns in radians.
    azimuth_res: f32,
    /// Elevation step between beams in radians.
    elevation_res: f32,
}

impl SphericalLidar {
    pub fn new(config: SphericalLidarConfig) -> Self {
        let azimuth_res = TAU / config.width as f32;
        let elevation_res =
            (config.elevation_max - config.elevation_min) / (config.height as f32 - 1.0).max(1.0);
        Self {
            config,
            azimuth_res,
            elevation_res,
        }
    }

    pub fn config(&self) -> &SphericalLidarConfig {
        &self.config
    }
}

impl SensorModel for SphericalLidar {
    fn width(&self) -> usize {
        self.config.width
    }

    fn height(&self) -> usize {
        self.config.height
    }

    fn project(&self, point_s: &Point3<f32>) -> Projection {
        let range = point_s.coords.norm();
        if range < 1e-6 {
            return Projection::BehindSensor;
        }
        // Azimuth increases counter-clockwise from +x; wrap to [0, 2pi).
        let azimuth = point_s.y.atan2(point_s.x).rem_euclid(TAU);
        let elevation = (point_s.z / range).asin();
        let u = azimuth / self.azimuth_res;
        let v = (self.config.elevation_max - elevation) / self.elevation_res;
        if v < -0.5 || v > self.config.height as f32 - 0.5 {
            return Projection::OutsideImage;
        }
        // Wrap the azimuth column into the image.
        let u = u.rem_euclid(self.config.width as f32);
        Projection::Ok(Vector2::new(u, v))
    }

    fn back_project(&self, pixel: &Vector2<f32>) -> Vector3<f32> {
        let azimuth = pixel.x * self.azimuth_res;
        let elevation = self.config.elevation_max - pixel.y * self.elevation_res;
        // Unit vector, so measurement_from_point of the direction is 1.
        Vector3::new(
            elevation.cos() * azimuth.cos(),
            elevation.cos() * azimuth.sin(),
            elevation.sin(),
        )
    }

    fn near_dist(&self, _ray_dir_s: &Vector3<f32>) -> f32 {
        self.config.near_range
    }

    fn far_dist(&self, _ray_dir_s: &Vector3<f32>) -> f32 {
        self.config.far_range
    }

    fn measurement_from_point(&self, point_s: &Point3<f32>) -> f32 {
        point_s.coords.norm()
    }

    fn compute_integration_scale(
        &self,
        block_centre_s: &Point3<f32>,
        voxel_dim: f32,
        last_scale: i32,
        min_scale: i32,
        max_scale: i32,
    ) -> i32 {
        // Angular footprint of one range-image cell, linearized per meter.
        let footprint = self.azimuth_res.max(self.elevation_res);
        integration_scale_with_hysteresis(
            footprint,
            block_centre_s.coords.norm(),
            voxel_dim,
            last_scale,
            min_scale,
            max_scale,
        )
    }

    fn sphere_in_frustum(&self, centre_s: &Point3<f32>, radius: f32) -> bool {
        let range = centre_s.coords.norm();
        if range - radius > self.config.far_range {
            return false;
        }
        if range + radius < self.config.near_range {
            return false;
        }
        if range <= radius {
            // The sensor is inside the sphere.
            return true;
        }
        let elevation = (centre_s.z / range).asin();
        let margin = (radius / range).min(1.0).asin();
        elevation - margin <= self.config.elevation_max
            && elevation + margin >= self.config.elevation_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lidar() -> SphericalLidar {
        SphericalLidar::new(SphericalLidarConfig::default())
    }

    #[test]
    fn test_project_back_project_round_trip() {
        let sensor = lidar();
        let pixel = Vector2::new(100.0, 20.0);
        let dir = sensor.back_project(&pixel);
        assert!((dir.norm() - 1.0).abs() < 1e-5, "unit measurement direction");
        let reprojected = sensor.project(&Point3::from(dir * 8.0)).ok().unwrap();
        assert!((reprojected - pixel).norm() < 1e-3);
    }

    #[test]
    fn test_point_above_beams_is_outside() {
        let sensor = lidar();
        assert_eq!(
            sensor.project(&Point3::new(1.0, 0.0, 5.0)),
            Projection::OutsideImage
        );
    }

    #[test]
    fn test_azimuth_wraps() {
        let sensor = lidar();
        // Slightly negative azimuth wraps to the top of the column range.
        let p = Point3::new(1.0, -0.001, 0.0);
        let pixel = sensor.project(&p).ok().unwrap();
        assert!(pixel.x > sensor.config.width as f32 - 1.0);
    }

    #[test]
    fn test_frustum_is_direction_dependent() {
        let sensor = lidar();
        assert!(sensor.sphere_in_frustum(&Point3::new(5.0, 0.0, 0.0), 0.5));
        // Straight up, far outside the elevation band.
        assert!(!sensor.sphere_in_frustum(&Point3::new(0.0, 0.0, 5.0), 0.5));
        assert!(!sensor.sphere_in_frustum(&Point3::new(100.0, 0.0, 0.0), 0.5));
    }
}
