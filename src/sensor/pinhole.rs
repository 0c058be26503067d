//! Pinhole depth camera model.

use nalgebra::{Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::{integration_scale_with_hysteresis, Projection, SensorModel};

/// Pinhole camera intrinsics and depth limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinholeCameraConfig {
    /// Image width in pixels.
    pub width: usize,

    /// Image height in pixels.
    pub height: usize,

    /// Focal length in pixels, x axis.
    pub fx: f32,

    /// Focal length in pixels, y axis.
    pub fy: f32,

    /// Principal point, x axis.
    pub cx: f32,

    /// Principal point, y axis.
    pub cy: f32,

    /// Closest valid depth in meters.
    pub near_plane: f32,

    /// Farthest valid depth in meters.
    pub far_plane: f32,
}

impl Default for PinholeCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            near_plane: 0.4,
            far_plane: 6.0,
        }
    }
}

/// Pinhole depth camera looking down +z in the sensor frame.
///
/// The measurement stored in a depth image is the z coordinate of the
/// measured point.
#[derive(Debug, Clone)]
pub struct PinholeCamera {
    config: PinholeCameraConfig,
    /// Linear size one pixel subtends at unit depth.
    pixel_footprint: f32,
    /// Outward normals of the four side frustum planes, through the origin.
    frustum_normals: [Vector3<f32>; 4],
}

impl PinholeCamera {
    pub fn new(config: PinholeCameraConfig) -> Self {
        let pixel_footprint = 1.0 / config.fx;
        // Normalized image-plane offsets of the four image edges.
        let x_l = (0.0 - config.cx) / config.fx;
        let x_r = (config.width as f32 - config.cx) / config.fx;
        let y_t = (0.0 - config.cy) / config.fy;
        let y_b = (config.height as f32 - config.cy) / config.fy;
        // Inward-facing normals of the side planes through the origin:
        // a point is inside a plane when its dot product is positive.
        let frustum_normals = [
            Vector3::new(1.0, 0.0, -x_l).normalize(),
            Vector3::new(-1.0, 0.0, x_r).normalize(),
            Vector3::new(0.0, 1.0, -y_t).normalize(),
            Vector3::new(0.0, -1.0, y_b).normalize(),
        ];
        Self {
            config,
            pixel_footprint,
            frustum_normals,
        }
    }

    pub fn config(&self) -> &PinholeCameraConfig {
        &self.config
    }

    pub fn near_plane(&self) -> f32 {
        self.config.near_plane
    }

    pub fn far_plane(&self) -> f32 {
        self.config.far_plane
    }
}

impl SensorModel for PinholeCamera {
    fn width(&self) -> usize {
        self.config.width
    }

    fn height(&self) -> usize {
        self.config.height
    }

    fn project(&self, point_s: &Point3<f32>) -> Projection {
        if point_s.z <= 0.0 {
            return Projection::BehindSensor;
        }
        let u = self.config.fx * point_s.x / point_s.z + self.config.cx;
        let v = self.config.fy * point_s.y / point_s.z + self.config.cy;
        if u < -0.5
            || v < -0.5
            || u > self.config.width as f32 - 0.5
            || v > self.config.height as f32 - 0.5
        {
            return Projection::OutsideImage;
        }
        Projection::Ok(Vector2::new(u, v))
    }

    fn back_project(&self, pixel: &Vector2<f32>) -> Vector3<f32> {
        // z = 1, so measurement_from_point of the direction is 1.
        Vector3::new(
            (pixel.x - self.config.cx) / self.config.fx,
            (pixel.y - self.config.cy) / self.config.fy,
            1.0,
        )
    }

    fn near_dist(&self, _ray_dir_s: &Vector3<f32>) -> f32 {
        self.config.near_plane
    }

    /// Distance along the ray at which the z coordinate reaches the far
    /// plane.
    fn far_dist(&self, ray_dir_s: &Vector3<f32>) -> f32 {
        if ray_dir_s.z <= 0.0 {
            return 0.0;
        }
        self.config.far_plane * ray_dir_s.norm() / ray_dir_s.z
    }

    fn measurement_from_point(&self, point_s: &Point3<f32>) -> f32 {
        point_s.z
    }

    fn compute_integration_scale(
        &self,
        block_centre_s: &Point3<f32>,
        voxel_dim: f32,
        last_scale: i32,
        min_scale: i32,
        max_scale: i32,
    ) -> i32 {
        integration_scale_with_hysteresis(
            self.pixel_footprint,
            block_centre_s.z,
            voxel_dim,
            last_scale,
            min_scale,
            max_scale,
        )
    }

    fn sphere_in_frustum(&self, centre_s: &Point3<f32>, radius: f32) -> bool {
        if centre_s.z + radius < self.config.near_plane {
            return false;
        }
        if centre_s.z - radius > self.config.far_plane {
            return false;
        }
        self.frustum_normals
            .iter()
            .all(|n| n.dot(&centre_s.coords) > -radius)
    }
}
