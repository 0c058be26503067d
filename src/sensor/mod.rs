//! Sensor models consumed by the allocators, updaters and raycaster.
//!
//! A sensor model maps between 3D points in the sensor frame and image
//! pixels, bounds the measurable range per ray direction, and recommends
//! the block integration scale from the projected voxel footprint.
//!
//! Two models are provided: [`PinholeCamera`] for depth cameras (the
//! measurement is the z coordinate) and [`SphericalLidar`] for spinning
//! LiDARs (the measurement is the range, and the depth limits are per
//! direction).

mod lidar;
mod pinhole;

pub use lidar::{SphericalLidar, SphericalLidarConfig};
pub use pinhole::{PinholeCamera, PinholeCameraConfig};

use nalgebra::{Point3, Vector2, Vector3};

use crate::core::DepthImage;

/// Outcome of projecting a sensor-frame point into the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// The point projects to this pixel.
    Ok(Vector2<f32>),
    /// The point is behind the sensor.
    BehindSensor,
    /// The point projects outside the image bounds.
    OutsideImage,
}

impl Projection {
    /// The pixel if projection succeeded.
    #[inline]
    pub fn ok(self) -> Option<Vector2<f32>> {
        match self {
            Projection::Ok(pixel) => Some(pixel),
            _ => None,
        }
    }
}

/// The sensor contract.
///
/// Directions passed to `near_dist`/`far_dist` and returned by
/// `back_project` satisfy `measurement_from_point(dir) == 1`, so a
/// measurement value `m` places the measured point at `dir * m`.
pub trait SensorModel: Send + Sync {
    /// Image width in pixels.
    fn width(&self) -> usize;

    /// Image height in pixels.
    fn height(&self) -> usize;

    /// Project a sensor-frame point into the image.
    fn project(&self, point_s: &Point3<f32>) -> Projection;

    /// Ray direction through a pixel, scaled to unit measurement.
    fn back_project(&self, pixel: &Vector2<f32>) -> Vector3<f32>;

    /// Closest measurable distance along the given ray direction.
    fn near_dist(&self, ray_dir_s: &Vector3<f32>) -> f32;

    /// Farthest measurable distance along the given ray direction.
    fn far_dist(&self, ray_dir_s: &Vector3<f32>) -> f32;

    /// The scalar a depth image stores for this point: z-depth for a
    /// pinhole camera, range for a LiDAR.
    fn measurement_from_point(&self, point_s: &Point3<f32>) -> f32;

    /// Recommend a block integration scale from the projected size of a
    /// voxel at the block centre, with hysteresis around the last scale.
    fn compute_integration_scale(
        &self,
        block_centre_s: &Point3<f32>,
        voxel_dim: f32,
        last_scale: i32,
        min_scale: i32,
        max_scale: i32,
    ) -> i32;

    /// Conservative test whether a sphere intersects the sensor frustum.
    fn sphere_in_frustum(&self, centre_s: &Point3<f32>, radius: f32) -> bool;

    /// Project a point and fetch the depth measurement it lands on.
    ///
    /// Returns `None` on projection failure or when the stored depth is
    /// below the near plane (no measurement).
    fn depth_at(&self, point_s: &Point3<f32>, depth_img: &DepthImage) -> Option<f32> {
        let pixel = self.project(point_s).ok()?;
        let depth = *depth_img.get(pixel.x.round() as i32, pixel.y.round() as i32)?;
        if depth >= self.near_dist(&(point_s.coords / self.measurement_from_point(point_s))) {
            Some(depth)
        } else {
            None
        }
    }
}

/// Integration-scale selection shared by the sensor models.
///
/// `footprint` is the linear size in meters that one pixel subtends at
/// the block centre. Hysteresis of a quarter meter keeps a block from
/// oscillating between scales at a ratio boundary.
pub(crate) fn integration_scale_with_hysteresis(
    footprint_per_meter: f32,
    dist: f32,
    voxel_dim: f32,
    last_scale: i32,
    min_scale: i32,
    max_scale: i32,
) -> i32 {
    const HYSTERESIS_M: f32 = 0.25;

    let scale_for = |d: f32| -> i32 {
        if d <= 0.0 {
            return 0;
        }
        let ratio = d * footprint_per_meter / voxel_dim;
        if ratio < 1.5 {
            0
        } else if ratio < 3.0 {
            1
        } else if ratio < 6.0 {
            2
        } else {
            3
        }
    };

    let base = scale_for(dist);
    let scale = if min_scale >= 0 && base != last_scale {
        // Recompute with the distance nudged toward the last scale.
        let nudged = if base > last_scale {
            dist - HYSTERESIS_M
        } else {
            dist + HYSTERESIS_M
        };
        scale_for(nudged)
    } else {
        base
    };
    scale.clamp(0, max_scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_grows_with_distance() {
        let footprint = 0.002; // 2mm per pixel per meter
        let voxel = 0.01;
        let near = integration_scale_with_hysteresis(footprint, 1.0, voxel, 0, -1, 3);
        let far = integration_scale_with_hysteresis(footprint, 40.0, voxel, 0, -1, 3);
        assert_eq!(near, 0);
        assert!(far > near);
    }

    #[test]
    fn test_hysteresis_resists_small_changes() {
        let footprint = 0.002;
        let voxel = 0.01;
        // 7.5m is exactly the 1.5-ratio boundary between scales 0 and 1.
        let at_boundary = integration_scale_with_hysteresis(footprint, 7.6, voxel, 0, 0, 3);
        assert_eq!(at_boundary, 0, "just past the boundary stays at the last scale");
        let well_past = integration_scale_with_hysteresis(footprint, 9.0, voxel, 0, 0, 3);
        assert_eq!(well_past, 1);
    }
}
