//! The map: an octree bound to a world frame and a metric resolution.
//!
//! [`TsdfMap`] and [`OccupancyMap`] wrap the two octree flavours with
//! the voxel/point conversions and the query surface consumed by
//! meshing, raycasting and rendering. All queries return an `Option`;
//! `None` signals "outside the map", "not allocated" or "invalid".
//!
//! Sampling is cell-centered: the point of voxel `v` at stride `s` is
//! the centre of its cube, `origin + (v + s/2) * resolution`.

use nalgebra::{Isometry3, Point3, Vector3};

use crate::config::{MapConfig, OccupancyConfig, TsdfConfig};
use crate::core::voxel::VoxelCoord;
use crate::error::Result;
use crate::octree::iterator::FrustumIter;
use crate::octree::{visitor, BlockIdx, OccupancyBlock, Octree, TsdfBlock, VoxelBlock};
use crate::sensor::SensorModel;

/// A voxel map over one field variant.
#[derive(Debug)]
pub struct VoxelMap<B: VoxelBlock, C> {
    pub(crate) octree: Octree<B>,
    resolution: f32,
    origin_w: Point3<f32>,
    data_config: C,
}

/// TSDF flavour of the map.
pub type TsdfMap = VoxelMap<TsdfBlock, TsdfConfig>;

/// Log-odds occupancy flavour of the map.
pub type OccupancyMap = VoxelMap<OccupancyBlock, OccupancyConfig>;

impl<B: VoxelBlock, C> VoxelMap<B, C> {
    pub fn new(map_config: &MapConfig, data_config: C) -> Result<Self> {
        map_config.validate()?;
        Ok(Self {
            octree: Octree::new(map_config.size),
            resolution: map_config.resolution,
            origin_w: map_config.origin_point(),
            data_config,
        })
    }

    /// Voxel edge length in meters.
    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    /// Map side length in meters.
    pub fn dim(&self) -> f32 {
        self.octree.size() as f32 * self.resolution
    }

    /// World position of the corner of voxel (0, 0, 0).
    pub fn origin(&self) -> Point3<f32> {
        self.origin_w
    }

    pub fn octree(&self) -> &Octree<B> {
        &self.octree
    }

    pub fn octree_mut(&mut self) -> &mut Octree<B> {
        &mut self.octree
    }

    pub fn config(&self) -> &C {
        &self.data_config
    }

    /// Whether a world point lies inside the map cube.
    pub fn contains(&self, point_w: &Point3<f32>) -> bool {
        let local = point_w - self.origin_w;
        let dim = self.dim();
        local.x >= 0.0
            && local.x < dim
            && local.y >= 0.0
            && local.y < dim
            && local.z >= 0.0
            && local.z < dim
    }

    /// Voxel containing a world point, `None` outside the map.
    pub fn point_to_voxel(&self, point_w: &Point3<f32>) -> Option<VoxelCoord> {
        if !self.contains(point_w) {
            return None;
        }
        Some(VoxelCoord::from_point_floor(&self.point_to_voxel_f(point_w)))
    }

    /// Fractional voxel coordinates of a world point, unbounded.
    pub fn point_to_voxel_f(&self, point_w: &Point3<f32>) -> Point3<f32> {
        ((point_w - self.origin_w) / self.resolution).into()
    }

    /// Centre of a voxel cube of the given stride, in world coordinates.
    pub fn voxel_to_point(&self, voxel: VoxelCoord, stride: i32) -> Point3<f32> {
        let half = 0.5 * stride as f32;
        self.origin_w
            + (Vector3::from(voxel) + Vector3::new(half, half, half)) * self.resolution
    }

    /// World point of fractional voxel coordinates.
    pub fn voxel_f_to_point(&self, voxel_f: &Point3<f32>) -> Point3<f32> {
        self.origin_w + voxel_f.coords * self.resolution
    }

    /// Data of the finest allocated octant containing a world point.
    ///
    /// Debug-asserts containment; prefer [`Self::get_data_safe`] for
    /// unvalidated inputs.
    pub fn get_data(&self, point_w: &Point3<f32>) -> Option<B::Data> {
        debug_assert!(self.contains(point_w));
        self.get_data_safe(point_w)
    }

    /// Bounds-checked variant of [`Self::get_data`].
    pub fn get_data_safe(&self, point_w: &Point3<f32>) -> Option<B::Data> {
        let voxel = self.point_to_voxel(point_w)?;
        visitor::get_data(&self.octree, voxel)
    }

    /// Field value at a world point, `None` when invalid.
    pub fn get_field(&self, point_w: &Point3<f32>) -> Option<f32> {
        let voxel = self.point_to_voxel(point_w)?;
        visitor::get_field(&self.octree, voxel)
    }

    /// Trilinearly interpolated field at a world point.
    pub fn get_field_interp(&self, point_w: &Point3<f32>) -> Option<f32> {
        self.get_field_interp_at(point_w, 0).map(|(v, _)| v)
    }

    /// Interpolated field at a desired scale; returns the value and the
    /// scale actually used (never finer than desired).
    pub fn get_field_interp_at(
        &self,
        point_w: &Point3<f32>,
        desired_scale: i32,
    ) -> Option<(f32, i32)> {
        if !self.contains(point_w) {
            return None;
        }
        visitor::get_field_interp(&self.octree, &self.point_to_voxel_f(point_w), desired_scale)
    }

    /// Field gradient at a world point, in field units per meter.
    pub fn get_field_grad(&self, point_w: &Point3<f32>) -> Option<Vector3<f32>> {
        if !self.contains(point_w) {
            return None;
        }
        visitor::get_field_grad(&self.octree, &self.point_to_voxel_f(point_w), 0)
            .map(|(g, _)| g / self.resolution)
    }

    /// Interpolated colour at a world point.
    #[cfg(feature = "colour")]
    pub fn get_colour_interp(&self, point_w: &Point3<f32>) -> Option<crate::core::ColourData> {
        if !self.contains(point_w) {
            return None;
        }
        visitor::get_colour_interp(&self.octree, &self.point_to_voxel_f(point_w), 0)
            .map(|(c, _)| c)
    }

    /// Blocks whose bounding sphere intersects the sensor frustum.
    ///
    /// `t_ws` is the sensor pose in the world frame.
    pub fn frustum_blocks<'a, S: SensorModel>(
        &'a self,
        sensor: &'a S,
        t_ws: &Isometry3<f32>,
    ) -> impl Iterator<Item = BlockIdx> + 'a {
        FrustumIter::new(
            &self.octree,
            sensor,
            t_ws.inverse(),
            self.resolution,
            self.origin_w,
        )
    }
}

impl OccupancyMap {
    /// Max occupancy aggregate covering a world point at a scale.
    pub fn get_max_data(&self, point_w: &Point3<f32>, scale: i32) -> Option<crate::core::OccupancyData> {
        let voxel = self.point_to_voxel(point_w)?;
        Some(visitor::get_max_data(&self.octree, voxel, scale))
    }

    /// Min occupancy aggregate covering a world point at a scale.
    pub fn get_min_data(&self, point_w: &Point3<f32>, scale: i32) -> Option<crate::core::OccupancyData> {
        let voxel = self.point_to_voxel(point_w)?;
        Some(visitor::get_min_data(&self.octree, voxel, scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;

    fn map_at_origin(size: i32, resolution: f32) -> TsdfMap {
        TsdfMap::new(
            &MapConfig {
                resolution,
                size,
                origin: [0.0; 3],
            },
            TsdfConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_point_voxel_round_trip() {
        use rand::Rng;
        let map = map_at_origin(32, 0.1);
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let p = Point3::new(
                rng.gen_range(0.0..3.2),
                rng.gen_range(0.0..3.2),
                rng.gen_range(0.0..3.2),
            );
            let voxel = map.point_to_voxel(&p).unwrap();
            let back = map.voxel_to_point(voxel, 1);
            // Quantization plus the half-voxel centre offset.
            assert!((back - p).norm() <= 0.1 * 3.0f32.sqrt());
            assert_eq!(map.point_to_voxel(&back), Some(voxel));
        }
    }

    #[test]
    fn test_out_of_bounds_queries_return_none() {
        let map = map_at_origin(32, 0.1);
        let outside = Point3::new(-0.05, 1.0, 1.0);
        assert!(!map.contains(&outside));
        assert_eq!(map.point_to_voxel(&outside), None);
        assert!(map.get_data_safe(&outside).is_none());
        assert!(map.get_field_interp(&outside).is_none());
    }

    #[test]
    fn test_frustum_blocks_skip_space_behind_the_sensor() {
        use crate::sensor::{PinholeCamera, PinholeCameraConfig};
        let mut map = TsdfMap::new(
            &MapConfig {
                resolution: 0.1,
                size: 32,
                origin: [-1.6, -1.6, -1.6],
            },
            TsdfConfig::default(),
        )
        .unwrap();
        // One block in front of the camera, one behind.
        let front = map
            .octree_mut()
            .allocate_block_at(VoxelCoord::new(16, 16, 24))
            .unwrap();
        let behind = map
            .octree_mut()
            .allocate_block_at(VoxelCoord::new(16, 16, 0))
            .unwrap();
        let sensor = PinholeCamera::new(PinholeCameraConfig::default());
        let visible: Vec<_> = map
            .frustum_blocks(&sensor, &nalgebra::Isometry3::identity())
            .collect();
        assert!(visible.contains(&front));
        assert!(!visible.contains(&behind));
    }

    #[test]
    fn test_voxel_to_point_is_cell_centre() {
        let map = map_at_origin(32, 0.1);
        let p = map.voxel_to_point(VoxelCoord::new(2, 0, 0), 1);
        assert!((p.x - 0.25).abs() < 1e-6);
        let p = map.voxel_to_point(VoxelCoord::new(0, 0, 0), 8);
        assert!((p.x - 0.4).abs() < 1e-6, "block centre");
    }
}
