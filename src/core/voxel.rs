//! Integer voxel coordinates and octant arithmetic.
//!
//! Voxel coordinates index the octree cube: each axis runs from 0 to the
//! octree side. A voxel block covers a [`BLOCK_SIZE`]-sided cube whose
//! corner coordinates are multiples of [`BLOCK_SIZE`]. Within a block,
//! a scale `s` groups voxels into cubes of side `1 << s`; scale 0 is
//! per-voxel and [`BLOCK_MAX_SCALE`] is one sample per block.

use nalgebra::{Point3, Vector3};
use std::ops::{Add, Mul, Sub};

/// Side length of a voxel block in voxels.
pub const BLOCK_SIZE: i32 = 8;

/// Coarsest scale within a block: log2 of the block side.
pub const BLOCK_MAX_SCALE: i32 = BLOCK_SIZE.trailing_zeros() as i32;

/// Integer voxel coordinates (cell indices into the octree cube).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct VoxelCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelCoord {
    /// Create a new voxel coordinate.
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Coordinate with all components equal.
    #[inline]
    pub const fn splat(v: i32) -> Self {
        Self::new(v, v, v)
    }

    /// The origin coordinate.
    #[inline]
    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// Corner of the block containing this voxel.
    #[inline]
    pub fn block_base(&self) -> Self {
        let mask = !(BLOCK_SIZE - 1);
        Self::new(self.x & mask, self.y & mask, self.z & mask)
    }

    /// Three-bit child selector of this voxel relative to a parent octant.
    ///
    /// Bit 0 selects the x half, bit 1 the y half, bit 2 the z half.
    #[inline]
    pub fn child_index(&self, parent_coord: VoxelCoord, parent_size: i32) -> usize {
        let half = parent_size / 2;
        let mut idx = 0;
        if self.x - parent_coord.x >= half {
            idx |= 1;
        }
        if self.y - parent_coord.y >= half {
            idx |= 2;
        }
        if self.z - parent_coord.z >= half {
            idx |= 4;
        }
        idx
    }

    /// Corner coordinate of the child octant with the given selector.
    #[inline]
    pub fn child_coord(&self, size: i32, child_idx: usize) -> Self {
        let half = size / 2;
        Self::new(
            self.x + half * ((child_idx & 1) as i32),
            self.y + half * (((child_idx >> 1) & 1) as i32),
            self.z + half * (((child_idx >> 2) & 1) as i32),
        )
    }

    /// Component-wise floor conversion from fractional voxel coordinates.
    #[inline]
    pub fn from_point_floor(p: &Point3<f32>) -> Self {
        Self::new(
            p.x.floor() as i32,
            p.y.floor() as i32,
            p.z.floor() as i32,
        )
    }

    /// Fractional voxel coordinates of this voxel's corner.
    #[inline]
    pub fn to_point(self) -> Point3<f32> {
        Point3::new(self.x as f32, self.y as f32, self.z as f32)
    }

    /// Component-wise minimum.
    #[inline]
    pub fn min(self, other: Self) -> Self {
        Self::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    /// Component-wise maximum.
    #[inline]
    pub fn max(self, other: Self) -> Self {
        Self::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }
}

impl Add for VoxelCoord {
    type Output = VoxelCoord;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for VoxelCoord {
    type Output = VoxelCoord;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<i32> for VoxelCoord {
    type Output = VoxelCoord;
    #[inline]
    fn mul(self, rhs: i32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl From<VoxelCoord> for Vector3<f32> {
    fn from(v: VoxelCoord) -> Self {
        Vector3::new(v.x as f32, v.y as f32, v.z as f32)
    }
}

/// Edge length in voxels of an octant cube at the given scale.
#[inline]
pub fn scale_to_size(scale: i32) -> i32 {
    debug_assert!(scale >= 0);
    1 << scale
}

/// Scale of an octant cube with the given power-of-two edge length.
#[inline]
pub fn size_to_scale(size: i32) -> i32 {
    debug_assert!(size > 0 && size.count_ones() == 1, "size must be a power of two");
    size.trailing_zeros() as i32
}

/// Smallest power of two that is at least `n`.
#[inline]
pub fn power_two_up(n: i32) -> i32 {
    debug_assert!(n > 0);
    i32::pow(2, 32 - (n - 1).leading_zeros())
        .max(1)
}
