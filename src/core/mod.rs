//! Foundation types: voxel coordinates, per-voxel data, images.

pub mod data;
pub mod image;
pub mod voxel;

pub use data::{OccupancyData, TsdfData, VoxelData};
pub use image::{DepthImage, Image};
pub use voxel::{VoxelCoord, BLOCK_MAX_SCALE, BLOCK_SIZE};

#[cfg(feature = "colour")]
pub use data::ColourData;
#[cfg(feature = "id")]
pub use data::{IdData, NOT_MAPPED, NO_ID};
