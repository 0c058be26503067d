//! The voxel-block contract shared by the field variants.

use super::octant::{NodeIdx, Timestamp};
use crate::core::voxel::VoxelCoord;
use crate::core::VoxelData;

/// A fixed-size cube of per-voxel data, the unit of allocation of the
/// sparse map. Blocks are always leaves.
///
/// Implementations own their scale pyramids; the octree only stores and
/// links them.
pub trait VoxelBlock: Send + Sync + Sized {
    type Data: VoxelData;

    /// Create a block at the given corner with inherited initial data.
    fn new(coord: VoxelCoord, parent: NodeIdx, init_data: Self::Data) -> Self;

    /// Corner voxel coordinate; a multiple of the block side.
    fn coord(&self) -> VoxelCoord;

    /// Parent node for upward propagation.
    fn parent(&self) -> NodeIdx;

    /// Frame of the last integration into this block.
    fn timestamp(&self) -> Timestamp;

    fn set_timestamp(&mut self, timestamp: Timestamp);

    /// The scale integration currently runs at.
    fn current_scale(&self) -> i32;

    /// Finest scale ever materialized, or -1 before the first
    /// integration.
    fn min_scale(&self) -> i32;

    /// Data for a voxel at the desired scale or coarser.
    ///
    /// Returns the data together with the actual scale, which is
    /// `max(desired_scale, current_scale)`.
    fn data_at(&self, voxel: VoxelCoord, desired_scale: i32) -> (Self::Data, i32);
}
