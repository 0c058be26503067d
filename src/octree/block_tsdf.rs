//! TSDF voxel block: a full mean pyramid plus a propagation shadow.
//!
//! The pyramid for every scale is allocated up front in one contiguous
//! array; a per-scale offset table makes indexing from (voxel, scale)
//! pure arithmetic. A parallel array of propagation deltas carries the
//! field change and per-frame weight increment accumulated since the
//! last scale synchronization, so dropping to a finer scale can replay
//! partial integrations onto the children.

use super::block::VoxelBlock;
use super::octant::{NodeIdx, Timestamp};
use crate::core::voxel::{VoxelCoord, BLOCK_MAX_SCALE, BLOCK_SIZE};
use crate::core::TsdfData;

/// Voxels in one scale array.
const fn voxels_at_scale(scale: i32) -> usize {
    let side = (BLOCK_SIZE >> scale) as usize;
    side * side * side
}

/// Start of each scale array in the backing storage.
const SCALE_OFFSETS: [usize; (BLOCK_MAX_SCALE + 1) as usize] = {
    let mut offsets = [0usize; (BLOCK_MAX_SCALE + 1) as usize];
    let mut scale = 1;
    while scale <= BLOCK_MAX_SCALE {
        offsets[scale as usize] =
            offsets[(scale - 1) as usize] + voxels_at_scale(scale - 1);
        scale += 1;
    }
    offsets
};

/// Total voxels over all scales.
const TOTAL_VOXELS: usize =
    SCALE_OFFSETS[BLOCK_MAX_SCALE as usize] + voxels_at_scale(BLOCK_MAX_SCALE);

/// Propagation shadow of one voxel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsdfDelta {
    /// Field value at the last scale synchronization.
    pub delta_tsdf: f32,
    /// Weight gained since the last scale synchronization.
    pub delta_weight: f32,
}

/// Multi-resolution TSDF block.
#[derive(Debug, Clone)]
pub struct TsdfBlock {
    coord: VoxelCoord,
    parent: NodeIdx,
    timestamp: Timestamp,
    current_scale: i32,
    min_scale: i32,
    data: Vec<TsdfData>,
    delta: Vec<TsdfDelta>,
}

impl TsdfBlock {
    /// Linear index of a voxel in the backing storage.
    #[inline]
    pub fn voxel_idx(&self, voxel: VoxelCoord, scale: i32) -> usize {
        debug_assert!((0..=BLOCK_MAX_SCALE).contains(&scale));
        let offset = voxel - self.coord;
        debug_assert!(offset.x >= 0 && offset.x < BLOCK_SIZE);
        let side = (BLOCK_SIZE >> scale) as usize;
        let x = (offset.x >> scale) as usize;
        let y = (offset.y >> scale) as usize;
        let z = (offset.z >> scale) as usize;
        SCALE_OFFSETS[scale as usize] + x + y * side + z * side * side
    }

    #[inline]
    pub fn data(&self, idx: usize) -> &TsdfData {
        &self.data[idx]
    }

    #[inline]
    pub fn data_mut(&mut self, idx: usize) -> &mut TsdfData {
        &mut self.data[idx]
    }

    #[inline]
    pub fn delta(&self, idx: usize) -> &TsdfDelta {
        &self.delta[idx]
    }

    /// Current data and its propagation shadow, for the down-propagator.
    #[inline]
    pub fn data_union_mut(&mut self, idx: usize) -> (&mut TsdfData, &mut TsdfDelta) {
        (&mut self.data[idx], &mut self.delta[idx])
    }

    /// Data at an exact scale, regardless of the current scale.
    #[inline]
    pub fn data_at_scale(&self, voxel: VoxelCoord, scale: i32) -> TsdfData {
        self.data[self.voxel_idx(voxel, scale)]
    }

    pub fn set_current_scale(&mut self, scale: i32) {
        debug_assert!((0..=BLOCK_MAX_SCALE).contains(&scale));
        self.current_scale = scale;
    }

    /// Record the finest scale reached by integration.
    pub fn update_min_scale(&mut self, scale: i32) {
        self.min_scale = if self.min_scale < 0 {
            scale
        } else {
            self.min_scale.min(scale)
        };
    }

    /// Trilinear sample of the field at one scale, clamped to the block
    /// interior.
    ///
    /// `sample_f` is in fractional voxel coordinates. Used to seed
    /// children when the integration scale drops.
    pub fn sample_field_at_scale(&self, sample_f: nalgebra::Point3<f32>, scale: i32) -> f32 {
        let side = BLOCK_SIZE >> scale;
        if side == 1 {
            return self.data[self.voxel_idx(self.coord, scale)].tsdf;
        }
        let stride = (1 << scale) as f32;
        let max_cell = side - 1;
        let base = self.coord.to_point();
        // Cell-centre grid coordinates of the sample within this scale.
        let gx = ((sample_f.x - base.x) / stride - 0.5).clamp(0.0, max_cell as f32);
        let gy = ((sample_f.y - base.y) / stride - 0.5).clamp(0.0, max_cell as f32);
        let gz = ((sample_f.z - base.z) / stride - 0.5).clamp(0.0, max_cell as f32);
        let x0 = (gx.floor() as i32).min(max_cell - 1).max(0);
        let y0 = (gy.floor() as i32).min(max_cell - 1).max(0);
        let z0 = (gz.floor() as i32).min(max_cell - 1).max(0);
        let fx = (gx - x0 as f32).clamp(0.0, 1.0);
        let fy = (gy - y0 as f32).clamp(0.0, 1.0);
        let fz = (gz - z0 as f32).clamp(0.0, 1.0);

        let value = |dx: i32, dy: i32, dz: i32| -> f32 {
            let voxel = self.coord
                + VoxelCoord::new((x0 + dx) << scale, (y0 + dy) << scale, (z0 + dz) << scale);
            self.data[self.voxel_idx(voxel, scale)].tsdf
        };

        let c00 = value(0, 0, 0) * (1.0 - fx) + value(1, 0, 0) * fx;
        let c10 = value(0, 1, 0) * (1.0 - fx) + value(1, 1, 0) * fx;
        let c01 = value(0, 0, 1) * (1.0 - fx) + value(1, 0, 1) * fx;
        let c11 = value(0, 1, 1) * (1.0 - fx) + value(1, 1, 1) * fx;
        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        c0 * (1.0 - fz) + c1 * fz
    }
}

impl VoxelBlock for TsdfBlock {
    type Data = TsdfData;

    fn new(coord: VoxelCoord, parent: NodeIdx, init_data: TsdfData) -> Self {
        Self {
            coord,
            parent,
            timestamp: 0,
            current_scale: 0,
            min_scale: -1,
            data: vec![init_data; TOTAL_VOXELS],
            delta: vec![TsdfDelta::default(); TOTAL_VOXELS],
        }
    }

    fn coord(&self) -> VoxelCoord {
        self.coord
    }

    fn parent(&self) -> NodeIdx {
        self.parent
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    fn current_scale(&self) -> i32 {
        self.current_scale
    }

    fn min_scale(&self) -> i32 {
        self.min_scale
    }

    fn data_at(&self, voxel: VoxelCoord, desired_scale: i32) -> (TsdfData, i32) {
        let scale = desired_scale.max(self.current_scale);
        (self.data[self.voxel_idx(voxel, scale)], scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_table() {
        assert_eq!(SCALE_OFFSETS, [0, 512, 576, 584]);
        assert_eq!(TOTAL_VOXELS, 585);
    }

    #[test]
    fn test_voxel_idx_covers_storage_without_overlap() {
        let block = TsdfBlock::new(
            VoxelCoord::new(8, 8, 8),
            NodeIdx(0),
            TsdfData::default(),
        );
        let mut seen = vec![false; TOTAL_VOXELS];
        for scale in 0..=BLOCK_MAX_SCALE {
            let stride = 1 << scale;
            for z in (0..BLOCK_SIZE).step_by(stride as usize) {
                for y in (0..BLOCK_SIZE).step_by(stride as usize) {
                    for x in (0..BLOCK_SIZE).step_by(stride as usize) {
                        let idx = block
                            .voxel_idx(VoxelCoord::new(8 + x, 8 + y, 8 + z), scale);
                        assert!(!seen[idx], "index {idx} assigned twice");
                        seen[idx] = true;
                    }
                }
            }
        }
        assert!(seen.iter().all(|&s| s), "every slot reachable");
    }

    #[test]
    fn test_data_at_clamps_to_current_scale() {
        let mut block = TsdfBlock::new(
            VoxelCoord::zero(),
            NodeIdx(0),
            TsdfData::default(),
        );
        block.set_current_scale(2);
        let (_, scale) = block.data_at(VoxelCoord::new(1, 1, 1), 0);
        assert_eq!(scale, 2);
        let (_, scale) = block.data_at(VoxelCoord::new(1, 1, 1), 3);
        assert_eq!(scale, 3);
    }

    #[test]
    fn test_sample_field_at_scale_is_exact_at_centres() {
        let mut block = TsdfBlock::new(
            VoxelCoord::zero(),
            NodeIdx(0),
            TsdfData::default(),
        );
        // Linear-in-x field at scale 1.
        for z in (0..BLOCK_SIZE).step_by(2) {
            for y in (0..BLOCK_SIZE).step_by(2) {
                for x in (0..BLOCK_SIZE).step_by(2) {
                    let idx = block.voxel_idx(VoxelCoord::new(x, y, z), 1);
                    block.data_mut(idx).tsdf = x as f32;
                }
            }
        }
        // Sample at the centre of the scale-1 cell at x = 4.
        let v = block.sample_field_at_scale(nalgebra::Point3::new(5.0, 5.0, 5.0), 1);
        assert!((v - 4.0).abs() < 1e-5);
    }
}
