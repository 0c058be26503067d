//! Occupancy voxel block: mean/min/max pyramids with a buffered scale
//! switch.
//!
//! Scale arrays are allocated lazily from the coarsest single sample
//! down to the finest scale integration has requested. The mean, min and
//! max pyramids are parallel, except at the finest materialized scale
//! where the aggregates are identities: there the min and max entries
//! are empty and accessors redirect to the mean array.
//!
//! A change of integration scale is never applied directly. The new
//! scale is integrated into a buffer pyramid until enough frames and
//! observed volume ratify it, and [`OccupancyBlock::switch_data`] then
//! grows or truncates the pyramid in one step.

use super::block::VoxelBlock;
use super::octant::{NodeIdx, Timestamp};
use crate::core::voxel::{VoxelCoord, BLOCK_MAX_SCALE, BLOCK_SIZE};
use crate::core::{OccupancyData, VoxelData};

/// Frames a buffer must accumulate before it can be ratified.
const BUFFER_MIN_INTEGR_COUNT: u32 = 20;

/// Fraction of the currently observed volume the buffer must reach.
const BUFFER_OBSERVED_RATIO: f32 = 0.9;

#[inline]
fn side_at_scale(scale: i32) -> i32 {
    BLOCK_SIZE >> scale
}

#[inline]
fn voxels_at_scale(scale: i32) -> usize {
    let side = side_at_scale(scale) as usize;
    side * side * side
}

/// Volume in finest-scale voxels of one sample at the given scale.
#[inline]
fn voxel_volume(scale: i32) -> f32 {
    let s = (1 << scale) as f32;
    s * s * s
}

#[derive(Debug, Clone)]
struct Buffer {
    scale: i32,
    data: Vec<OccupancyData>,
    integr_count: u32,
    observed_count: u32,
}

/// Multi-resolution log-odds occupancy block.
#[derive(Debug, Clone)]
pub struct OccupancyBlock {
    coord: VoxelCoord,
    parent: NodeIdx,
    timestamp: Timestamp,
    current_scale: i32,
    min_scale: i32,
    init_data: OccupancyData,
    /// Scale arrays indexed by `BLOCK_MAX_SCALE - scale`.
    mean: Vec<Vec<OccupancyData>>,
    /// Parallel to `mean`; the entry of the finest materialized scale is
    /// empty and reads redirect to `mean`.
    min: Vec<Vec<OccupancyData>>,
    max: Vec<Vec<OccupancyData>>,
    buffer: Option<Buffer>,
    curr_integr_count: u32,
    curr_observed_count: u32,
}

impl OccupancyBlock {
    /// Index of a voxel within one scale array.
    #[inline]
    pub fn voxel_idx(&self, voxel: VoxelCoord, scale: i32) -> usize {
        debug_assert!((0..=BLOCK_MAX_SCALE).contains(&scale));
        let offset = voxel - self.coord;
        debug_assert!(offset.x >= 0 && offset.x < BLOCK_SIZE);
        let side = side_at_scale(scale) as usize;
        let x = (offset.x >> scale) as usize;
        let y = (offset.y >> scale) as usize;
        let z = (offset.z >> scale) as usize;
        x + y * side + z * side * side
    }

    /// Finest scale with a materialized array.
    #[inline]
    pub fn finest_scale(&self) -> i32 {
        BLOCK_MAX_SCALE + 1 - self.mean.len() as i32
    }

    #[inline]
    fn pyramid_idx(scale: i32) -> usize {
        (BLOCK_MAX_SCALE - scale) as usize
    }

    #[inline]
    fn materialized(&self, scale: i32) -> bool {
        scale >= self.finest_scale()
    }

    /// Mean data array at a materialized scale.
    pub fn mean_slice(&self, scale: i32) -> &[OccupancyData] {
        &self.mean[Self::pyramid_idx(scale)]
    }

    pub fn mean_slice_mut(&mut self, scale: i32) -> &mut [OccupancyData] {
        &mut self.mean[Self::pyramid_idx(scale)]
    }

    /// Min aggregate array at a materialized scale; identical to the
    /// mean at the finest scale.
    pub fn min_slice(&self, scale: i32) -> &[OccupancyData] {
        let idx = Self::pyramid_idx(scale);
        if self.min[idx].is_empty() {
            &self.mean[idx]
        } else {
            &self.min[idx]
        }
    }

    /// Max aggregate array at a materialized scale; identical to the
    /// mean at the finest scale.
    pub fn max_slice(&self, scale: i32) -> &[OccupancyData] {
        let idx = Self::pyramid_idx(scale);
        if self.max[idx].is_empty() {
            &self.mean[idx]
        } else {
            &self.max[idx]
        }
    }

    pub(crate) fn min_slice_mut(&mut self, scale: i32) -> &mut [OccupancyData] {
        let idx = Self::pyramid_idx(scale);
        if self.min[idx].is_empty() {
            &mut self.mean[idx]
        } else {
            &mut self.min[idx]
        }
    }

    pub(crate) fn max_slice_mut(&mut self, scale: i32) -> &mut [OccupancyData] {
        let idx = Self::pyramid_idx(scale);
        if self.max[idx].is_empty() {
            &mut self.mean[idx]
        } else {
            &mut self.max[idx]
        }
    }

    /// Data at an exact scale; init data if the scale was never
    /// materialized.
    pub fn data_at_scale(&self, voxel: VoxelCoord, scale: i32) -> OccupancyData {
        if !self.materialized(scale) {
            return self.init_data;
        }
        self.mean_slice(scale)[self.voxel_idx(voxel, scale)]
    }

    /// Min data at the desired scale or coarser.
    pub fn min_data_at(&self, voxel: VoxelCoord, desired_scale: i32) -> (OccupancyData, i32) {
        let scale = desired_scale.max(self.current_scale);
        (self.min_slice(scale)[self.voxel_idx(voxel, scale)], scale)
    }

    /// Max data at the desired scale or coarser.
    pub fn max_data_at(&self, voxel: VoxelCoord, desired_scale: i32) -> (OccupancyData, i32) {
        let scale = desired_scale.max(self.current_scale);
        (self.max_slice(scale)[self.voxel_idx(voxel, scale)], scale)
    }

    /// Field value of the block-level max aggregate.
    pub fn max_field(&self) -> f32 {
        if self.min_scale < 0 {
            return self.init_data.field();
        }
        self.max_slice(BLOCK_MAX_SCALE)[0].field()
    }

    pub fn init_data(&self) -> OccupancyData {
        self.init_data
    }

    pub fn set_init_data(&mut self, data: OccupancyData) {
        self.init_data = data;
    }

    pub fn set_current_scale(&mut self, scale: i32) {
        debug_assert!(self.materialized(scale));
        self.current_scale = scale;
    }

    pub fn curr_integr_count(&self) -> u32 {
        self.curr_integr_count
    }

    pub fn curr_observed_count(&self) -> u32 {
        self.curr_observed_count
    }

    /// Materialize scale arrays down to `new_min_scale`.
    ///
    /// The previously finest scale gets owned min/max copies of its mean
    /// (it stops being the identity scale); every new scale starts from
    /// init data, and the new finest shares its aggregates with the mean.
    pub fn allocate_down_to(&mut self, new_min_scale: i32) {
        debug_assert!((0..=BLOCK_MAX_SCALE).contains(&new_min_scale));
        if self.materialized(new_min_scale) {
            return;
        }
        // Detach the old finest scale from the shared representation.
        let old_finest = self.finest_scale();
        let shared = self.mean_slice(old_finest).to_vec();
        let idx = Self::pyramid_idx(old_finest);
        self.min[idx] = shared.clone();
        self.max[idx] = shared;

        for scale in (new_min_scale..old_finest).rev() {
            let n = voxels_at_scale(scale);
            self.mean.push(vec![self.init_data; n]);
            if scale == new_min_scale {
                // Aggregates are identities at the finest scale.
                self.min.push(Vec::new());
                self.max.push(Vec::new());
            } else {
                self.min.push(vec![self.init_data; n]);
                self.max.push(vec![self.init_data; n]);
            }
        }
        self.current_scale = new_min_scale;
        self.min_scale = new_min_scale;
    }

    /// Drop scale arrays finer than `new_min_scale`.
    pub fn delete_up_to(&mut self, new_min_scale: i32) {
        debug_assert!((0..=BLOCK_MAX_SCALE).contains(&new_min_scale));
        if self.min_scale == -1 || self.min_scale >= new_min_scale {
            return;
        }
        while self.finest_scale() < new_min_scale {
            self.mean.pop();
            self.min.pop();
            self.max.pop();
        }
        // The new finest scale shares its aggregates with the mean again.
        let idx = Self::pyramid_idx(new_min_scale);
        self.min[idx] = Vec::new();
        self.max[idx] = Vec::new();
        self.min_scale = new_min_scale;
    }

    /// Reset the integration counters of the current pyramid.
    pub fn reset_curr_count(&mut self) {
        self.curr_integr_count = 0;
        self.curr_observed_count = 0;
    }

    /// Initialize the counters after the first allocation, accounting
    /// for inherited free-space data.
    pub fn init_curr_count(&mut self) {
        if self.init_data.observed {
            self.curr_integr_count = self.init_data.weight as u32;
            self.curr_observed_count = voxels_at_scale(self.current_scale) as u32;
        } else {
            self.reset_curr_count();
        }
    }

    pub fn incr_curr_integr_count(&mut self) {
        self.curr_integr_count += 1;
    }

    pub fn incr_curr_observed_count(&mut self, newly_observed: bool) {
        if newly_observed {
            self.curr_observed_count += 1;
        }
    }

    /// Scale of the open buffer, or -1 when no buffer is open.
    pub fn buffer_scale(&self) -> i32 {
        self.buffer.as_ref().map_or(-1, |b| b.scale)
    }

    /// Open a buffer pyramid at the given scale.
    ///
    /// A finer buffer starts from init data and is seeded by the updater;
    /// a coarser buffer starts from the existing aggregate at that scale
    /// so the switch stays continuous.
    pub fn init_buffer(&mut self, scale: i32) {
        debug_assert!((0..=BLOCK_MAX_SCALE).contains(&scale));
        let data = if scale < self.current_scale {
            vec![self.init_data; voxels_at_scale(scale)]
        } else {
            self.mean_slice(scale).to_vec()
        };
        self.buffer = Some(Buffer {
            scale,
            data,
            integr_count: 0,
            observed_count: 0,
        });
    }

    pub fn reset_buffer(&mut self) {
        self.buffer = None;
    }

    pub fn buffer_voxel(&mut self, idx: usize) -> &mut OccupancyData {
        let buffer = self.buffer.as_mut().expect("no buffer open");
        &mut buffer.data[idx]
    }

    pub fn buffer_data(&self, voxel: VoxelCoord) -> OccupancyData {
        let buffer = self.buffer.as_ref().expect("no buffer open");
        buffer.data[self.voxel_idx(voxel, buffer.scale)]
    }

    pub fn incr_buffer_observed_count(&mut self, newly_observed: bool) {
        if newly_observed {
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.observed_count += 1;
            }
        }
    }

    /// Count a frame toward ratification.
    ///
    /// Frames whose block does not fully project into the image only
    /// count once the buffer already covers enough observed volume, so a
    /// block at the image border cannot ratify from partial views.
    pub fn incr_buffer_integr_count(&mut self, projects_inside: bool) {
        let ratio_ok = self.buffer_volume_ratio_ok();
        if let Some(buffer) = self.buffer.as_mut() {
            if projects_inside || ratio_ok {
                buffer.integr_count += 1;
            }
        }
    }

    fn buffer_volume_ratio_ok(&self) -> bool {
        let Some(buffer) = self.buffer.as_ref() else {
            return false;
        };
        buffer.observed_count as f32 * voxel_volume(buffer.scale)
            >= BUFFER_OBSERVED_RATIO
                * self.curr_observed_count as f32
                * voxel_volume(self.current_scale)
    }

    /// Ratify the buffer if it qualifies, atomically replacing the
    /// current integration scale.
    ///
    /// Returns whether the switch happened.
    pub fn switch_data(&mut self) -> bool {
        let qualified = self
            .buffer
            .as_ref()
            .map(|b| b.integr_count >= BUFFER_MIN_INTEGR_COUNT)
            .unwrap_or(false)
            && self.buffer_volume_ratio_ok();
        if !qualified {
            return false;
        }
        let mut buffer = self.buffer.take().expect("qualified buffer exists");

        // Voxels that carried seeded data but were never directly
        // measured become observed with the switch.
        for data in buffer.data.iter_mut() {
            if data.weight > 0.0 && !data.observed {
                data.observed = true;
                buffer.observed_count += 1;
            }
        }

        if buffer.scale < self.current_scale {
            // Grow the pyramid: the previous finest scale stops sharing
            // its aggregates with the mean.
            debug_assert_eq!(buffer.scale, self.finest_scale() - 1);
            let old_finest = self.finest_scale();
            let shared = self.mean_slice(old_finest).to_vec();
            let idx = Self::pyramid_idx(old_finest);
            self.min[idx] = shared.clone();
            self.max[idx] = shared;
            self.mean.push(buffer.data);
            self.min.push(Vec::new());
            self.max.push(Vec::new());
        } else {
            // Truncate the pyramid and install the buffer as the finest
            // scale.
            self.delete_up_to(buffer.scale);
            let idx = Self::pyramid_idx(buffer.scale);
            self.mean[idx] = buffer.data;
        }

        self.current_scale = buffer.scale;
        self.min_scale = buffer.scale;
        self.curr_integr_count = buffer.integr_count;
        self.curr_observed_count = buffer.observed_count;
        true
    }
}

impl VoxelBlock for OccupancyBlock {
    type Data = OccupancyData;

    fn new(coord: VoxelCoord, parent: NodeIdx, init_data: OccupancyData) -> Self {
        // A single sample at the coarsest scale; finer scales are
        // materialized on demand.
        Self {
            coord,
            parent,
            timestamp: 0,
            current_scale: BLOCK_MAX_SCALE,
            min_scale: -1,
            init_data,
            mean: vec![vec![init_data; 1]],
            min: vec![Vec::new()],
            max: vec![Vec::new()],
            buffer: None,
            curr_integr_count: 0,
            curr_observed_count: 0,
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

    fn data_at(&self, voxel: VoxelCoord, desired_scale: i32) -> (OccupancyData, i32) {
        let scale = desired_scale.max(self.current_scale);
        (
            self.mean_slice(scale)[self.voxel_idx(voxel, scale)],
            scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> OccupancyBlock {
        OccupancyBlock::new(VoxelCoord::zero(), NodeIdx(0), OccupancyData::default())
    }

    #[test]
    fn test_new_block_has_single_coarse_sample() {
        let b = block();
        assert_eq!(b.finest_scale(), BLOCK_MAX_SCALE);
        assert_eq!(b.min_scale(), -1);
        assert_eq!(b.mean_slice(BLOCK_MAX_SCALE).len(), 1);
    }

    #[test]
    fn test_allocate_down_to_materializes_pyramid() {
        let mut b = block();
        b.allocate_down_to(0);
        assert_eq!(b.finest_scale(), 0);
        assert_eq!(b.current_scale(), 0);
        assert_eq!(b.mean_slice(0).len(), 512);
        assert_eq!(b.mean_slice(1).len(), 64);
        // Aggregates are identities at the finest scale.
        assert_eq!(b.min_slice(0).as_ptr(), b.mean_slice(0).as_ptr());
        // But owned everywhere else.
        assert_ne!(b.min_slice(1).as_ptr(), b.mean_slice(1).as_ptr());
    }

    #[test]
    fn test_delete_up_to_restores_sharing() {
        let mut b = block();
        b.allocate_down_to(0);
        b.delete_up_to(2);
        assert_eq!(b.finest_scale(), 2);
        assert_eq!(b.min_scale(), 2);
        assert_eq!(b.min_slice(2).as_ptr(), b.mean_slice(2).as_ptr());
    }

    #[test]
    fn test_buffer_switch_to_coarser() {
        let mut b = block();
        b.allocate_down_to(1);
        // Observe the whole current scale.
        for idx in 0..64 {
            let newly = b.mean_slice_mut(1)[idx].integrate(-5.0, 100.0);
            b.incr_curr_observed_count(newly);
            b.incr_curr_integr_count();
        }
        b.init_buffer(2);
        assert_eq!(b.buffer_scale(), 2);
        for idx in 0..8 {
            let newly = b.buffer_voxel(idx).integrate(-5.0, 100.0);
            b.incr_buffer_observed_count(newly);
        }
        // Not enough frames yet.
        b.incr_buffer_integr_count(true);
        assert!(!b.switch_data());
        for _ in 0..BUFFER_MIN_INTEGR_COUNT {
            b.incr_buffer_integr_count(true);
        }
        assert!(b.switch_data());
        assert_eq!(b.current_scale(), 2);
        assert_eq!(b.finest_scale(), 2);
        assert_eq!(b.buffer_scale(), -1);
    }

    #[test]
    fn test_buffer_switch_to_finer_marks_seeded_voxels_observed() {
        let mut b = block();
        b.allocate_down_to(2);
        for idx in 0..8 {
            let newly = b.mean_slice_mut(2)[idx].integrate(-5.0, 100.0);
            b.incr_curr_observed_count(newly);
        }
        b.init_buffer(1);
        // Seed children with parent data, unobserved.
        for idx in 0..64 {
            let v = b.buffer_voxel(idx);
            v.occupancy = -5.0;
            v.weight = 1.0;
            v.observed = false;
        }
        // Observe most of the buffer directly.
        for idx in 0..60 {
            let newly = b.buffer_voxel(idx).integrate(-5.0, 100.0);
            b.incr_buffer_observed_count(newly);
        }
        for _ in 0..BUFFER_MIN_INTEGR_COUNT {
            b.incr_buffer_integr_count(true);
        }
        assert!(b.switch_data());
        assert_eq!(b.current_scale(), 1);
        // The seeded-but-unmeasured voxels became observed.
        assert!(b.mean_slice(1).iter().all(|d| d.observed));
        assert_eq!(b.curr_observed_count(), 64);
    }
}
