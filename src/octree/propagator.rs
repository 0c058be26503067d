//! Aggregation through the tree: block-internal rescaling and the
//! ancestor walk to the root.
//!
//! Up-propagation rebuilds the coarser scales of a block from its
//! finest integrated scale, then lifts per-node aggregates level by
//! level until the root. Down-propagation rescales a TSDF block when
//! the updater selects a finer scale than the last integration,
//! carrying the field change accumulated since the last scale
//! synchronization onto the children.

use std::collections::HashSet;

use crate::core::voxel::{size_to_scale, VoxelCoord, BLOCK_MAX_SCALE, BLOCK_SIZE};
use crate::core::{OccupancyData, VoxelData};

use super::block::VoxelBlock;
use super::block_occupancy::OccupancyBlock;
use super::block_tsdf::TsdfBlock;
use super::octant::{BlockIdx, NodeIdx, OctantKey, Timestamp};
use super::Octree;

/// Voxel coordinates of the eight children of a parent sample.
fn child_coords(parent: VoxelCoord, child_stride: i32) -> [VoxelCoord; 8] {
    let mut coords = [parent; 8];
    for (i, c) in coords.iter_mut().enumerate() {
        *c = parent
            + VoxelCoord::new(
                (i as i32 & 1) * child_stride,
                ((i as i32 >> 1) & 1) * child_stride,
                ((i as i32 >> 2) & 1) * child_stride,
            );
    }
    coords
}

/// Positions of all parent samples of a block at one scale.
fn parent_coords(block_coord: VoxelCoord, parent_stride: i32) -> Vec<VoxelCoord> {
    let mut coords = Vec::new();
    for z in (0..BLOCK_SIZE).step_by(parent_stride as usize) {
        for y in (0..BLOCK_SIZE).step_by(parent_stride as usize) {
            for x in (0..BLOCK_SIZE).step_by(parent_stride as usize) {
                coords.push(block_coord + VoxelCoord::new(x, y, z));
            }
        }
    }
    coords
}

/// Rebuild the coarser scales of a TSDF block from `init_scale` upward.
///
/// A parent becomes the mean of its weighted children with the weight
/// rounded up; parents with no weighted child reset to default data.
/// The propagation shadow is synchronized so a later down-propagation
/// starts from a clean delta.
pub fn propagate_block_up_tsdf(block: &mut TsdfBlock, init_scale: i32) {
    let block_coord = block.coord();
    for child_scale in init_scale..BLOCK_MAX_SCALE {
        let child_stride = 1 << child_scale;
        let parent_stride = child_stride << 1;
        for parent in parent_coords(block_coord, parent_stride) {
            let mut tsdf_sum = 0.0f32;
            let mut weight_sum = 0.0f32;
            let mut count = 0u32;
            #[cfg(feature = "colour")]
            let mut colour_sum = [0.0f32; 3];
            for child in child_coords(parent, child_stride) {
                let data = block.data_at_scale(child, child_scale);
                if data.weight > 0.0 {
                    tsdf_sum += data.tsdf;
                    weight_sum += data.weight;
                    count += 1;
                    #[cfg(feature = "colour")]
                    {
                        colour_sum[0] += data.colour.r as f32;
                        colour_sum[1] += data.colour.g as f32;
                        colour_sum[2] += data.colour.b as f32;
                    }
                }
            }
            let parent_idx = block.voxel_idx(parent, child_scale + 1);
            let (data, delta) = block.data_union_mut(parent_idx);
            if count > 0 {
                data.tsdf = tsdf_sum / count as f32;
                data.weight = (weight_sum / count as f32).ceil();
                #[cfg(feature = "colour")]
                {
                    data.colour = crate::core::ColourData::new(
                        (colour_sum[0] / count as f32).round() as u8,
                        (colour_sum[1] / count as f32).round() as u8,
                        (colour_sum[2] / count as f32).round() as u8,
                    );
                }
                delta.delta_tsdf = data.tsdf;
                delta.delta_weight = 0.0;
            } else {
                *data = Default::default();
                *delta = Default::default();
            }
        }
    }
}

/// Rescale a TSDF block down to `target_scale`.
///
/// Children that already carry weight receive the parent's field change
/// since the last synchronization plus its per-frame weight increment;
/// weightless children are seeded by trilinear interpolation of the
/// parent scale and inherit the parent's weight.
pub fn propagate_block_down_tsdf(block: &mut TsdfBlock, target_scale: i32, max_weight: f32) {
    debug_assert!(target_scale <= block.current_scale());
    let block_coord = block.coord();
    for parent_scale in ((target_scale + 1)..=block.current_scale()).rev() {
        let parent_stride = 1 << parent_scale;
        let child_scale = parent_scale - 1;
        let child_stride = parent_stride >> 1;
        for parent in parent_coords(block_coord, parent_stride) {
            let parent_idx = block.voxel_idx(parent, parent_scale);
            let parent_data = *block.data(parent_idx);
            let parent_delta = *block.delta(parent_idx);
            let delta_tsdf = parent_data.tsdf - parent_delta.delta_tsdf;

            for child in child_coords(parent, child_stride) {
                let child_idx = block.voxel_idx(child, child_scale);
                if block.data(child_idx).weight > 0.0 {
                    let (data, delta) = block.data_union_mut(child_idx);
                    data.tsdf = (data.tsdf + delta_tsdf).max(-1.0);
                    data.weight = (data.weight + parent_delta.delta_weight).min(max_weight);
                    delta.delta_weight = parent_delta.delta_weight;
                } else {
                    // Seed from the parent scale at the child's centre.
                    let centre = nalgebra::Point3::new(
                        child.x as f32 + 0.5 * child_stride as f32,
                        child.y as f32 + 0.5 * child_stride as f32,
                        child.z as f32 + 0.5 * child_stride as f32,
                    );
                    let sample = block.sample_field_at_scale(centre, parent_scale);
                    let (data, delta) = block.data_union_mut(child_idx);
                    data.tsdf = sample;
                    data.weight = parent_data.weight;
                    #[cfg(feature = "colour")]
                    {
                        data.colour = parent_data.colour;
                    }
                    delta.delta_tsdf = sample;
                    delta.delta_weight = 0.0;
                }
            }

            let (data, delta) = block.data_union_mut(parent_idx);
            delta.delta_tsdf = data.tsdf;
            delta.delta_weight = 0.0;
        }
    }
}

/// Occupancy aggregation of eight child samples.
struct OccupancyAggregate {
    mean: OccupancyData,
    min: OccupancyData,
    max: OccupancyData,
    weighted: u32,
    observed: u32,
}

fn aggregate_occupancy(children: impl Iterator<Item = (OccupancyData, OccupancyData, OccupancyData)>) -> OccupancyAggregate {
    let mut out = OccupancyAggregate {
        mean: OccupancyData::default(),
        min: OccupancyData::default(),
        max: OccupancyData::default(),
        weighted: 0,
        observed: 0,
    };
    let mut occ_sum = 0.0f32;
    let mut weight_sum = 0.0f32;
    let mut min_field = f32::MAX;
    let mut max_field = f32::MIN;
    let mut total = 0u32;
    for (mean, min, max) in children {
        total += 1;
        if min.weight > 0.0 && min.field() < min_field {
            min_field = min.field();
            out.min = min;
        }
        if max.weight > 0.0 && max.field() > max_field {
            max_field = max.field();
            out.max = max;
        }
        if mean.weight > 0.0 {
            occ_sum += mean.occupancy;
            weight_sum += mean.weight;
            out.weighted += 1;
        }
        if max.observed {
            out.observed += 1;
        }
    }
    if out.weighted > 0 {
        out.mean.occupancy = occ_sum / out.weighted as f32;
        out.mean.weight = weight_sum / out.weighted as f32;
    }
    // Observation requires every child present and observed.
    let fully_observed = total == 8 && out.observed == 8;
    out.mean.observed = fully_observed && out.weighted > 0;
    out.min.observed = out.min.weight > 0.0 && fully_observed;
    out.max.observed = out.max.weight > 0.0 && fully_observed;
    out
}

/// Rebuild the coarser mean/min/max scales of an occupancy block from
/// its current integration scale up to the block root.
pub fn propagate_block_up_occupancy(block: &mut OccupancyBlock) {
    let block_coord = block.coord();
    for child_scale in block.current_scale()..BLOCK_MAX_SCALE {
        let parent_scale = child_scale + 1;
        let child_stride = 1 << child_scale;
        let parent_stride = child_stride << 1;
        for parent in parent_coords(block_coord, parent_stride) {
            let aggregate = {
                let children = child_coords(parent, child_stride);
                aggregate_occupancy(children.iter().map(|&c| {
                    let idx = block.voxel_idx(c, child_scale);
                    (
                        block.mean_slice(child_scale)[idx],
                        block.min_slice(child_scale)[idx],
                        block.max_slice(child_scale)[idx],
                    )
                }))
            };
            if aggregate.weighted == 0 {
                continue;
            }
            let parent_idx = block.voxel_idx(parent, parent_scale);
            block.mean_slice_mut(parent_scale)[parent_idx] = aggregate.mean;
            block.min_slice_mut(parent_scale)[parent_idx] = aggregate.min;
            block.max_slice_mut(parent_scale)[parent_idx] = aggregate.max;
        }
    }
}

/// Aggregate the children of a node into it and stamp it with the
/// frame. Returns the node's new max aggregate, which the caller uses
/// for free-space pruning.
pub fn propagate_node_occupancy(
    octree: &mut Octree<OccupancyBlock>,
    node_idx: NodeIdx,
    frame: Timestamp,
) -> OccupancyData {
    let children = octree.node(node_idx).children;
    let aggregate = aggregate_occupancy(children.iter().filter_map(|c| *c).map(|key| match key {
        OctantKey::Block(idx) => {
            let block = octree.block(idx);
            (
                block.data_at_scale(block.coord(), BLOCK_MAX_SCALE),
                block.min_slice(BLOCK_MAX_SCALE)[0],
                block.max_slice(BLOCK_MAX_SCALE)[0],
            )
        }
        OctantKey::Node(idx) => {
            let node = octree.node(idx);
            (node.data, node.min_data, node.max_data)
        }
    }));
    let node = octree.node_mut(node_idx);
    node.timestamp = frame;
    if aggregate.weighted > 0 {
        node.data = aggregate.mean;
    }
    if aggregate.min.weight > 0.0 {
        node.min_data = aggregate.min;
    }
    if aggregate.max.weight > 0.0 {
        node.max_data = aggregate.max;
    }
    node.max_data
}

/// Walk ancestors level by level, re-aggregating each parent from its
/// children. Fully observed subtrees whose max occupancy is clearly
/// free are pruned; this is the only place the octree shrinks during
/// steady-state operation.
pub fn propagate_to_root_occupancy(
    octree: &mut Octree<OccupancyBlock>,
    blocks: &[BlockIdx],
    seed_nodes: &[NodeIdx],
    frame: Timestamp,
    min_occupancy: f32,
) {
    let depth_count = octree.block_depth().max(1) as usize;
    let mut sets: Vec<HashSet<NodeIdx>> = vec![HashSet::new(); depth_count];
    let max_scale = octree.max_scale();

    let mut insert = |sets: &mut Vec<HashSet<NodeIdx>>, octree: &Octree<OccupancyBlock>, idx: NodeIdx| {
        let depth = (max_scale - size_to_scale(octree.node(idx).size)) as usize;
        debug_assert!(depth < depth_count);
        sets[depth].insert(idx);
    };

    for &block_idx in blocks {
        let parent = octree.block(block_idx).parent();
        insert(&mut sets, octree, parent);
    }
    for &node_idx in seed_nodes {
        insert(&mut sets, octree, node_idx);
    }

    for depth in (1..depth_count).rev() {
        let at_depth: Vec<NodeIdx> = sets[depth].iter().copied().collect();
        for node_idx in at_depth {
            if octree.node(node_idx).timestamp == frame {
                continue;
            }
            let max_data = propagate_node_occupancy(octree, node_idx, frame);
            if let Some(parent) = octree.node(node_idx).parent {
                sets[depth - 1].insert(parent);
            }
            if max_data.observed && max_data.field() <= 0.95 * min_occupancy {
                octree.delete_children(node_idx);
            }
        }
    }
    propagate_node_occupancy(octree, octree.root(), frame);
}

/// Lift the frame timestamp from blocks to the root without touching
/// the aggregates. Used after TSDF integration so stale subtrees can be
/// skipped on later queries.
pub fn propagate_timestamp_to_root<B: VoxelBlock>(
    octree: &mut Octree<B>,
    blocks: &[BlockIdx],
    frame: Timestamp,
) {
    for &block_idx in blocks {
        let mut next = Some(octree.block(block_idx).parent());
        while let Some(node_idx) = next {
            let node = octree.node_mut(node_idx);
            if node.timestamp >= frame {
                break;
            }
            node.timestamp = frame;
            next = node.parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TsdfData;

    fn tsdf_block() -> TsdfBlock {
        TsdfBlock::new(VoxelCoord::zero(), NodeIdx(0), TsdfData::default())
    }

    fn fill_scale(block: &mut TsdfBlock, scale: i32, tsdf: f32, weight: f32) {
        let stride = 1 << scale;
        for z in (0..BLOCK_SIZE).step_by(stride as usize) {
            for y in (0..BLOCK_SIZE).step_by(stride as usize) {
                for x in (0..BLOCK_SIZE).step_by(stride as usize) {
                    let idx = block.voxel_idx(VoxelCoord::new(x, y, z), scale);
                    let data = block.data_mut(idx);
                    data.tsdf = tsdf;
                    data.weight = weight;
                }
            }
        }
    }

    #[test]
    fn test_up_propagation_weight_is_ceil_of_mean() {
        let mut block = tsdf_block();
        fill_scale(&mut block, 0, 0.5, 3.0);
        // One child heavier than the others.
        let idx = block.voxel_idx(VoxelCoord::zero(), 0);
        block.data_mut(idx).weight = 4.0;
        propagate_block_up_tsdf(&mut block, 0);
        let parent = block.data_at_scale(VoxelCoord::zero(), 1);
        assert_eq!(parent.weight, 4.0, "ceil(25/8) = 4");
        assert!((parent.tsdf - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_up_then_down_restores_equal_weight_children() {
        let mut block = tsdf_block();
        fill_scale(&mut block, 0, 0.25, 4.0);
        propagate_block_up_tsdf(&mut block, 0);
        block.set_current_scale(2);
        propagate_block_down_tsdf(&mut block, 0, 100.0);
        for z in 0..BLOCK_SIZE {
            for y in 0..BLOCK_SIZE {
                for x in 0..BLOCK_SIZE {
                    let d = block.data_at_scale(VoxelCoord::new(x, y, z), 0);
                    assert!((d.tsdf - 0.25).abs() < 1e-5, "value restored");
                    assert_eq!(d.weight, 4.0, "weight restored");
                }
            }
        }
    }

    #[test]
    fn test_down_propagation_preserves_weight_and_seeds_values() {
        let mut block = tsdf_block();
        // Integrate only at scale 2: weight 5 everywhere at that scale.
        fill_scale(&mut block, 2, 0.3, 5.0);
        block.set_current_scale(2);
        block.update_min_scale(2);
        propagate_block_down_tsdf(&mut block, 1, 100.0);
        let stride = 2;
        for z in (0..BLOCK_SIZE).step_by(stride) {
            for y in (0..BLOCK_SIZE).step_by(stride) {
                for x in (0..BLOCK_SIZE).step_by(stride) {
                    let d = block.data_at_scale(
                        VoxelCoord::new(x as i32, y as i32, z as i32),
                        1,
                    );
                    assert!(d.weight >= 5.0, "no weight lost in the rescale");
                    assert!((d.tsdf - 0.3).abs() < 1e-5, "seeded from constant field");
                }
            }
        }
    }

    #[test]
    fn test_propagator_idempotence() {
        let mut block = tsdf_block();
        fill_scale(&mut block, 0, -0.1, 7.0);
        propagate_block_up_tsdf(&mut block, 0);
        let snapshot: Vec<TsdfData> = (0..585).map(|i| *block.data(i)).collect();
        propagate_block_up_tsdf(&mut block, 0);
        for (i, before) in snapshot.iter().enumerate() {
            assert_eq!(block.data(i).tsdf, before.tsdf);
            assert_eq!(block.data(i).weight, before.weight);
        }
    }

    #[test]
    fn test_occupancy_aggregate_consistency() {
        let mut block =
            OccupancyBlock::new(VoxelCoord::zero(), NodeIdx(0), OccupancyData::default());
        block.allocate_down_to(0);
        for z in 0..BLOCK_SIZE {
            for y in 0..BLOCK_SIZE {
                for x in 0..BLOCK_SIZE {
                    let idx = block.voxel_idx(VoxelCoord::new(x, y, z), 0);
                    // Field varies with position.
                    let sample = -1.0 - (x + y + z) as f32 * 0.05;
                    block.mean_slice_mut(0)[idx].integrate(sample, 100.0);
                }
            }
        }
        propagate_block_up_occupancy(&mut block);
        for scale in 1..=BLOCK_MAX_SCALE {
            let stride = 1 << scale;
            for z in (0..BLOCK_SIZE).step_by(stride as usize) {
                for y in (0..BLOCK_SIZE).step_by(stride as usize) {
                    for x in (0..BLOCK_SIZE).step_by(stride as usize) {
                        let parent = VoxelCoord::new(x, y, z);
                        let idx = block.voxel_idx(parent, scale);
                        let min = block.min_slice(scale)[idx];
                        let max = block.max_slice(scale)[idx];
                        assert!(min.field() <= max.field());
                        assert!(min.observed && max.observed, "all children observed");
                        for child in child_coords(parent, stride / 2) {
                            let cidx = block.voxel_idx(child, scale - 1);
                            let child_field = block.mean_slice(scale - 1)[cidx].field();
                            assert!(
                                min.field() <= child_field + 1e-4
                                    && child_field <= max.field() + 1e-4,
                                "min/max enclose every child"
                            );
                        }
                    }
                }
            }
        }
    }
}
