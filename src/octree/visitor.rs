//! Read-only octree queries: data lookup, interpolation, gradients.
//!
//! All functions work in voxel coordinates (fractional where a point is
//! expected) and follow one pattern: `None` means "outside the map",
//! "not allocated" or "invalid data". Interpolation is cell-centered,
//! sampling voxel `v` at scale `s` at `(v/2^s + 0.5) * 2^s`, and
//! escalates to a coarser scale when any corner only carries data
//! coarser than requested.

use nalgebra::{Point3, Vector3};

use super::block::VoxelBlock;
use super::block_occupancy::OccupancyBlock;
use super::octant::OctantKey;
use super::Octree;
use crate::core::voxel::{VoxelCoord, BLOCK_MAX_SCALE};
use crate::core::{OccupancyData, VoxelData};

/// Data of the finest allocated octant containing a voxel.
///
/// Inside a block this is the block data at its current scale; in an
/// unallocated region it is the data of the finest allocated ancestor
/// node (which carries meaningful aggregates for occupancy maps).
pub fn get_data<B: VoxelBlock>(octree: &Octree<B>, voxel: VoxelCoord) -> Option<B::Data> {
    match octree.fetch(voxel)? {
        OctantKey::Block(idx) => Some(octree.block(idx).data_at(voxel, 0).0),
        OctantKey::Node(idx) => Some(octree.node(idx).data),
    }
}

/// Data at the desired scale or coarser, with the scale it came from.
pub fn get_data_at_scale<B: VoxelBlock>(
    octree: &Octree<B>,
    voxel: VoxelCoord,
    desired_scale: i32,
) -> Option<(B::Data, i32)> {
    match octree.fetch(voxel)? {
        OctantKey::Block(idx) => Some(octree.block(idx).data_at(voxel, desired_scale)),
        OctantKey::Node(idx) => {
            let node = octree.node(idx);
            Some((node.data, crate::core::voxel::size_to_scale(node.size)))
        }
    }
}

/// Field value of a voxel, `None` when the data is invalid.
pub fn get_field<B: VoxelBlock>(octree: &Octree<B>, voxel: VoxelCoord) -> Option<f32> {
    let data = get_data(octree, voxel)?;
    data.is_valid().then(|| data.field())
}

/// The eight cell-centered corner data values around a fractional voxel
/// position at one scale, plus the interpolation weights.
struct Corners<D> {
    data: [D; 8],
    frac: Vector3<f32>,
    scale: i32,
}

fn gather_corners<B: VoxelBlock>(
    octree: &Octree<B>,
    voxel_f: &Point3<f32>,
    desired_scale: i32,
) -> Option<Corners<B::Data>> {
    let mut scale = desired_scale.clamp(0, BLOCK_MAX_SCALE);
    'retry: loop {
        let stride = (1 << scale) as f32;
        let gx = voxel_f.x / stride - 0.5;
        let gy = voxel_f.y / stride - 0.5;
        let gz = voxel_f.z / stride - 0.5;
        let base = VoxelCoord::new(
            gx.floor() as i32,
            gy.floor() as i32,
            gz.floor() as i32,
        );
        let frac = Vector3::new(
            gx - base.x as f32,
            gy - base.y as f32,
            gz - base.z as f32,
        );

        let mut data = [B::Data::default(); 8];
        for (i, slot) in data.iter_mut().enumerate() {
            let offset = VoxelCoord::new(
                (i & 1) as i32,
                ((i >> 1) & 1) as i32,
                ((i >> 2) & 1) as i32,
            );
            let corner = (base + offset) * (1 << scale);
            if !octree.contains(corner) {
                return None;
            }
            let corner_data = match octree.fetch(corner)? {
                OctantKey::Block(idx) => {
                    let block = octree.block(idx);
                    if block.current_scale() > scale {
                        // A corner only holds coarser data: escalate and
                        // re-gather every corner at that scale.
                        scale = block.current_scale();
                        continue 'retry;
                    }
                    // Above the block scales a block contributes its
                    // coarsest aggregate.
                    block.data_at(corner, scale.min(BLOCK_MAX_SCALE)).0
                }
                OctantKey::Node(idx) => {
                    let node = octree.node(idx);
                    // A leaf node (a pruned subtree) carries one
                    // aggregate for its whole footprint: escalate so it
                    // is not folded into a finer stencil.
                    let node_scale = crate::core::voxel::size_to_scale(node.size);
                    if node_scale > scale {
                        scale = node_scale;
                        continue 'retry;
                    }
                    node.data
                }
            };
            if !corner_data.is_valid() {
                return None;
            }
            *slot = corner_data;
        }
        return Some(Corners { data, frac, scale });
    }
}

fn trilinear(values: &[f32; 8], frac: &Vector3<f32>) -> f32 {
    let c00 = values[0] * (1.0 - frac.x) + values[1] * frac.x;
    let c10 = values[2] * (1.0 - frac.x) + values[3] * frac.x;
    let c01 = values[4] * (1.0 - frac.x) + values[5] * frac.x;
    let c11 = values[6] * (1.0 - frac.x) + values[7] * frac.x;
    let c0 = c00 * (1.0 - frac.y) + c10 * frac.y;
    let c1 = c01 * (1.0 - frac.y) + c11 * frac.y;
    c0 * (1.0 - frac.z) + c1 * frac.z
}

/// Trilinearly interpolated field at a fractional voxel position.
///
/// Returns the value and the scale it was interpolated at, which is
/// never finer than `desired_scale` and can exceed the block scales
/// when a corner falls inside a pruned subtree. `None` when any corner
/// is invalid or outside the allocated region.
pub fn get_field_interp<B: VoxelBlock>(
    octree: &Octree<B>,
    voxel_f: &Point3<f32>,
    desired_scale: i32,
) -> Option<(f32, i32)> {
    let corners = gather_corners(octree, voxel_f, desired_scale)?;
    let values = corners.data.map(|d| d.field());
    Some((trilinear(&values, &corners.frac), corners.scale))
}

/// Field gradient at a fractional voxel position, in field units per
/// voxel.
pub fn get_field_grad<B: VoxelBlock>(
    octree: &Octree<B>,
    voxel_f: &Point3<f32>,
    desired_scale: i32,
) -> Option<(Vector3<f32>, i32)> {
    let corners = gather_corners(octree, voxel_f, desired_scale)?;
    let v = corners.data.map(|d| d.field());
    let f = &corners.frac;
    let stride = (1 << corners.scale) as f32;
    let gx = (v[1] - v[0]) * (1.0 - f.y) * (1.0 - f.z)
        + (v[3] - v[2]) * f.y * (1.0 - f.z)
        + (v[5] - v[4]) * (1.0 - f.y) * f.z
        + (v[7] - v[6]) * f.y * f.z;
    let gy = (v[2] - v[0]) * (1.0 - f.x) * (1.0 - f.z)
        + (v[3] - v[1]) * f.x * (1.0 - f.z)
        + (v[6] - v[4]) * (1.0 - f.x) * f.z
        + (v[7] - v[5]) * f.x * f.z;
    let gz = (v[4] - v[0]) * (1.0 - f.x) * (1.0 - f.y)
        + (v[5] - v[1]) * f.x * (1.0 - f.y)
        + (v[6] - v[2]) * (1.0 - f.x) * f.y
        + (v[7] - v[3]) * f.x * f.y;
    Some((Vector3::new(gx, gy, gz) / stride, corners.scale))
}

/// Trilinearly interpolated colour at a fractional voxel position.
#[cfg(feature = "colour")]
pub fn get_colour_interp<B: VoxelBlock>(
    octree: &Octree<B>,
    voxel_f: &Point3<f32>,
    desired_scale: i32,
) -> Option<(crate::core::ColourData, i32)> {
    let corners = gather_corners(octree, voxel_f, desired_scale)?;
    let channel = |get: fn(&crate::core::ColourData) -> u8| -> f32 {
        let values = corners.data.map(|d| get(&d.colour()) as f32);
        trilinear(&values, &corners.frac)
    };
    let colour = crate::core::ColourData::new(
        channel(|c| c.r).round() as u8,
        channel(|c| c.g).round() as u8,
        channel(|c| c.b).round() as u8,
    );
    Some((colour, corners.scale))
}

/// Max occupancy aggregate covering a voxel at the given scale.
///
/// Falls back to the finest allocated ancestor when the requested scale
/// is not materialized. Returns default (invalid) data outside the map.
pub fn get_max_data(
    octree: &Octree<OccupancyBlock>,
    voxel: VoxelCoord,
    scale: i32,
) -> OccupancyData {
    occupancy_aggregate(octree, voxel, scale, |node| node.max_data, |block, v, s| {
        block.max_data_at(v, s).0
    })
}

/// Min occupancy aggregate covering a voxel at the given scale.
pub fn get_min_data(
    octree: &Octree<OccupancyBlock>,
    voxel: VoxelCoord,
    scale: i32,
) -> OccupancyData {
    occupancy_aggregate(octree, voxel, scale, |node| node.min_data, |block, v, s| {
        block.min_data_at(v, s).0
    })
}

fn occupancy_aggregate(
    octree: &Octree<OccupancyBlock>,
    voxel: VoxelCoord,
    scale: i32,
    node_get: impl Fn(&super::Node<OccupancyData>) -> OccupancyData,
    block_get: impl Fn(&OccupancyBlock, VoxelCoord, i32) -> OccupancyData,
) -> OccupancyData {
    if !octree.contains(voxel) {
        return OccupancyData::default();
    }
    let size_at_scale = 1i64 << scale.max(0);
    let mut key = OctantKey::Node(octree.root());
    loop {
        match key {
            OctantKey::Block(idx) => {
                return block_get(octree.block(idx), voxel, scale.clamp(0, BLOCK_MAX_SCALE));
            }
            OctantKey::Node(idx) => {
                let node = octree.node(idx);
                if (node.size as i64) <= size_at_scale {
                    return node_get(node);
                }
                match node.children[voxel.child_index(node.coord, node.size)] {
                    Some(child) => key = child,
                    None => return node_get(node),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TsdfData;
    use crate::octree::TsdfBlock;

    fn octree_with_constant_field(value: f32) -> Octree<TsdfBlock> {
        let mut octree: Octree<TsdfBlock> = Octree::new(32);
        for bz in 0..2 {
            for by in 0..2 {
                for bx in 0..2 {
                    let idx = octree
                        .allocate_block_at(VoxelCoord::new(bx * 8, by * 8, bz * 8))
                        .unwrap();
                    let block = octree.block_mut(idx);
                    for z in 0..8 {
                        for y in 0..8 {
                            for x in 0..8 {
                                let v = block.coord() + VoxelCoord::new(x, y, z);
                                let i = block.voxel_idx(v, 0);
                                *block.data_mut(i) = TsdfData {
                                    tsdf: value,
                                    weight: 1.0,
                                    ..Default::default()
                                };
                            }
                        }
                    }
                }
            }
        }
        octree
    }

    #[test]
    fn test_interp_of_constant_field_is_constant() {
        let octree = octree_with_constant_field(0.25);
        let (value, scale) =
            get_field_interp(&octree, &Point3::new(7.3, 7.9, 8.2), 0).unwrap();
        assert!((value - 0.25).abs() < 1e-6);
        assert_eq!(scale, 0);
    }

    #[test]
    fn test_interp_none_outside_allocation() {
        let octree = octree_with_constant_field(0.25);
        // Corners at 20+ reach unallocated space.
        assert_eq!(get_field_interp(&octree, &Point3::new(20.0, 20.0, 20.0), 0), None);
    }

    #[test]
    fn test_gradient_of_constant_field_is_zero() {
        let octree = octree_with_constant_field(0.25);
        let (grad, _) = get_field_grad(&octree, &Point3::new(7.5, 7.5, 7.5), 0).unwrap();
        assert!(grad.norm() < 1e-6);
    }

    #[test]
    fn test_get_data_unallocated_returns_node_data() {
        let octree: Octree<TsdfBlock> = Octree::new(32);
        let data = get_data(&octree, VoxelCoord::new(1, 1, 1)).unwrap();
        assert_eq!(data.weight, 0.0, "root init data");
        assert_eq!(get_data(&octree, VoxelCoord::new(40, 0, 0)), None);
    }
}
