//! Depth-first iterators over octants.
//!
//! All iterators walk the tree from the root; changes to the octree
//! while iterating invalidate them, so they borrow it immutably. The
//! frustum iterator additionally prunes subtrees whose bounding sphere
//! falls outside a sensor frustum, and the update iterator prunes
//! subtrees whose timestamp is older than the query frame.

use nalgebra::{Isometry3, Point3};

use super::block::VoxelBlock;
use super::octant::{OctantKey, Timestamp};
use super::Octree;
use crate::core::voxel::{VoxelCoord, BLOCK_SIZE};
use crate::sensor::SensorModel;

#[derive(Clone, Copy)]
enum IterKind {
    All,
    Nodes,
    Blocks,
    Leaves,
    /// Blocks updated at or after the frame.
    UpdatedSince(Timestamp),
}

/// Depth-first octant iterator with a selection rule.
pub struct OctantIter<'a, B: VoxelBlock> {
    octree: &'a Octree<B>,
    stack: Vec<OctantKey>,
    kind: IterKind,
}

impl<'a, B: VoxelBlock> OctantIter<'a, B> {
    fn new(octree: &'a Octree<B>, kind: IterKind) -> Self {
        Self {
            octree,
            stack: vec![OctantKey::Node(octree.root())],
            kind,
        }
    }

    fn skip_subtree(&self, key: OctantKey) -> bool {
        match (self.kind, key) {
            (IterKind::UpdatedSince(frame), OctantKey::Node(idx)) => {
                self.octree.node(idx).timestamp < frame
            }
            (IterKind::UpdatedSince(frame), OctantKey::Block(idx)) => {
                self.octree.block(idx).timestamp() < frame
            }
            _ => false,
        }
    }

    fn selects(&self, key: OctantKey) -> bool {
        match (self.kind, key) {
            (IterKind::All, _) => true,
            (IterKind::Nodes, OctantKey::Node(_)) => true,
            (IterKind::Blocks, OctantKey::Block(_)) => true,
            (IterKind::Leaves, OctantKey::Block(_)) => true,
            (IterKind::Leaves, OctantKey::Node(idx)) => self.octree.node(idx).is_leaf(),
            (IterKind::UpdatedSince(_), OctantKey::Block(_)) => true,
            _ => false,
        }
    }
}

impl<B: VoxelBlock> Iterator for OctantIter<'_, B> {
    type Item = OctantKey;

    fn next(&mut self) -> Option<OctantKey> {
        while let Some(key) = self.stack.pop() {
            if self.skip_subtree(key) {
                continue;
            }
            if let OctantKey::Node(idx) = key {
                let node = self.octree.node(idx);
                for child in node.children.iter().flatten() {
                    self.stack.push(*child);
                }
            }
            if self.selects(key) {
                return Some(key);
            }
        }
        None
    }
}

/// Blocks whose bounding sphere intersects a sensor frustum.
pub struct FrustumIter<'a, B: VoxelBlock, S: SensorModel> {
    octree: &'a Octree<B>,
    stack: Vec<OctantKey>,
    sensor: &'a S,
    /// World-to-sensor transform.
    t_sw: Isometry3<f32>,
    /// Voxel edge length in meters.
    voxel_dim: f32,
    /// World position of voxel (0, 0, 0).
    origin_w: Point3<f32>,
}

impl<'a, B: VoxelBlock, S: SensorModel> FrustumIter<'a, B, S> {
    pub(crate) fn new(
        octree: &'a Octree<B>,
        sensor: &'a S,
        t_sw: Isometry3<f32>,
        voxel_dim: f32,
        origin_w: Point3<f32>,
    ) -> Self {
        Self {
            octree,
            stack: vec![OctantKey::Node(octree.root())],
            sensor,
            t_sw,
            voxel_dim,
            origin_w,
        }
    }

    fn in_frustum(&self, coord: VoxelCoord, size: i32) -> bool {
        let half = 0.5 * size as f32 * self.voxel_dim;
        let centre_w = self.origin_w
            + (nalgebra::Vector3::from(coord) * self.voxel_dim
                + nalgebra::Vector3::new(half, half, half));
        let centre_s = self.t_sw * centre_w;
        let radius = 3.0f32.sqrt() * half;
        self.sensor.sphere_in_frustum(&centre_s, radius)
    }
}

impl<B: VoxelBlock, S: SensorModel> Iterator for FrustumIter<'_, B, S> {
    type Item = super::BlockIdx;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(key) = self.stack.pop() {
            match key {
                OctantKey::Node(idx) => {
                    let node = self.octree.node(idx);
                    if !self.in_frustum(node.coord, node.size) {
                        continue;
                    }
                    for child in node.children.iter().flatten() {
                        self.stack.push(*child);
                    }
                }
                OctantKey::Block(idx) => {
                    if self.in_frustum(self.octree.block(idx).coord(), BLOCK_SIZE) {
                        return Some(idx);
                    }
                }
            }
        }
        None
    }
}

impl<B: VoxelBlock> Octree<B> {
    /// All octants, depth first.
    pub fn iter(&self) -> OctantIter<'_, B> {
        OctantIter::new(self, IterKind::All)
    }

    /// Interior nodes only.
    pub fn iter_nodes(&self) -> OctantIter<'_, B> {
        OctantIter::new(self, IterKind::Nodes)
    }

    /// Blocks only.
    pub fn iter_blocks(&self) -> impl Iterator<Item = super::BlockIdx> + '_ {
        OctantIter::new(self, IterKind::Blocks).filter_map(OctantKey::as_block)
    }

    /// Leaves: blocks and childless nodes.
    pub fn iter_leaves(&self) -> OctantIter<'_, B> {
        OctantIter::new(self, IterKind::Leaves)
    }

    /// Blocks integrated at or after the given frame. Subtrees whose
    /// root timestamp is older are skipped wholesale.
    pub fn iter_updated_since(
        &self,
        frame: Timestamp,
    ) -> impl Iterator<Item = super::BlockIdx> + '_ {
        OctantIter::new(self, IterKind::UpdatedSince(frame)).filter_map(OctantKey::as_block)
    }
}
