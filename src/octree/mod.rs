//! The sparse octree store.
//!
//! An 8-ary tree rooted at a cube whose side is a power of two of at
//! least two voxel blocks. Interior nodes carry aggregated data; blocks
//! at side [`crate::core::BLOCK_SIZE`] carry the per-voxel pyramids and
//! are always leaves. Octants are created lazily by the allocators and
//! freed in bulk, either at drop or when the occupancy propagator prunes
//! a fully-free subtree.

pub mod block;
pub mod block_occupancy;
pub mod block_tsdf;
pub mod iterator;
pub mod octant;
pub(crate) mod pool;
pub mod propagator;
pub mod visitor;

pub use block::VoxelBlock;
pub use block_occupancy::OccupancyBlock;
pub use block_tsdf::{TsdfBlock, TsdfDelta};
pub use octant::{BlockIdx, Node, NodeIdx, OctantKey, Timestamp};

use log::trace;

use crate::core::voxel::{power_two_up, size_to_scale, VoxelCoord, BLOCK_SIZE};
use pool::OctantPool;

/// Sparse hierarchical voxel store, monomorphic over the block flavour.
#[derive(Debug)]
pub struct Octree<B: VoxelBlock> {
    size: i32,
    root: NodeIdx,
    pool: OctantPool<B::Data, B>,
    /// Inclusive voxel bounds of all allocated blocks.
    aabb: Option<(VoxelCoord, VoxelCoord)>,
}

impl<B: VoxelBlock> Octree<B> {
    /// Create an octree with the requested side in voxels, rounded up to
    /// the next power of two that is at least two blocks.
    pub fn new(size: i32) -> Self {
        let size = power_two_up(size.max(2 * BLOCK_SIZE));
        let mut pool = OctantPool::new();
        let root = pool.alloc_node(Node::new(
            VoxelCoord::zero(),
            size,
            None,
            B::Data::default(),
        ));
        Self {
            size,
            root,
            pool,
            aabb: None,
        }
    }

    /// Side length in voxels.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Scale of the root: log2 of the side length.
    pub fn max_scale(&self) -> i32 {
        size_to_scale(self.size)
    }

    /// Depth at which blocks live; equals the number of node levels.
    pub fn block_depth(&self) -> i32 {
        self.max_scale() - size_to_scale(BLOCK_SIZE)
    }

    /// Whether a voxel coordinate lies inside the map cube.
    pub fn contains(&self, voxel: VoxelCoord) -> bool {
        voxel.x >= 0
            && voxel.x < self.size
            && voxel.y >= 0
            && voxel.y < self.size
            && voxel.z >= 0
            && voxel.z < self.size
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    pub fn node(&self, idx: NodeIdx) -> &Node<B::Data> {
        self.pool.node(idx)
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut Node<B::Data> {
        self.pool.node_mut(idx)
    }

    pub fn block(&self, idx: BlockIdx) -> &B {
        self.pool.block(idx)
    }

    pub fn block_mut(&mut self, idx: BlockIdx) -> &mut B {
        self.pool.block_mut(idx)
    }

    /// Raw mutable view of the block arena for block-parallel kernels.
    pub(crate) fn blocks_raw_mut(&mut self) -> &mut [B] {
        self.pool.blocks_raw_mut()
    }

    /// Total block arena slots, the extent of valid handles.
    pub(crate) fn block_slot_count(&self) -> usize {
        self.pool.block_slot_count()
    }

    /// Number of live interior nodes.
    pub fn node_count(&self) -> usize {
        self.pool.node_count()
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.pool.block_count()
    }

    /// Voxel bounds of the allocated blocks, inclusive on both ends.
    pub fn aabb(&self) -> Option<(VoxelCoord, VoxelCoord)> {
        self.aabb
    }

    /// Allocate the child octant of a node, or return it if it exists.
    ///
    /// Children of nodes two blocks wide are blocks; all other children
    /// are nodes. The child inherits the parent's aggregate data. The
    /// call is idempotent: every caller observes the same handle.
    pub fn allocate_child(&mut self, parent: NodeIdx, child_idx: usize) -> OctantKey {
        debug_assert!(child_idx < 8);
        if let Some(existing) = self.pool.node(parent).children[child_idx] {
            return existing;
        }
        let (coord, parent_size, init_data) = {
            let node = self.pool.node(parent);
            (node.child_coord(child_idx), node.size, node.data)
        };
        let key = if parent_size == 2 * BLOCK_SIZE {
            let idx = self.pool.alloc_block(B::new(coord, parent, init_data));
            self.extend_aabb(coord, BLOCK_SIZE);
            OctantKey::Block(idx)
        } else {
            let idx = self.pool.alloc_node(Node::new(
                coord,
                parent_size / 2,
                Some(parent),
                init_data,
            ));
            OctantKey::Node(idx)
        };
        self.pool.node_mut(parent).children[child_idx] = Some(key);
        key
    }

    /// Allocate (or fetch) the block containing a voxel, creating the
    /// intermediate nodes on the way down.
    pub fn allocate_block_at(&mut self, voxel: VoxelCoord) -> Option<BlockIdx> {
        if !self.contains(voxel) {
            return None;
        }
        let mut node = self.root;
        loop {
            let (coord, size) = {
                let n = self.pool.node(node);
                (n.coord, n.size)
            };
            let child_idx = voxel.child_index(coord, size);
            match self.allocate_child(node, child_idx) {
                OctantKey::Block(idx) => return Some(idx),
                OctantKey::Node(idx) => node = idx,
            }
        }
    }

    /// Finest allocated octant containing a voxel.
    pub fn fetch(&self, voxel: VoxelCoord) -> Option<OctantKey> {
        if !self.contains(voxel) {
            return None;
        }
        let mut key = OctantKey::Node(self.root);
        loop {
            let node = match key {
                OctantKey::Block(_) => return Some(key),
                OctantKey::Node(idx) => self.pool.node(idx),
            };
            match node.children[voxel.child_index(node.coord, node.size)] {
                Some(child) => key = child,
                None => return Some(key),
            }
        }
    }

    /// The allocated block containing a voxel, if any.
    pub fn fetch_block(&self, voxel: VoxelCoord) -> Option<BlockIdx> {
        match self.fetch(voxel)? {
            OctantKey::Block(idx) => Some(idx),
            OctantKey::Node(_) => None,
        }
    }

    /// Free the whole subtree below a node, returning the octants to the
    /// arena. The only steady-state shrink path of the map.
    pub fn delete_children(&mut self, parent: NodeIdx) {
        for child_idx in 0..8 {
            let Some(child) = self.pool.node(parent).children[child_idx] else {
                continue;
            };
            match child {
                OctantKey::Block(idx) => self.pool.release_block(idx),
                OctantKey::Node(idx) => {
                    self.delete_children(idx);
                    self.pool.release_node(idx);
                }
            }
            self.pool.node_mut(parent).children[child_idx] = None;
        }
        trace!(
            "pruned subtree below node at {:?}",
            self.pool.node(parent).coord
        );
    }

    fn extend_aabb(&mut self, coord: VoxelCoord, size: i32) {
        let max = coord + VoxelCoord::splat(size - 1);
        self.aabb = Some(match self.aabb {
            Some((lo, hi)) => (lo.min(coord), hi.max(max)),
            None => (coord, max),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounds_up() {
        let octree: Octree<TsdfBlock> = Octree::new(20);
        assert_eq!(octree.size(), 32);
        let octree: Octree<TsdfBlock> = Octree::new(4);
        assert_eq!(octree.size(), 16, "at least two blocks per side");
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let mut octree: Octree<TsdfBlock> = Octree::new(32);
        let first = octree.allocate_child(octree.root(), 3);
        let nodes = octree.node_count();
        let blocks = octree.block_count();
        for _ in 0..16 {
            assert_eq!(
                octree.allocate_child(octree.root(), 3),
                first,
                "every caller observes the same octant"
            );
        }
        assert_eq!(octree.node_count(), nodes);
        assert_eq!(octree.block_count(), blocks);
    }

    #[test]
    fn test_blocks_are_leaves_at_block_depth() {
        let mut octree: Octree<TsdfBlock> = Octree::new(32);
        let block = octree
            .allocate_block_at(VoxelCoord::new(17, 3, 30))
            .unwrap();
        assert_eq!(octree.block(block).coord(), VoxelCoord::new(16, 0, 24));
        // 32 -> 16 node level, then blocks at 8.
        assert_eq!(octree.block_depth(), 2);
        assert_eq!(octree.node_count(), 2);
    }

    #[test]
    fn test_fetch_finds_finest_octant() {
        let mut octree: Octree<TsdfBlock> = Octree::new(32);
        let voxel = VoxelCoord::new(9, 9, 9);
        assert!(matches!(
            octree.fetch(voxel),
            Some(OctantKey::Node(idx)) if idx == octree.root()
        ));
        let block = octree.allocate_block_at(voxel).unwrap();
        assert_eq!(octree.fetch_block(voxel), Some(block));
        assert_eq!(octree.fetch(VoxelCoord::new(-1, 0, 0)), None);
    }

    #[test]
    fn test_aabb_tracks_blocks() {
        let mut octree: Octree<TsdfBlock> = Octree::new(64);
        assert_eq!(octree.aabb(), None);
        octree.allocate_block_at(VoxelCoord::new(9, 9, 9));
        octree.allocate_block_at(VoxelCoord::new(40, 3, 17));
        let (lo, hi) = octree.aabb().unwrap();
        assert_eq!(lo, VoxelCoord::new(8, 0, 8));
        assert_eq!(hi, VoxelCoord::new(47, 15, 23));
    }

    #[test]
    fn test_delete_children_recycles_slots() {
        let mut octree: Octree<TsdfBlock> = Octree::new(32);
        octree.allocate_block_at(VoxelCoord::new(1, 1, 1));
        let parent = match octree.node(octree.root()).children[0].unwrap() {
            OctantKey::Node(idx) => idx,
            OctantKey::Block(_) => unreachable!("size-16 children are nodes"),
        };
        let blocks_before = octree.block_count();
        octree.delete_children(parent);
        assert_eq!(octree.block_count(), blocks_before - 1);
        assert!(octree.node(parent).is_leaf());
    }
}
