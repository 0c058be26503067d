//! Occupancy allocation by hierarchical volume carving.
//!
//! The carver descends the octree from the root, classifying every
//! octant against the depth frustum. Octants outside the frustum or
//! fully occluded are skipped; octants entirely inside free space are
//! collapsed into a single node-level free operation when small enough;
//! octants crossing the measured surface (or with varying depth under
//! their projection) are split down to blocks. Depth statistics under a
//! projected footprint come from a min/max pooling pyramid built once
//! per frame.

use nalgebra::{Isometry3, Point3};

use crate::core::voxel::VoxelCoord;
use crate::core::{DepthImage, Image};
use crate::map::OccupancyMap;
use crate::octree::{BlockIdx, NodeIdx, OctantKey};
use crate::sensor::{Projection, SensorModel};

/// What the carver produced for the updater.
#[derive(Debug, Default)]
pub(crate) struct VolumeCarverOutput {
    /// Nodes whose whole subtree is free space, for the bulk free pass.
    pub node_list: Vec<NodeIdx>,
    /// Blocks to run the per-voxel kernel on.
    pub block_list: Vec<BlockIdx>,
    /// Per block: the depth under its footprint is constant free space.
    pub low_variance: Vec<bool>,
    /// Per block: all eight corners project inside the image.
    pub projects_inside: Vec<bool>,
}

/// Min/max depth statistics of one pooled texel.
#[derive(Debug, Clone, Copy)]
struct PoolCell {
    min: f32,
    max: f32,
    /// The footprint contains a pixel without a valid measurement.
    invalid: bool,
}

impl PoolCell {
    const EMPTY: PoolCell = PoolCell {
        min: f32::MAX,
        max: f32::MIN,
        invalid: false,
    };

    fn merge(self, other: PoolCell) -> PoolCell {
        PoolCell {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            invalid: self.invalid || other.invalid,
        }
    }
}

/// Min/max mip pyramid over the depth image.
struct DepthPooling {
    levels: Vec<Image<PoolCell>>,
}

impl DepthPooling {
    fn build(depth_img: &DepthImage) -> Self {
        let width = depth_img.width();
        let height = depth_img.height();
        let mut base = Image::new(width, height, PoolCell::EMPTY);
        for y in 0..height {
            for x in 0..width {
                let depth = *depth_img.pixel(x, y);
                *base.pixel_mut(x, y) = if depth > 0.0 {
                    PoolCell {
                        min: depth,
                        max: depth,
                        invalid: false,
                    }
                } else {
                    PoolCell {
                        min: f32::MAX,
                        max: f32::MIN,
                        invalid: true,
                    }
                };
            }
        }
        let mut levels = vec![base];
        loop {
            let prev = &levels[levels.len() - 1];
            if prev.width() <= 1 && prev.height() <= 1 {
                break;
            }
            let w = prev.width().div_ceil(2);
            let h = prev.height().div_ceil(2);
            let mut next = Image::new(w, h, PoolCell::EMPTY);
            for y in 0..h {
                for x in 0..w {
                    let mut cell = PoolCell::EMPTY;
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let px = 2 * x + dx;
                        let py = 2 * y + dy;
                        if px < prev.width() && py < prev.height() {
                            cell = cell.merge(*prev.pixel(px, py));
                        }
                    }
                    *next.pixel_mut(x, y) = cell;
                }
            }
            levels.push(next);
        }
        Self { levels }
    }

    /// Pooled statistics over an inclusive pixel rectangle.
    fn query(&self, x0: i32, y0: i32, x1: i32, y1: i32) -> PoolCell {
        let base = &self.levels[0];
        let x0 = x0.clamp(0, base.width() as i32 - 1);
        let x1 = x1.clamp(0, base.width() as i32 - 1);
        let y0 = y0.clamp(0, base.height() as i32 - 1);
        let y1 = y1.clamp(0, base.height() as i32 - 1);
        let extent = (x1 - x0 + 1).max(y1 - y0 + 1) as u32;
        let level = (32 - (extent - 1).leading_zeros()) as usize;
        let level = level.min(self.levels.len() - 1);
        let img = &self.levels[level];
        let mut cell = PoolCell::EMPTY;
        for ty in (y0 >> level)..=(y1 >> level) {
            for tx in (x0 >> level)..=(x1 >> level) {
                cell = cell.merge(*img.pixel(tx as usize, ty as usize));
            }
        }
        cell
    }
}

enum Classification {
    /// Outside the frustum or fully occluded; leave unallocated.
    Skip,
    /// Entirely in front of every depth measurement under its footprint.
    Free { projects_inside: bool },
    /// Crosses the measurement band or has varying depth; refine.
    Crossing { projects_inside: bool },
}

struct Carver<'a, S: SensorModel> {
    map: &'a mut OccupancyMap,
    sensor: &'a S,
    pooling: DepthPooling,
    t_sw: Isometry3<f32>,
    max_free_node_size: i32,
    out: VolumeCarverOutput,
}

impl<S: SensorModel> Carver<'_, S> {
    fn classify(&self, coord: VoxelCoord, size: i32) -> Classification {
        let resolution = self.map.resolution();
        let centre_s = self.t_sw * self.map.voxel_to_point(coord, size);
        let radius = 3.0f32.sqrt() * 0.5 * size as f32 * resolution;
        if !self.sensor.sphere_in_frustum(&centre_s, radius) {
            return Classification::Skip;
        }

        // Pixel footprint from the eight corner projections.
        let mut x0 = i32::MAX;
        let mut y0 = i32::MAX;
        let mut x1 = i32::MIN;
        let mut y1 = i32::MIN;
        let mut projected = 0;
        let mut projects_inside = true;
        for corner_idx in 0..8 {
            let corner = coord.child_coord(2 * size, corner_idx);
            let corner_s = self.t_sw
                * self
                    .map
                    .voxel_f_to_point(&Point3::new(corner.x as f32, corner.y as f32, corner.z as f32));
            match self.sensor.project(&corner_s) {
                Projection::Ok(pixel) => {
                    projected += 1;
                    x0 = x0.min(pixel.x.floor() as i32);
                    x1 = x1.max(pixel.x.ceil() as i32);
                    y0 = y0.min(pixel.y.floor() as i32);
                    y1 = y1.max(pixel.y.ceil() as i32);
                }
                _ => projects_inside = false,
            }
        }
        if projected == 0 {
            // Overlaps the frustum but no corner pixel to pool from.
            return Classification::Crossing {
                projects_inside: false,
            };
        }

        let pooled = self.pooling.query(x0, y0, x1, y1);
        if pooled.invalid {
            return Classification::Crossing { projects_inside };
        }
        let m = self.sensor.measurement_from_point(&centre_s);
        let three_sigma = self
            .map
            .config()
            .three_sigma(pooled.max, resolution);
        if m - radius > pooled.max + three_sigma {
            // Fully behind every surface: unobservable.
            return Classification::Skip;
        }
        // Only an octant that projects entirely into the image may be
        // declared free as a whole; anything poking past the image
        // border is refined so the per-voxel kernel can reject the
        // unmeasured voxels.
        if projects_inside && m + radius < pooled.min - three_sigma {
            Classification::Free { projects_inside }
        } else {
            Classification::Crossing { projects_inside }
        }
    }

    fn carve_node(&mut self, node_idx: NodeIdx) {
        for child_idx in 0..8 {
            let (child_coord, child_size) = {
                let node = self.map.octree().node(node_idx);
                (node.child_coord(child_idx), node.size / 2)
            };
            match self.classify(child_coord, child_size) {
                Classification::Skip => {}
                Classification::Free { projects_inside } => {
                    if child_size > self.max_free_node_size {
                        // Too coarse to free in one operation; refine.
                        match self.map.octree_mut().allocate_child(node_idx, child_idx) {
                            OctantKey::Node(child) => self.carve_node(child),
                            OctantKey::Block(block) => {
                                self.push_block(block, true, projects_inside)
                            }
                        }
                    } else {
                        match self.map.octree_mut().allocate_child(node_idx, child_idx) {
                            OctantKey::Node(child) => self.out.node_list.push(child),
                            OctantKey::Block(block) => {
                                self.push_block(block, true, projects_inside)
                            }
                        }
                    }
                }
                Classification::Crossing { projects_inside } => {
                    match self.map.octree_mut().allocate_child(node_idx, child_idx) {
                        OctantKey::Node(child) => self.carve_node(child),
                        OctantKey::Block(block) => self.push_block(block, false, projects_inside),
                    }
                }
            }
        }
    }

    fn push_block(&mut self, block: BlockIdx, low_variance: bool, projects_inside: bool) {
        self.out.block_list.push(block);
        self.out.low_variance.push(low_variance);
        self.out.projects_inside.push(projects_inside);
    }
}

/// Carve the depth frustum into the octree.
pub(crate) fn carve<S: SensorModel>(
    map: &mut OccupancyMap,
    sensor: &S,
    depth_img: &DepthImage,
    t_ws: &Isometry3<f32>,
) -> VolumeCarverOutput {
    let pooling = DepthPooling::build(depth_img);
    let max_free_node_size = map.config().max_free_node_size;
    let root = map.octree().root();
    let mut carver = Carver {
        map,
        sensor,
        pooling,
        t_sw: t_ws.inverse(),
        max_free_node_size,
        out: VolumeCarverOutput::default(),
    };
    carver.carve_node(root);
    carver.out
}
