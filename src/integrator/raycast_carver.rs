//! TSDF allocation by carving along each depth pixel's ray.
//!
//! Every valid depth pixel contributes the segment of its ray covering
//! the truncation band around the measured surface. The blocks the
//! segment passes through are collected into a deduplicated set and
//! materialized in one pass, so the updater only ever visits allocated
//! blocks.

use nalgebra::{Isometry3, Point3};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;

use crate::config::Scheduling;
use crate::core::voxel::{VoxelCoord, BLOCK_SIZE};
use crate::core::DepthImage;
use crate::map::TsdfMap;
use crate::octree::BlockIdx;
use crate::sensor::SensorModel;

/// Collect the corner coordinates of the blocks a voxel-space segment
/// passes through. Standard 3D DDA over the block grid.
pub(crate) fn blocks_on_segment(
    start_f: &Point3<f32>,
    end_f: &Point3<f32>,
    map_size: i32,
    out: &mut Vec<VoxelCoord>,
) {
    let cell_dim = BLOCK_SIZE as f32;
    let dir = end_f - start_f;
    let mut cell = [
        (start_f.x / cell_dim).floor() as i32,
        (start_f.y / cell_dim).floor() as i32,
        (start_f.z / cell_dim).floor() as i32,
    ];
    let end_cell = [
        (end_f.x / cell_dim).floor() as i32,
        (end_f.y / cell_dim).floor() as i32,
        (end_f.z / cell_dim).floor() as i32,
    ];
    let mut step = [0i32; 3];
    let mut t_max = [f32::INFINITY; 3];
    let mut t_delta = [f32::INFINITY; 3];
    for axis in 0..3 {
        if dir[axis].abs() > 1e-9 {
            step[axis] = if dir[axis] > 0.0 { 1 } else { -1 };
            t_delta[axis] = cell_dim / dir[axis].abs();
            let boundary = if dir[axis] > 0.0 {
                (cell[axis] + 1) as f32 * cell_dim
            } else {
                cell[axis] as f32 * cell_dim
            };
            t_max[axis] = (boundary - start_f[axis]) / dir[axis];
        }
    }

    let max_cells = map_size / BLOCK_SIZE;
    // Every DDA step moves one cell closer to the end cell.
    let max_steps = ((end_cell[0] - cell[0]).abs()
        + (end_cell[1] - cell[1]).abs()
        + (end_cell[2] - cell[2]).abs()) as usize
        + 1;
    for _ in 0..max_steps {
        let coord = VoxelCoord::new(
            cell[0] * BLOCK_SIZE,
            cell[1] * BLOCK_SIZE,
            cell[2] * BLOCK_SIZE,
        );
        if cell.iter().all(|&c| c >= 0 && c < max_cells) {
            out.push(coord);
        }
        if cell == end_cell {
            return;
        }
        let axis = if t_max[0] < t_max[1] {
            if t_max[0] < t_max[2] {
                0
            } else {
                2
            }
        } else if t_max[1] < t_max[2] {
            1
        } else {
            2
        };
        t_max[axis] += t_delta[axis];
        cell[axis] += step[axis];
    }
}

/// Carve the truncation band of every depth pixel into the octree and
/// return the touched blocks.
pub(crate) fn allocate<S: SensorModel>(
    map: &mut TsdfMap,
    sensor: &S,
    depth_img: &DepthImage,
    t_ws: &Isometry3<f32>,
    band: f32,
    scheduling: Scheduling,
) -> Vec<BlockIdx> {
    let width = depth_img.width();
    let height = depth_img.height();
    let map_size = map.octree().size();
    let origin = map.origin();
    let resolution = map.resolution();

    let block_coords: Mutex<HashSet<VoxelCoord>> = Mutex::new(HashSet::new());

    let carve_pixel = |idx: usize| {
        let x = (idx % width) as i32;
        let y = (idx / width) as i32;
        let dir_s = sensor.back_project(&nalgebra::Vector2::new(x as f32, y as f32));
        let depth = *depth_img.get(x, y)?;
        if depth < sensor.near_dist(&dir_s) || depth > sensor.far_dist(&dir_s) {
            return None;
        }
        let m0 = (depth - 0.5 * band).max(sensor.near_dist(&dir_s));
        let m1 = depth + 0.5 * band;
        let start_w = t_ws * Point3::from(dir_s * m0);
        let end_w = t_ws * Point3::from(dir_s * m1);
        let start_f = Point3::from((start_w - origin) / resolution);
        let end_f = Point3::from((end_w - origin) / resolution);
        let mut segment = Vec::with_capacity(8);
        blocks_on_segment(&start_f, &end_f, map_size, &mut segment);
        if !segment.is_empty() {
            block_coords.lock().extend(segment);
        }
        Some(())
    };

    match scheduling {
        Scheduling::WorkStealing => {
            (0..width * height).into_par_iter().for_each(|idx| {
                let _ = carve_pixel(idx);
            });
        }
        Scheduling::Serial => {
            for idx in 0..width * height {
                let _ = carve_pixel(idx);
            }
        }
    }

    let coords = block_coords.into_inner();
    let mut blocks = Vec::with_capacity(coords.len());
    for coord in coords {
        if let Some(idx) = map.octree_mut().allocate_block_at(coord) {
            blocks.push(idx);
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_within_one_block() {
        let mut out = Vec::new();
        blocks_on_segment(
            &Point3::new(1.0, 1.0, 1.0),
            &Point3::new(6.0, 6.0, 6.0),
            32,
            &mut out,
        );
        assert_eq!(out, vec![VoxelCoord::zero()]);
    }

    #[test]
    fn test_segment_crosses_blocks_along_axis() {
        let mut out = Vec::new();
        blocks_on_segment(
            &Point3::new(1.0, 4.0, 4.0),
            &Point3::new(30.0, 4.0, 4.0),
            32,
            &mut out,
        );
        assert_eq!(
            out,
            vec![
                VoxelCoord::new(0, 0, 0),
                VoxelCoord::new(8, 0, 0),
                VoxelCoord::new(16, 0, 0),
                VoxelCoord::new(24, 0, 0),
            ]
        );
    }

    #[test]
    fn test_segment_clips_to_map() {
        let mut out = Vec::new();
        blocks_on_segment(
            &Point3::new(-10.0, 1.0, 1.0),
            &Point3::new(10.0, 1.0, 1.0),
            32,
            &mut out,
        );
        assert_eq!(
            out,
            vec![VoxelCoord::new(0, 0, 0), VoxelCoord::new(8, 0, 0)]
        );
    }
}
