//! Occupancy integration tests: free-space carving and pruning.
//!
//! A pinhole camera at the world origin measures a constant depth
//! beyond the map cube, so everything inside its frustum is free space.
//! Repeated frames must saturate the log-odds, mark the cone observed,
//! and eventually let the propagator prune the carved subtrees.

use ghana_map::core::voxel::VoxelCoord;
use ghana_map::core::DepthImage;
use ghana_map::core::VoxelData;
use ghana_map::octree::propagator::{
    propagate_block_up_occupancy, propagate_to_root_occupancy,
};
use ghana_map::octree::{BlockIdx, OctantKey};
use ghana_map::sensor::{PinholeCamera, PinholeCameraConfig};
use ghana_map::{
    IntegratorConfig, MapConfig, MapIntegrator, Measurements, OccupancyConfig, OccupancyMap,
    Scheduling,
};
use nalgebra::{Isometry3, Point3};

const RESOLUTION: f32 = 0.05;

fn camera() -> PinholeCamera {
    PinholeCamera::new(PinholeCameraConfig {
        width: 16,
        height: 16,
        fx: 6.0,
        fy: 6.0,
        cx: 7.5,
        cy: 7.5,
        near_plane: 0.1,
        far_plane: 6.0,
    })
}

fn free_space_map(max_weight: f32, max_free_node_size: i32) -> OccupancyMap {
    OccupancyMap::new(
        &MapConfig {
            resolution: RESOLUTION,
            size: 32,
            origin: [-0.8, -0.8, 0.0],
        },
        OccupancyConfig {
            max_weight,
            // Small enough that whole nodes get freed block by block.
            max_free_node_size,
            ..Default::default()
        },
    )
    .unwrap()
}

fn integrator() -> MapIntegrator {
    MapIntegrator::new(IntegratorConfig {
        scheduling: Scheduling::Serial,
    })
}

/// Depth beyond the far side of the map: the whole frustum is free.
fn far_plane_image() -> DepthImage {
    DepthImage::new(16, 16, 2.5)
}

#[test]
fn test_two_frames_carve_observed_free_space() {
    let mut map = free_space_map(100.0, 64);
    let camera = camera();
    let image = far_plane_image();
    let integrator = integrator();

    for frame in 0..2 {
        integrator.integrate_depth_occupancy(
            &mut map,
            &Measurements::depth_only(&camera, &image, Isometry3::identity()),
            frame,
        );
    }

    let log_odd_min = map.config().log_odd_min;
    // Points along the optical axis, well inside the carved cone.
    for z in [0.3f32, 0.6, 0.9, 1.2] {
        let point = Point3::new(0.0, 0.0, z);
        let max_data = map.get_max_data(&point, 0).unwrap();
        assert!(
            max_data.field() <= log_odd_min,
            "free space at z={z}: max log-odds {} above a single free update",
            max_data.field()
        );
        assert!(max_data.observed, "carved space is observed at z={z}");
        assert!(max_data.weight >= 2.0, "two frames accumulated");
    }
}

#[test]
fn test_saturated_free_cone_is_pruned() {
    // A small weight cap makes the prune threshold reachable quickly.
    let mut map = free_space_map(5.0, 8);
    let camera = camera();
    let image = far_plane_image();
    let integrator = integrator();

    let mut peak_octants = 0;
    for frame in 0..8 {
        integrator.integrate_depth_occupancy(
            &mut map,
            &Measurements::depth_only(&camera, &image, Isometry3::identity()),
            frame,
        );
        peak_octants = peak_octants.max(map.octree().node_count() + map.octree().block_count());
    }

    let remaining = map.octree().node_count() + map.octree().block_count();
    assert!(
        remaining < peak_octants,
        "saturated free subtrees must shrink the octree ({remaining} vs peak {peak_octants})"
    );

    // The carved region still answers queries, now from node aggregates.
    let max_data = map.get_max_data(&Point3::new(0.0, 0.0, 1.0), 0).unwrap();
    assert!(max_data.observed);
    assert!(
        max_data.field() <= 0.95 * map.config().min_occupancy(),
        "pruned region reads as saturated free space"
    );
}

/// Allocate a block and fill every voxel with one observed sample.
fn fill_block(map: &mut OccupancyMap, coord: VoxelCoord, occupancy: f32, weight: f32) -> BlockIdx {
    let idx = map.octree_mut().allocate_block_at(coord).unwrap();
    let block = map.octree_mut().block_mut(idx);
    block.allocate_down_to(0);
    for voxel in block.mean_slice_mut(0) {
        voxel.occupancy = occupancy;
        voxel.weight = weight;
        voxel.observed = true;
    }
    propagate_block_up_occupancy(block);
    idx
}

/// Hand-built scene: saturated free space under every octree octant
/// except one, which holds a single occupied block. Propagation prunes
/// the free octants into leaf nodes right next to the block.
fn pruned_boundary_map() -> OccupancyMap {
    let mut map = OccupancyMap::new(
        &MapConfig {
            resolution: RESOLUTION,
            size: 32,
            origin: [0.0; 3],
        },
        OccupancyConfig::default(),
    )
    .unwrap();
    let log_odd_min = map.config().log_odd_min;
    let log_odd_max = map.config().log_odd_max;
    let max_weight = map.config().max_weight;

    let mut blocks = Vec::new();
    for child in 0..8i32 {
        if child == 1 {
            continue;
        }
        let base = VoxelCoord::new(
            (child & 1) * 16,
            ((child >> 1) & 1) * 16,
            ((child >> 2) & 1) * 16,
        );
        for sub in 0..8 {
            let coord = base.child_coord(16, sub);
            blocks.push(fill_block(&mut map, coord, log_odd_min, max_weight));
        }
    }
    blocks.push(fill_block(
        &mut map,
        VoxelCoord::new(16, 0, 0),
        log_odd_max,
        max_weight,
    ));

    let min_occupancy = map.config().min_occupancy();
    propagate_to_root_occupancy(map.octree_mut(), &blocks, &[], 0, min_occupancy);
    map
}

#[test]
fn test_interp_escalates_at_pruned_node_boundaries() {
    let map = pruned_boundary_map();

    // The saturated free octants collapsed into leaf nodes; the
    // occupied block survived next to one of them.
    let pruned = map.octree().fetch(VoxelCoord::new(1, 1, 1));
    let Some(OctantKey::Node(idx)) = pruned else {
        panic!("saturated free octant should have been pruned to a node");
    };
    assert_eq!(map.octree().node(idx).size, 16, "pruned at the octant level");
    assert!(
        map.octree().fetch_block(VoxelCoord::new(17, 1, 1)).is_some(),
        "the occupied block is not pruned"
    );

    // A stencil straddling the pruned node and the occupied block must
    // not fold the node-level aggregate into a per-voxel interpolation.
    let face = map.voxel_f_to_point(&Point3::new(16.0, 4.0, 4.0));
    match map.get_field_interp_at(&face, 0) {
        None => {}
        Some((_, scale)) => assert!(
            scale >= 4,
            "straddling stencil must escalate to the node scale, got scale {scale}"
        ),
    }

    // At the map centre every coarse corner carries a valid aggregate
    // (seven pruned free nodes and the occupied block), so the
    // escalated interpolation succeeds.
    let centre = map.voxel_f_to_point(&Point3::new(16.0, 16.0, 16.0));
    let (value, scale) = map
        .get_field_interp_at(&centre, 0)
        .expect("coarse corners are all observed");
    assert_eq!(scale, 4, "interpolated at the pruned-node scale");
    assert!(value < 0.0, "seven free octants outweigh one occupied block");
}

#[test]
fn test_unobserved_space_stays_untouched() {
    let mut map = free_space_map(100.0, 64);
    let camera = camera();
    let image = far_plane_image();

    integrator().integrate_depth_occupancy(
        &mut map,
        &Measurements::depth_only(&camera, &image, Isometry3::identity()),
        0,
    );

    // Behind the camera: outside the frustum, never observed.
    let data = map.get_data_safe(&Point3::new(0.7, 0.7, 0.02));
    let data = data.expect("inside the map");
    assert!(!data.observed, "space outside the frustum stays unobserved");
    assert_eq!(data.weight, 0.0);
}
