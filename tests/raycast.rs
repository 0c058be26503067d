//! Raycasting tests against hand-built maps.

use ghana_map::core::voxel::{VoxelCoord, BLOCK_SIZE};
use ghana_map::core::DepthImage;
use ghana_map::octree::propagator::{
    propagate_block_up_occupancy, propagate_to_root_occupancy,
};
use ghana_map::raycaster::{raycast_volume_occupancy, raycast_volume_tsdf};
use ghana_map::sensor::{PinholeCamera, PinholeCameraConfig};
use ghana_map::{
    IntegratorConfig, MapConfig, MapIntegrator, Measurements, OccupancyConfig, OccupancyMap,
    Scheduling, TsdfConfig, TsdfMap, TsdfResolution,
};
use nalgebra::Isometry3;

const RESOLUTION: f32 = 0.05;
const SLAB_DEPTH: f32 = 1.0;

fn camera() -> PinholeCamera {
    PinholeCamera::new(PinholeCameraConfig {
        width: 16,
        height: 16,
        fx: 16.0,
        fy: 16.0,
        cx: 7.5,
        cy: 7.5,
        near_plane: 0.1,
        far_plane: 6.0,
    })
}

fn map_config() -> MapConfig {
    MapConfig {
        resolution: RESOLUTION,
        size: 32,
        origin: [-0.8, -0.8, 0.0],
    }
}

/// Build an occupancy map by hand: observed free space in front of an
/// occupied slab at z = 1.0m, unobserved behind it.
fn slab_occupancy_map() -> OccupancyMap {
    let mut map = OccupancyMap::new(&map_config(), OccupancyConfig::default()).unwrap();
    let log_odd_min = map.config().log_odd_min;
    let log_odd_max = map.config().log_odd_max;
    let max_weight = map.config().max_weight;
    let slab_voxel = (SLAB_DEPTH / RESOLUTION) as i32; // plane at a voxel boundary

    let mut blocks = Vec::new();
    for bz in 0..4 {
        for by in 0..4 {
            for bx in 0..4 {
                let coord = VoxelCoord::new(bx * BLOCK_SIZE, by * BLOCK_SIZE, bz * BLOCK_SIZE);
                let idx = map.octree_mut().allocate_block_at(coord).unwrap();
                let block = map.octree_mut().block_mut(idx);
                block.allocate_down_to(0);
                for z in 0..BLOCK_SIZE {
                    let voxel_z = coord.z + z;
                    // Leave everything behind the slab unobserved.
                    let sample = if voxel_z < slab_voxel {
                        log_odd_min
                    } else if voxel_z < slab_voxel + 2 {
                        log_odd_max
                    } else {
                        continue;
                    };
                    for y in 0..BLOCK_SIZE {
                        for x in 0..BLOCK_SIZE {
                            let voxel = coord + VoxelCoord::new(x, y, z);
                            let i = block.voxel_idx(voxel, 0);
                            block.mean_slice_mut(0)[i].integrate(sample, max_weight);
                        }
                    }
                }
                propagate_block_up_occupancy(block);
                blocks.push(idx);
            }
        }
    }
    let min_occupancy = map.config().min_occupancy();
    propagate_to_root_occupancy(map.octree_mut(), &blocks, &[], 0, min_occupancy);
    map
}

#[test]
fn test_occupancy_raycast_hits_slab_per_pixel() {
    let map = slab_occupancy_map();
    let camera = camera();
    let hits = raycast_volume_occupancy(
        &map,
        &camera,
        &Isometry3::identity(),
        Scheduling::Serial,
    );

    let mut hit_count = 0;
    for y in 0..16 {
        for x in 0..16 {
            let Some(hit) = hits.pixel(x, y) else {
                continue;
            };
            assert!(
                (hit.point_w.z - SLAB_DEPTH).abs() <= 0.5 * RESOLUTION + 1e-3,
                "pixel ({x},{y}): hit at z={} instead of {SLAB_DEPTH}",
                hit.point_w.z
            );
            hit_count += 1;
        }
    }
    assert!(
        hit_count > 200,
        "nearly every pixel faces the slab, got {hit_count} hits"
    );
}

#[test]
fn test_occupancy_raycast_normals_face_the_sensor() {
    let map = slab_occupancy_map();
    let camera = camera();
    let hits = raycast_volume_occupancy(
        &map,
        &camera,
        &Isometry3::identity(),
        Scheduling::Serial,
    );
    let hit = hits.pixel(7, 7).as_ref().expect("centre pixel hits");
    let normal = hit.normal_w.expect("gradient defined at the slab face");
    assert!(
        normal.z < -0.9,
        "slab normal points back toward the sensor, got {normal:?}"
    );
}

/// Integrate a plane into a TSDF map and raycast it back.
#[test]
fn test_tsdf_raycast_recovers_integrated_plane() {
    let mut map = TsdfMap::new(
        &map_config(),
        TsdfConfig {
            truncation_boundary_factor: 4.0,
            max_weight: 100.0,
            resolution: TsdfResolution::Single,
        },
    )
    .unwrap();
    let camera = camera();
    let image = DepthImage::new(16, 16, SLAB_DEPTH);
    let integrator = MapIntegrator::new(IntegratorConfig {
        scheduling: Scheduling::Serial,
    });
    for frame in 0..3 {
        integrator.integrate_depth_tsdf(
            &mut map,
            &Measurements::depth_only(&camera, &image, Isometry3::identity()),
            frame,
        );
    }

    let hits = raycast_volume_tsdf(&map, &camera, &Isometry3::identity(), Scheduling::Serial);
    let mut hit_count = 0;
    for y in 2..14 {
        for x in 2..14 {
            let Some(hit) = hits.pixel(x, y) else {
                continue;
            };
            assert!(
                (hit.point_w.z - SLAB_DEPTH).abs() <= RESOLUTION,
                "pixel ({x},{y}): surface at z={}",
                hit.point_w.z
            );
            // Soundness: the field at the returned point is on the
            // surface boundary.
            if let Some(value) = map.get_field_interp(&hit.point_w) {
                assert!(
                    value.abs() <= 0.1,
                    "interpolated field {value} off the zero crossing"
                );
            }
            hit_count += 1;
        }
    }
    assert!(hit_count > 100, "interior pixels hit the plane, got {hit_count}");
}
