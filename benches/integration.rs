//! Integration and raycasting benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};

use ghana_map::core::DepthImage;
use ghana_map::raycaster::raycast_volume_tsdf;
use ghana_map::sensor::{PinholeCamera, PinholeCameraConfig};
use ghana_map::{
    IntegratorConfig, MapConfig, MapIntegrator, Measurements, OccupancyConfig, OccupancyMap,
    Scheduling, TsdfConfig, TsdfMap,
};
use nalgebra::Isometry3;

fn camera() -> PinholeCamera {
    PinholeCamera::new(PinholeCameraConfig {
        width: 160,
        height: 120,
        fx: 120.0,
        fy: 120.0,
        cx: 79.5,
        cy: 59.5,
        near_plane: 0.4,
        far_plane: 6.0,
    })
}

fn map_config() -> MapConfig {
    MapConfig {
        resolution: 0.02,
        size: 256,
        origin: [-2.56, -2.56, 0.0],
    }
}

fn bench_tsdf_integration(c: &mut Criterion) {
    let camera = camera();
    let depth = DepthImage::new(160, 120, 2.0);
    let integrator = MapIntegrator::new(IntegratorConfig {
        scheduling: Scheduling::WorkStealing,
    });

    c.bench_function("tsdf_integrate_frame", |b| {
        b.iter_batched(
            || TsdfMap::new(&map_config(), TsdfConfig::default()).unwrap(),
            |mut map| {
                integrator.integrate_depth_tsdf(
                    &mut map,
                    &Measurements::depth_only(&camera, &depth, Isometry3::identity()),
                    0,
                );
                map
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

fn bench_occupancy_integration(c: &mut Criterion) {
    let camera = camera();
    let depth = DepthImage::new(160, 120, 2.0);
    let integrator = MapIntegrator::new(IntegratorConfig {
        scheduling: Scheduling::WorkStealing,
    });

    c.bench_function("occupancy_integrate_frame", |b| {
        b.iter_batched(
            || OccupancyMap::new(&map_config(), OccupancyConfig::default()).unwrap(),
            |mut map| {
                integrator.integrate_depth_occupancy(
                    &mut map,
                    &Measurements::depth_only(&camera, &depth, Isometry3::identity()),
                    0,
                );
                map
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

fn bench_tsdf_raycast(c: &mut Criterion) {
    let camera = camera();
    let depth = DepthImage::new(160, 120, 2.0);
    let integrator = MapIntegrator::new(IntegratorConfig {
        scheduling: Scheduling::WorkStealing,
    });
    let mut map = TsdfMap::new(&map_config(), TsdfConfig::default()).unwrap();
    for frame in 0..5 {
        integrator.integrate_depth_tsdf(
            &mut map,
            &Measurements::depth_only(&camera, &depth, Isometry3::identity()),
            frame,
        );
    }

    c.bench_function("tsdf_raycast_volume", |b| {
        b.iter(|| {
            raycast_volume_tsdf(
                &map,
                &camera,
                &Isometry3::identity(),
                Scheduling::WorkStealing,
            )
        })
    });
}

criterion_group!(
    benches,
    bench_tsdf_integration,
    bench_occupancy_integration,
    bench_tsdf_raycast
);
criterion_main!(benches);
