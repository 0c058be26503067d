//! Surface queries by ray casting.
//!
//! The TSDF caster advances in block-sized steps until it finds valid
//! data, then steps proportionally to the field value and refines the
//! zero crossing by interpolation. The occupancy caster first clips the
//! ray against the map bounds, then skips free space hierarchically
//! using the node max aggregates before walking voxel-sized steps
//! through potentially occupied space. [`raycast_volume_tsdf`] and
//! [`raycast_volume_occupancy`] cast one ray per pixel of a sensor and
//! return the surface point, normal, scale and optional payloads.

use nalgebra::{Isometry3, Point3, Vector2, Vector3};

use crate::config::Scheduling;
use crate::core::voxel::{VoxelCoord, BLOCK_SIZE};
use crate::core::{Image, VoxelData};
use crate::map::{OccupancyMap, TsdfMap};
use crate::octree::visitor;
use crate::sensor::SensorModel;

/// Occupancy log-odds below which space is considered safely free while
/// advancing through the hierarchy.
const FREE_SKIP_THRESHOLD: f32 = -0.2;

/// The result of one surface ray.
#[derive(Debug, Clone)]
pub struct SurfaceHit {
    /// Surface point in world coordinates.
    pub point_w: Point3<f32>,
    /// Unit surface normal, when the field gradient is defined.
    pub normal_w: Option<Vector3<f32>>,
    /// Scale the surface was interpolated at.
    pub scale: i32,
    #[cfg(feature = "colour")]
    pub colour: Option<crate::core::ColourData>,
    #[cfg(feature = "id")]
    pub id: u16,
}

/// Distance along the ray at which it enters the map cube.
///
/// Returns 0 when the origin is inside, `None` when the ray misses the
/// map entirely or first touches it beyond `t_far`.
fn map_entry_distance<B, C>(
    map: &crate::map::VoxelMap<B, C>,
    origin_w: &Point3<f32>,
    dir_w: &Vector3<f32>,
    t_far: f32,
) -> Option<f32>
where
    B: crate::octree::VoxelBlock,
{
    let lo = map.origin();
    let dim = map.dim();
    let mut inside = true;
    let mut candidate = [0.0f32; 3];
    let mut quadrant = [2u8; 3]; // 2 = inside the slab
    for axis in 0..3 {
        let o = origin_w[axis];
        if o < lo[axis] {
            quadrant[axis] = 1;
            candidate[axis] = lo[axis];
            inside = false;
        } else if o > lo[axis] + dim {
            quadrant[axis] = 0;
            candidate[axis] = lo[axis] + dim;
            inside = false;
        }
    }
    if inside {
        return Some(0.0);
    }
    // Woo's slab selection: the entry plane is the one crossed last.
    let mut max_t = [-1.0f32; 3];
    for axis in 0..3 {
        if quadrant[axis] != 2 && dir_w[axis] != 0.0 {
            max_t[axis] = (candidate[axis] - origin_w[axis]) / dir_w[axis];
        }
    }
    let mut plane = 0;
    for axis in 1..3 {
        if max_t[axis] > max_t[plane] {
            plane = axis;
        }
    }
    if max_t[plane] < 0.0 {
        return None;
    }
    let mut hit = [0.0f32; 3];
    for axis in 0..3 {
        if axis != plane {
            hit[axis] = origin_w[axis] + max_t[plane] * dir_w[axis];
            if hit[axis] < lo[axis] || hit[axis] > lo[axis] + dim {
                return None;
            }
        } else {
            hit[axis] = candidate[axis];
        }
    }
    let t = (Vector3::new(hit[0], hit[1], hit[2])
        - Vector3::new(origin_w.x, origin_w.y, origin_w.z))
    .norm();
    (t <= t_far).then_some(t)
}

/// Advance through free space using the hierarchical max aggregates.
///
/// On success `t` is just before the first potentially occupied region;
/// `t_far` is clipped to the map exit.
fn advance_ray(
    map: &OccupancyMap,
    origin_w: &Point3<f32>,
    dir_w: &Vector3<f32>,
    t: &mut f32,
    t_far: &mut f32,
    max_scale: i32,
) -> bool {
    let voxel_dim = map.resolution();
    let octree = map.octree();
    let size = octree.size() as f32;
    let origin_f = map.point_to_voxel_f(origin_w);

    let v = *t / voxel_dim;
    let mut v_far = *t_far / voxel_dim;
    // Distance in voxels until the ray leaves the map, per axis.
    let mut v_map = f32::INFINITY;
    for axis in 0..3 {
        if dir_w[axis].abs() > 1e-9 {
            let delta = size / dir_w[axis].abs();
            let frac = origin_f[axis] / size;
            let exit = if dir_w[axis] < 0.0 {
                frac * delta
            } else {
                (1.0 - frac) * delta
            };
            v_map = v_map.min(exit);
        }
    }
    v_far = v_far.min(v_map + v);
    *t_far = v_far * voxel_dim;

    let probe = |pos_f: Point3<f32>, scale: i32| -> f32 {
        visitor::get_max_data(octree, VoxelCoord::from_point_floor(&pos_f), scale).field()
    };

    let mut scale = max_scale;
    let mut v_add = 0.0f32;
    let mut pos_f = origin_f + dir_w * v;
    while probe(pos_f, scale) > FREE_SKIP_THRESHOLD && scale > 2 {
        scale -= 1;
    }

    while v + v_add < v_far {
        if scale <= 2 {
            // Back off a few voxels so the fine walk re-enters cleanly.
            *t = voxel_dim * (v + v_add - 4.0);
            return true;
        }
        let node_size = (1 << scale) as f32;
        let node = Point3::new(
            (pos_f.x / node_size).floor() * node_size,
            (pos_f.y / node_size).floor() * node_size,
            (pos_f.z / node_size).floor() * node_size,
        );
        // Distance in voxels to the next same-scale boundary.
        let mut v_min = f32::INFINITY;
        for axis in 0..3 {
            if dir_w[axis].abs() > 1e-6 {
                let frac = (pos_f[axis] - node[axis]) / node_size;
                let delta = node_size / dir_w[axis].abs();
                let exit = if dir_w[axis] < 0.0 {
                    frac * delta
                } else {
                    (1.0 - frac) * delta
                };
                v_min = v_min.min(exit);
            }
        }
        v_add += v_min + 0.01;
        pos_f = origin_f + dir_w * (v + v_add);

        let field = probe(pos_f, scale);
        if field > FREE_SKIP_THRESHOLD {
            while probe(pos_f, scale) > FREE_SKIP_THRESHOLD && scale > 2 {
                scale -= 1;
            }
        } else {
            // Re-coarsen while the coarser aggregate stays free.
            for s in (scale + 1)..=max_scale {
                if probe(pos_f, s) > FREE_SKIP_THRESHOLD {
                    break;
                }
                scale = s;
            }
        }
    }
    false
}

/// March until the interpolated field becomes available, starting at
/// `t`. Returns the field value and the point it was sampled at.
fn find_valid_point(
    map: &OccupancyMap,
    origin_w: &Point3<f32>,
    dir_w: &Vector3<f32>,
    step: f32,
    t_far: f32,
    t: &mut f32,
) -> Option<(f32, Point3<f32>)> {
    loop {
        let point_w = origin_w + dir_w * *t;
        if map.contains(&point_w) {
            if let Some(data) = map.get_data_safe(&point_w) {
                if data.is_valid() {
                    if let Some(value) = map.get_field_interp(&point_w) {
                        return Some((value, point_w));
                    }
                }
            }
        }
        *t += step;
        if *t > t_far {
            return None;
        }
    }
}

/// Cast one ray into an occupancy map.
///
/// Returns the first crossing where the interpolated field passes
/// through the surface boundary, with the interpolation scale.
pub fn raycast_occupancy(
    map: &OccupancyMap,
    origin_w: &Point3<f32>,
    dir_w: &Vector3<f32>,
    _t_near: f32,
    mut t_far: f32,
) -> Option<(Point3<f32>, i32)> {
    let surface_boundary = map.config().surface_boundary;
    let mut t = map_entry_distance(map, origin_w, dir_w, t_far)?;

    let max_scale = (map.octree().max_scale() - 1).min(7);
    if !advance_ray(map, origin_w, dir_w, &mut t, &mut t_far, max_scale) {
        // The ray passes only through free space.
        return None;
    }
    t = t.max(0.0);

    let step = 0.5 * map.resolution();
    let (mut value_t, mut point_t) = find_valid_point(map, origin_w, dir_w, step, t_far, &mut t)?;
    t += step;
    if value_t > surface_boundary {
        return None;
    }

    let mut value_tt = value_t;
    let mut point_tt = point_t;
    let mut scale_tt = 0;
    let mut crossed = false;
    while t < t_far {
        let ray_pos_w = origin_w + dir_w * t;
        let data = map.get_data_safe(&ray_pos_w).filter(|d| d.is_valid());
        let Some(data) = data else {
            t += step;
            let (v, p) = find_valid_point(map, origin_w, dir_w, step, t_far, &mut t)?;
            value_t = v;
            point_t = p;
            if value_t > surface_boundary {
                break;
            }
            t += step;
            continue;
        };
        value_tt = data.field();
        point_tt = ray_pos_w;
        if value_tt > FREE_SKIP_THRESHOLD {
            match map.get_field_interp_at(&ray_pos_w, 0) {
                Some((v, s)) => {
                    value_tt = v;
                    scale_tt = s;
                }
                None => {
                    t += step;
                    let (v, p) = find_valid_point(map, origin_w, dir_w, step, t_far, &mut t)?;
                    value_t = v;
                    point_t = p;
                    if value_t > surface_boundary {
                        break;
                    }
                    t += step;
                    continue;
                }
            }
        }
        if value_tt > surface_boundary {
            crossed = true;
            break;
        }
        value_t = value_tt;
        point_t = point_tt;
        t += step;
    }

    if crossed && value_t < surface_boundary {
        // Interpolate the crossing between the last two samples.
        let t_hit = t
            - (point_tt - point_t).norm() * (value_tt - surface_boundary)
                / (value_tt - value_t);
        return Some((origin_w + dir_w * t_hit, scale_tt));
    }
    None
}

/// Distance along the ray at which it enters the first allocated block.
fn first_allocated_block(
    map: &TsdfMap,
    origin_w: &Point3<f32>,
    dir_w: &Vector3<f32>,
    t_near: f32,
    t_far: f32,
) -> Option<f32> {
    let resolution = map.resolution();
    let origin_f = map.point_to_voxel_f(origin_w);
    let cell_dim = BLOCK_SIZE as f32;
    let s_near = t_near / resolution;
    let s_far = t_far / resolution;
    let start = origin_f + dir_w * s_near;

    let mut cell = [
        (start.x / cell_dim).floor() as i32,
        (start.y / cell_dim).floor() as i32,
        (start.z / cell_dim).floor() as i32,
    ];
    let mut step = [0i32; 3];
    let mut s_max = [f32::INFINITY; 3];
    let mut s_delta = [f32::INFINITY; 3];
    for axis in 0..3 {
        if dir_w[axis].abs() > 1e-9 {
            step[axis] = if dir_w[axis] > 0.0 { 1 } else { -1 };
            s_delta[axis] = cell_dim / dir_w[axis].abs();
            let boundary = if dir_w[axis] > 0.0 {
                (cell[axis] + 1) as f32 * cell_dim
            } else {
                cell[axis] as f32 * cell_dim
            };
            s_max[axis] = (boundary - start[axis]) / dir_w[axis];
        }
    }

    let mut s_entry = s_near;
    loop {
        let corner = VoxelCoord::new(
            cell[0] * BLOCK_SIZE,
            cell[1] * BLOCK_SIZE,
            cell[2] * BLOCK_SIZE,
        );
        if map.octree().fetch_block(corner).is_some() {
            return Some((s_entry * resolution).max(t_near));
        }
        let axis = if s_max[0] < s_max[1] {
            if s_max[0] < s_max[2] {
                0
            } else {
                2
            }
        } else if s_max[1] < s_max[2] {
            1
        } else {
            2
        };
        s_entry = s_near + s_max[axis];
        if s_entry > s_far {
            return None;
        }
        s_max[axis] += s_delta[axis];
        cell[axis] += step[axis];
    }
}

/// Cast one ray into a TSDF map.
///
/// Returns the zero crossing and the scale it was interpolated at.
pub fn raycast_tsdf(
    map: &TsdfMap,
    origin_w: &Point3<f32>,
    dir_w: &Vector3<f32>,
    t_near: f32,
    t_far: f32,
) -> Option<(Point3<f32>, i32)> {
    let surface_boundary = 0.0f32;
    let step = map.resolution();
    let large_step = BLOCK_SIZE as f32 * step;
    let truncation = map.config().truncation_boundary(map.resolution());

    let t_min = first_allocated_block(map, origin_w, dir_w, t_near, t_far)?;
    if t_min <= 0.0 {
        return None;
    }

    let mut t = t_min;
    let mut stepsize = large_step;
    let mut point_w = origin_w + dir_w * t;
    let mut f_t = map
        .get_data_safe(&point_w)
        .map(|d| d.field())
        .unwrap_or(1.0);
    let mut f_tt = 0.0f32;
    let mut scale_tt = 0;
    if f_t < surface_boundary {
        // Started inside the surface.
        return None;
    }
    let mut crossed = false;
    while t < t_far {
        let Some(data) = map.get_data_safe(&point_w).filter(|d| d.is_valid()) else {
            stepsize = large_step;
            point_w += dir_w * stepsize;
            t += stepsize;
            continue;
        };
        f_tt = data.field();
        if (-0.5..=0.1).contains(&f_tt) {
            // Near the zero crossing: refine by interpolation.
            if let Some((v, s)) = map.get_field_interp_at(&point_w, 0) {
                f_tt = v;
                scale_tt = s;
            }
        }
        if f_tt < surface_boundary {
            crossed = true;
            break;
        }
        stepsize = (f_tt * truncation).max(step);
        point_w += dir_w * stepsize;
        t += stepsize;
        f_t = f_tt;
    }
    if crossed {
        let t_hit = t - stepsize * (f_tt - surface_boundary) / (f_tt - f_t);
        return Some((origin_w + dir_w * t_hit, scale_tt));
    }
    None
}

/// Cast one ray per pixel into a TSDF map.
pub fn raycast_volume_tsdf<S: SensorModel>(
    map: &TsdfMap,
    sensor: &S,
    t_ws: &Isometry3<f32>,
    scheduling: Scheduling,
) -> Image<Option<SurfaceHit>> {
    raycast_volume(map, sensor, t_ws, scheduling, true, raycast_tsdf)
}

/// Cast one ray per pixel into an occupancy map.
pub fn raycast_volume_occupancy<S: SensorModel>(
    map: &OccupancyMap,
    sensor: &S,
    t_ws: &Isometry3<f32>,
    scheduling: Scheduling,
) -> Image<Option<SurfaceHit>> {
    raycast_volume(map, sensor, t_ws, scheduling, false, raycast_occupancy)
}

fn raycast_volume<B, C, S, F>(
    map: &crate::map::VoxelMap<B, C>,
    sensor: &S,
    t_ws: &Isometry3<f32>,
    scheduling: Scheduling,
    normals_along_gradient: bool,
    cast: F,
) -> Image<Option<SurfaceHit>>
where
    B: crate::octree::VoxelBlock,
    C: Sync,
    S: SensorModel,
    F: Fn(
            &crate::map::VoxelMap<B, C>,
            &Point3<f32>,
            &Vector3<f32>,
            f32,
            f32,
        ) -> Option<(Point3<f32>, i32)>
        + Send
        + Sync,
{
    let width = sensor.width();
    let height = sensor.height();
    let origin_w = Point3::from(t_ws.translation.vector);

    let pixels = crate::integrator::map_pixels(scheduling, width * height, |idx| {
        let x = (idx % width) as f32;
        let y = (idx / width) as f32;
        let dir_s = sensor.back_project(&Vector2::new(x, y)).normalize();
        let dir_w = t_ws * dir_s;
        let (point_w, scale) = cast(
            map,
            &origin_w,
            &dir_w,
            sensor.near_dist(&dir_s),
            sensor.far_dist(&dir_s),
        )?;
        let normal_w = map.get_field_grad(&point_w).and_then(|g| {
            let n = if normals_along_gradient { g } else { -g };
            let norm = n.norm();
            (norm > 0.0).then(|| n / norm)
        });
        Some(SurfaceHit {
            point_w,
            normal_w,
            scale,
            #[cfg(feature = "colour")]
            colour: map.get_colour_interp(&point_w),
            #[cfg(feature = "id")]
            id: map
                .get_data_safe(&point_w)
                .map(|d| lookup_id(&d))
                .unwrap_or(crate::core::NOT_MAPPED),
        })
    });
    Image::from_vec(width, height, pixels)
}

#[cfg(feature = "id")]
fn lookup_id<D: VoxelData>(data: &D) -> u16 {
    if data.is_valid() {
        data.id().0
    } else {
        crate::core::NOT_MAPPED
    }
}
