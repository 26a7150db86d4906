//! Local bundle adjustment over a covisibility neighborhood.
//!
//! Three phases so the map lock is never held while solving:
//!
//! 1. **collect** — under the read lock, snapshot the optimized keyframes
//!    (current ∪ its covisibles), the fixed keyframes (outer observers of
//!    the local points), the points, and all observation edges.
//! 2. **solve** — no lock: damped Gauss-Newton over poses and points with
//!    Huber weights. The shared abort flag is polled at every iteration
//!    boundary; on abort the best solution so far is returned.
//! 3. **apply** — under the write lock, write back poses/points and drop the
//!    observations that ended as χ² outliers.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, RowVector3, Vector2, Vector3};
use tracing::debug;

use crate::camera::PinholeCamera;
use crate::geometry::{skew, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};

const CHI2_MONO: f64 = 5.991;
const CHI2_STEREO: f64 = 7.815;

pub struct LocalBaConfig {
    pub max_iterations: usize,
    /// Optimizing fewer keyframes than this makes no sense (the anchor set
    /// would dominate); the driver bails out instead.
    pub min_optimized_keyframes: usize,
}

impl Default for LocalBaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_optimized_keyframes: 1,
        }
    }
}

#[derive(Clone, Copy)]
enum KfRef {
    Optimized(usize),
    Fixed(usize),
}

struct BaObservation {
    kf: KfRef,
    point_idx: usize,
    uv: Vector2<f64>,
    u_right: Option<f64>,
    inv_sigma2: f64,
    /// Original ids for the outlier report.
    kf_id: KeyFrameId,
    mp_id: MapPointId,
}

/// Snapshot of the optimization neighborhood, detached from the map.
pub struct LocalBaProblem {
    optimized: Vec<(KeyFrameId, SE3)>,
    fixed: Vec<(KeyFrameId, SE3)>,
    points: Vec<(MapPointId, Vector3<f64>)>,
    observations: Vec<BaObservation>,
}

pub struct LocalBaResult {
    pub poses: Vec<(KeyFrameId, SE3)>,
    pub points: Vec<(MapPointId, Vector3<f64>)>,
    /// Observations whose reprojection ended above the χ² bound.
    pub outliers: Vec<(KeyFrameId, MapPointId)>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Phase 1: snapshot the neighborhood of `kf_id`.
pub fn collect_local_ba(map: &Map, kf_id: KeyFrameId, config: &LocalBaConfig) -> Option<LocalBaProblem> {
    let center = map.keyframe(kf_id)?;
    if center.bad {
        return None;
    }

    // Optimized set: the current keyframe plus every covisible one. The
    // origin keyframe is pinned by moving it to the fixed set.
    let mut optimized_ids: Vec<KeyFrameId> = vec![kf_id];
    for id in center.covisibility_weights().keys() {
        if map.keyframe(*id).map_or(false, |kf| !kf.bad) {
            optimized_ids.push(*id);
        }
    }
    optimized_ids.sort();
    optimized_ids.dedup();

    let mut fixed_ids: Vec<KeyFrameId> = Vec::new();
    if let Some(origin) = map.origin() {
        if let Some(pos) = optimized_ids.iter().position(|&id| id == origin) {
            optimized_ids.remove(pos);
            fixed_ids.push(origin);
        }
    }
    if optimized_ids.len() < config.min_optimized_keyframes {
        return None;
    }

    // Local points: everything the optimized keyframes observe.
    let mut point_ids: Vec<MapPointId> = Vec::new();
    for &id in &optimized_ids {
        let kf = map.keyframe(id)?;
        for (_, raw) in kf.map_point_slots() {
            if let Some(mp_id) = map.resolve(raw) {
                point_ids.push(mp_id);
            }
        }
    }
    point_ids.sort();
    point_ids.dedup();
    if point_ids.is_empty() {
        return None;
    }

    // Fixed set: outer observers of local points.
    for &mp_id in &point_ids {
        let mp = map.map_point(mp_id)?;
        for &obs_kf in mp.observations.keys() {
            if !optimized_ids.contains(&obs_kf)
                && !fixed_ids.contains(&obs_kf)
                && map.keyframe(obs_kf).map_or(false, |kf| !kf.bad)
            {
                fixed_ids.push(obs_kf);
            }
        }
    }

    let optimized: Vec<(KeyFrameId, SE3)> = optimized_ids
        .iter()
        .map(|&id| (id, map.keyframe(id).unwrap().pose_cw().clone()))
        .collect();
    let fixed: Vec<(KeyFrameId, SE3)> = fixed_ids
        .iter()
        .map(|&id| (id, map.keyframe(id).unwrap().pose_cw().clone()))
        .collect();
    let points: Vec<(MapPointId, Vector3<f64>)> = point_ids
        .iter()
        .map(|&id| (id, map.map_point(id).unwrap().position))
        .collect();

    let kf_index: HashMap<KeyFrameId, KfRef> = optimized
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, KfRef::Optimized(i)))
        .chain(
            fixed
                .iter()
                .enumerate()
                .map(|(i, (id, _))| (*id, KfRef::Fixed(i))),
        )
        .collect();
    let point_index: HashMap<MapPointId, usize> = point_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    let pyramid = map.pyramid();
    let mut observations = Vec::new();
    for (&mp_id, &point_idx) in &point_index {
        let mp = map.map_point(mp_id)?;
        for (&obs_kf, &slot) in &mp.observations {
            let Some(&kf_ref) = kf_index.get(&obs_kf) else {
                continue;
            };
            let Some(kf) = map.keyframe(obs_kf) else {
                continue;
            };
            if kf.bad {
                continue;
            }
            let Some(kp) = kf.keypoints.get(slot) else {
                continue;
            };
            observations.push(BaObservation {
                kf: kf_ref,
                point_idx,
                uv: Vector2::new(kp.x, kp.y),
                u_right: kf.u_right.get(slot).copied().flatten(),
                inv_sigma2: pyramid.inv_sigma2(kp.octave),
                kf_id: obs_kf,
                mp_id,
            });
        }
    }
    if observations.is_empty() {
        return None;
    }

    Some(LocalBaProblem {
        optimized,
        fixed,
        points,
        observations,
    })
}

/// Phase 2: solve. `should_abort` is polled at iteration boundaries.
pub fn solve_local_ba(
    problem: &LocalBaProblem,
    camera: &PinholeCamera,
    config: &LocalBaConfig,
    should_abort: &dyn Fn() -> bool,
) -> Option<LocalBaResult> {
    let n_kf = problem.optimized.len();
    let n_pt = problem.points.len();
    let n_params = n_kf * 6 + n_pt * 3;

    let mut poses: Vec<SE3> = problem.optimized.iter().map(|(_, p)| p.clone()).collect();
    let mut points: Vec<Vector3<f64>> = problem.points.iter().map(|(_, p)| *p).collect();

    let initial_error = total_error(problem, camera, &poses, &points);
    let mut current_error = initial_error;
    let mut lambda = 1e-3;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        if should_abort() {
            break;
        }
        iterations += 1;

        let (h, b) = build_normal_equations(problem, camera, &poses, &points, n_params);

        let mut damped = h;
        for d in 0..n_params {
            let diag = damped[(d, d)].max(1e-9);
            damped[(d, d)] = diag + lambda * diag;
        }
        let Some(delta) = damped.lu().solve(&(-&b)) else {
            break;
        };
        if delta.norm() < 1e-10 {
            break;
        }

        let (trial_poses, trial_points) = apply_delta(&poses, &points, &delta, n_kf);
        let trial_error = total_error(problem, camera, &trial_poses, &trial_points);

        if trial_error < current_error {
            poses = trial_poses;
            points = trial_points;
            current_error = trial_error;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e8);
        }
    }

    // Final outlier sweep at the converged state.
    let mut outliers = Vec::new();
    for obs in &problem.observations {
        let pose = pose_of(problem, &poses, obs.kf);
        let chi2 = chi2_of(camera, pose, &points[obs.point_idx], obs);
        let bound = if obs.u_right.is_some() {
            CHI2_STEREO
        } else {
            CHI2_MONO
        };
        if chi2 > bound {
            outliers.push((obs.kf_id, obs.mp_id));
        }
    }

    debug!(
        keyframes = n_kf,
        points = n_pt,
        iterations,
        initial_error,
        final_error = current_error,
        outliers = outliers.len(),
        "local bundle adjustment"
    );

    Some(LocalBaResult {
        poses: problem
            .optimized
            .iter()
            .zip(poses)
            .map(|((id, _), pose)| (*id, pose))
            .collect(),
        points: problem
            .points
            .iter()
            .zip(points)
            .map(|((id, _), p)| (*id, p))
            .collect(),
        outliers,
        iterations,
        initial_error,
        final_error: current_error,
    })
}

/// Phase 3: write back under the caller-held write lock.
pub fn apply_local_ba(map: &mut Map, result: &LocalBaResult) {
    for (kf_id, pose) in &result.poses {
        if let Some(kf) = map.keyframe_mut(*kf_id) {
            if !kf.bad {
                kf.set_pose_cw(pose.clone());
            }
        }
    }
    for (mp_id, position) in &result.points {
        if let Some(mp) = map.map_point_mut(*mp_id) {
            if !mp.bad {
                mp.position = *position;
            }
        }
    }
    for (kf_id, mp_id) in &result.outliers {
        map.erase_observation(*kf_id, *mp_id);
    }
    for (mp_id, _) in &result.points {
        if map.map_point(*mp_id).map_or(false, |mp| !mp.bad) {
            map.update_normal_and_depth(*mp_id);
        }
    }
}

fn pose_of<'a>(problem: &'a LocalBaProblem, poses: &'a [SE3], kf: KfRef) -> &'a SE3 {
    match kf {
        KfRef::Optimized(i) => &poses[i],
        KfRef::Fixed(i) => &problem.fixed[i].1,
    }
}

fn apply_delta(
    poses: &[SE3],
    points: &[Vector3<f64>],
    delta: &DVector<f64>,
    n_kf: usize,
) -> (Vec<SE3>, Vec<Vector3<f64>>) {
    let new_poses = poses
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            let base = i * 6;
            let inc = SE3::from_params(
                &Vector3::new(delta[base], delta[base + 1], delta[base + 2]),
                &Vector3::new(delta[base + 3], delta[base + 4], delta[base + 5]),
            );
            inc.compose(pose)
        })
        .collect();
    let new_points = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let base = n_kf * 6 + i * 3;
            p + Vector3::new(delta[base], delta[base + 1], delta[base + 2])
        })
        .collect();
    (new_poses, new_points)
}

/// Accumulate JᵀJ and Jᵀr over all observations. Dense normal equations:
/// neighborhood sizes keep this tractable.
fn build_normal_equations(
    problem: &LocalBaProblem,
    camera: &PinholeCamera,
    poses: &[SE3],
    points: &[Vector3<f64>],
    n_params: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let n_kf = poses.len();
    let mut h = DMatrix::<f64>::zeros(n_params, n_params);
    let mut b = DVector::<f64>::zeros(n_params);

    for obs in &problem.observations {
        let pose = pose_of(problem, poses, obs.kf);
        let p = &points[obs.point_idx];
        let Some(rows) = linearize(camera, pose, p, obs) else {
            continue;
        };

        let pose_base = match obs.kf {
            KfRef::Optimized(i) => Some(i * 6),
            KfRef::Fixed(_) => None,
        };
        let point_base = n_kf * 6 + obs.point_idx * 3;

        for (e, j_pose, j_point) in &rows {
            // Pose block.
            if let Some(pb) = pose_base {
                for r in 0..6 {
                    b[pb + r] += j_pose[r] * e;
                    for c in 0..6 {
                        h[(pb + r, pb + c)] += j_pose[r] * j_pose[c];
                    }
                    for c in 0..3 {
                        h[(pb + r, point_base + c)] += j_pose[r] * j_point[c];
                        h[(point_base + c, pb + r)] += j_pose[r] * j_point[c];
                    }
                }
            }
            // Point block.
            for r in 0..3 {
                b[point_base + r] += j_point[r] * e;
                for c in 0..3 {
                    h[(point_base + r, point_base + c)] += j_point[r] * j_point[c];
                }
            }
        }
    }

    (h, b)
}

type ResidualRow = (f64, [f64; 6], [f64; 3]);

/// Rows (residual, ∂/∂pose-increment, ∂/∂point) of one observation,
/// information- and Huber-weighted. Convention: e = observed − projected,
/// pose increment applied on the left.
fn linearize(
    camera: &PinholeCamera,
    pose: &SE3,
    point: &Vector3<f64>,
    obs: &BaObservation,
) -> Option<Vec<ResidualRow>> {
    let q = pose.transform_point(point);
    if q.z <= 1e-6 {
        return None;
    }
    let invz = 1.0 / q.z;
    let invz2 = invz * invz;
    let u = camera.fx * q.x * invz + camera.cx;
    let v = camera.fy * q.y * invz + camera.cy;
    let r_cw: Matrix3<f64> = pose.rotation_matrix();
    let sq = skew(&q);

    let a = Matrix2x3::new(
        camera.fx * invz,
        0.0,
        -camera.fx * q.x * invz2,
        0.0,
        camera.fy * invz,
        -camera.fy * q.y * invz2,
    );
    let j_rot = a * sq;
    let j_point_block = -a * r_cw;

    let mut rows: Vec<ResidualRow> = Vec::with_capacity(3);
    for r in 0..2 {
        let e = if r == 0 { obs.uv.x - u } else { obs.uv.y - v };
        let j_pose = [
            j_rot[(r, 0)],
            j_rot[(r, 1)],
            j_rot[(r, 2)],
            -a[(r, 0)],
            -a[(r, 1)],
            -a[(r, 2)],
        ];
        let j_pt = [
            j_point_block[(r, 0)],
            j_point_block[(r, 1)],
            j_point_block[(r, 2)],
        ];
        rows.push((e, j_pose, j_pt));
    }

    if let Some(ur_obs) = obs.u_right {
        let ur = u - camera.bf * invz;
        let a_r = RowVector3::new(
            camera.fx * invz,
            0.0,
            (camera.bf - camera.fx * q.x) * invz2,
        );
        let j_rot_r = a_r * sq;
        let j_pt_r = -a_r * r_cw;
        rows.push((
            ur_obs - ur,
            [
                j_rot_r[0],
                j_rot_r[1],
                j_rot_r[2],
                -a_r[0],
                -a_r[1],
                -a_r[2],
            ],
            [j_pt_r[0], j_pt_r[1], j_pt_r[2]],
        ));
    }

    // Weighting.
    let chi2: f64 = rows.iter().map(|(e, _, _)| e * e).sum::<f64>() * obs.inv_sigma2;
    let delta2 = if obs.u_right.is_some() {
        CHI2_STEREO
    } else {
        CHI2_MONO
    };
    let huber_w = if chi2 <= delta2 {
        1.0
    } else {
        (delta2 / chi2).sqrt()
    };
    let w = obs.inv_sigma2.sqrt() * huber_w.sqrt();
    for (e, j_pose, j_pt) in rows.iter_mut() {
        *e *= w;
        for j in j_pose.iter_mut() {
            *j *= w;
        }
        for j in j_pt.iter_mut() {
            *j *= w;
        }
    }

    Some(rows)
}

fn total_error(
    problem: &LocalBaProblem,
    camera: &PinholeCamera,
    poses: &[SE3],
    points: &[Vector3<f64>],
) -> f64 {
    problem
        .observations
        .iter()
        .map(|obs| {
            let pose = pose_of(problem, poses, obs.kf);
            linearize(camera, pose, &points[obs.point_idx], obs)
                .map(|rows| rows.iter().map(|(e, _, _)| e * e).sum::<f64>())
                .unwrap_or(1e6)
        })
        .sum()
}

fn chi2_of(camera: &PinholeCamera, pose: &SE3, point: &Vector3<f64>, obs: &BaObservation) -> f64 {
    let q = pose.transform_point(point);
    if q.z <= 1e-6 {
        return f64::INFINITY;
    }
    let u = camera.fx * q.x / q.z + camera.cx;
    let v = camera.fy * q.y / q.z + camera.cy;
    let mut chi2 = (obs.uv.x - u).powi(2) + (obs.uv.y - v).powi(2);
    if let Some(ur_obs) = obs.u_right {
        chi2 += (ur_obs - (u - camera.bf / q.z)).powi(2);
    }
    chi2 * obs.inv_sigma2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint, ScalePyramid};
    use crate::map::KeyFrameData;
    use crate::tracking::frame::test_camera;
    use nalgebra::UnitQuaternion;

    /// Build a map with three keyframes observing a shared point cloud,
    /// with the middle keyframe's pose and the points perturbed.
    fn synthetic_map(perturb: bool) -> (Map, PinholeCamera, KeyFrameId, Vec<Vector3<f64>>) {
        let camera = test_camera();
        let mut map = Map::new(ScalePyramid::new(8, 1.2));

        let world: Vec<Vector3<f64>> = (0..40)
            .map(|i| {
                let fi = i as f64;
                Vector3::new(
                    (fi * 0.53).sin() * 2.0,
                    (fi * 0.29).cos() * 1.5,
                    6.0 + (fi * 0.11).sin(),
                )
            })
            .collect();

        let true_poses: Vec<SE3> = (0..3)
            .map(|i| {
                SE3::new(
                    UnitQuaternion::identity(),
                    Vector3::new(-0.3 * i as f64, 0.0, 0.0),
                )
            })
            .collect();

        let mut kf_ids = Vec::new();
        for (i, pose) in true_poses.iter().enumerate() {
            let keypoints: Vec<Keypoint> = world
                .iter()
                .map(|p| {
                    let uv = camera.project(&pose.transform_point(p)).unwrap();
                    Keypoint {
                        x: uv.x,
                        y: uv.y,
                        octave: 0,
                        angle: 0.0,
                    }
                })
                .collect();
            let n = keypoints.len();
            let stored_pose = if perturb && i == 1 {
                SE3::new(
                    UnitQuaternion::from_euler_angles(0.01, -0.01, 0.005),
                    pose.translation + Vector3::new(0.05, -0.03, 0.02),
                )
            } else {
                pose.clone()
            };
            kf_ids.push(map.create_keyframe(KeyFrameData {
                source_frame_id: i as u64,
                timestamp: i as f64,
                pose_cw: stored_pose,
                keypoints,
                descriptors: vec![Descriptor::zeros(); n],
                depths: vec![None; n],
                u_right: vec![None; n],
            }));
        }

        for (j, p) in world.iter().enumerate() {
            let noise = if perturb {
                Vector3::new(0.03, -0.02, 0.05)
            } else {
                Vector3::zeros()
            };
            let mp = map.create_map_point(p + noise, Descriptor::zeros(), kf_ids[0]);
            for &kf in &kf_ids {
                map.associate(kf, j, mp);
            }
        }
        for &kf in &kf_ids {
            map.update_connections(kf);
        }

        (map, camera, kf_ids[1], world)
    }

    #[test]
    fn reduces_reprojection_error() {
        let (map, camera, center, world) = synthetic_map(true);
        let config = LocalBaConfig::default();
        let problem = collect_local_ba(&map, center, &config).unwrap();
        let result = solve_local_ba(&problem, &camera, &config, &|| false).unwrap();

        assert!(result.iterations > 0);
        assert!(result.final_error <= result.initial_error);
        assert!(result.final_error < 0.1 * result.initial_error.max(1e-9));

        // Optimized points moved toward the true structure.
        let mut improved = 0;
        for (mp_id, pos) in &result.points {
            let idx = mp_id.0 as usize;
            if (pos - world[idx]).norm() < 0.03 {
                improved += 1;
            }
        }
        assert!(improved > world.len() / 2);
    }

    #[test]
    fn abort_flag_stops_at_iteration_boundary() {
        let (map, camera, center, _) = synthetic_map(true);
        let config = LocalBaConfig::default();
        let problem = collect_local_ba(&map, center, &config).unwrap();
        let result = solve_local_ba(&problem, &camera, &config, &|| true).unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(result.initial_error, result.final_error);
    }

    #[test]
    fn apply_writes_back_and_clears_outliers() {
        let (mut map, camera, center, _) = synthetic_map(true);
        let config = LocalBaConfig::default();
        let problem = collect_local_ba(&map, center, &config).unwrap();
        let result = solve_local_ba(&problem, &camera, &config, &|| false).unwrap();

        apply_local_ba(&mut map, &result);
        for (kf_id, pose) in &result.poses {
            let stored = map.keyframe(*kf_id).unwrap().pose_cw();
            assert!((stored.translation - pose.translation).norm() < 1e-12);
        }
        map.assert_consistent();
    }

    #[test]
    fn origin_keyframe_stays_fixed() {
        let (map, camera, center, _) = synthetic_map(true);
        let config = LocalBaConfig::default();
        let problem = collect_local_ba(&map, center, &config).unwrap();
        let origin = map.origin().unwrap();
        assert!(problem.optimized.iter().all(|(id, _)| *id != origin));

        let result = solve_local_ba(&problem, &camera, &config, &|| false).unwrap();
        assert!(result.poses.iter().all(|(id, _)| *id != origin));
    }
}
