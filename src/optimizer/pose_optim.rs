//! Pose-only optimization of a tracked frame.
//!
//! Minimizes the robust reprojection error of the frame's map-point
//! correspondences over the 6-dof pose, leaving the structure fixed. Runs
//! four Levenberg–Marquardt rounds with χ² outlier reclassification between
//! rounds; the frame's outlier flags and pose are updated in place and the
//! surviving inlier count is returned.

use nalgebra::{Matrix2x3, Vector2, Vector3, Vector6};

use crate::geometry::{skew, SE3};
use crate::map::Map;
use crate::tracking::frame::Frame;

type Mat6 = nalgebra::Matrix6<f64>;

const ROUNDS: usize = 4;
const ITERATIONS_PER_ROUND: usize = 10;
/// χ² at 95 % for 2 dof (monocular observation).
const CHI2_MONO: f64 = 5.991;
/// χ² at 95 % for 3 dof (observation with a right-eye term).
const CHI2_STEREO: f64 = 7.815;
const MIN_CORRESPONDENCES: usize = 3;

struct Observation {
    slot: usize,
    uv: Vector2<f64>,
    u_right: Option<f64>,
    position: Vector3<f64>,
    inv_sigma2: f64,
}

#[derive(Debug)]
pub struct PoseOptimization {
    pub pose_cw: SE3,
    pub num_inliers: usize,
}

/// Optimize the frame pose against its current associations.
///
/// Correspondences flagged as outliers by a previous round are excluded
/// from the normal equations but re-tested every round, so a pose that
/// drifts back over them can reclaim them.
pub fn optimize_frame_pose(frame: &mut Frame, map: &Map) -> Option<PoseOptimization> {
    let mut pose = frame.pose_cw.clone()?;
    let pyramid = map.pyramid();

    let mut observations = Vec::new();
    for (slot, entry) in frame.map_points.iter().enumerate() {
        let Some(raw_id) = *entry else { continue };
        let Some(mp_id) = map.resolve(raw_id) else {
            continue;
        };
        let Some(mp) = map.map_point(mp_id) else {
            continue;
        };
        let kp = &frame.keypoints[slot];
        observations.push(Observation {
            slot,
            uv: Vector2::new(kp.x, kp.y),
            u_right: frame.u_right[slot],
            position: mp.position,
            inv_sigma2: pyramid.inv_sigma2(kp.octave),
        });
    }
    if observations.len() < MIN_CORRESPONDENCES {
        return None;
    }

    let mut is_outlier: Vec<bool> = observations
        .iter()
        .map(|o| frame.outliers[o.slot])
        .collect();

    for _round in 0..ROUNDS {
        pose = lm_rounds(&pose, &observations, &is_outlier, frame, ITERATIONS_PER_ROUND);

        // Reclassify every correspondence at the new pose.
        for (i, obs) in observations.iter().enumerate() {
            let chi2 = observation_chi2(&pose, obs, frame);
            let bound = if obs.u_right.is_some() {
                CHI2_STEREO
            } else {
                CHI2_MONO
            };
            is_outlier[i] = chi2 > bound;
        }

        if is_outlier.iter().filter(|o| !**o).count() < MIN_CORRESPONDENCES {
            break;
        }
    }

    let mut num_inliers = 0;
    for (i, obs) in observations.iter().enumerate() {
        frame.outliers[obs.slot] = is_outlier[i];
        if !is_outlier[i] {
            num_inliers += 1;
        }
    }
    frame.set_pose_cw(pose.clone());

    Some(PoseOptimization {
        pose_cw: pose,
        num_inliers,
    })
}

/// One LM block: damped Gauss-Newton steps on the current inlier set with a
/// left-multiplicative pose increment.
fn lm_rounds(
    initial: &SE3,
    observations: &[Observation],
    is_outlier: &[bool],
    frame: &Frame,
    iterations: usize,
) -> SE3 {
    let mut pose = initial.clone();
    let mut lambda = 1e-3;

    for _ in 0..iterations {
        let mut h = Mat6::zeros();
        let mut b = Vector6::<f64>::zeros();
        let mut error = 0.0;
        let mut n_terms = 0usize;

        for (i, obs) in observations.iter().enumerate() {
            if is_outlier[i] {
                continue;
            }
            let Some((residual, j_rows)) = linearize(&pose, obs, frame) else {
                continue;
            };
            for (e, j) in residual.iter().zip(j_rows.iter()) {
                h += j * j.transpose();
                b += j * *e;
                error += e * e;
                n_terms += 1;
            }
        }
        if n_terms < 6 {
            break;
        }

        let mut damped = h;
        for d in 0..6 {
            damped[(d, d)] += lambda * damped[(d, d)].max(1e-9);
        }
        let Some(delta) = damped.lu().solve(&(-b)) else {
            break;
        };
        if delta.norm() < 1e-10 {
            break;
        }

        let increment = SE3::from_params(
            &Vector3::new(delta[0], delta[1], delta[2]),
            &Vector3::new(delta[3], delta[4], delta[5]),
        );
        let trial = increment.compose(&pose);

        let mut trial_error = 0.0;
        for (i, obs) in observations.iter().enumerate() {
            if is_outlier[i] {
                continue;
            }
            trial_error += weighted_error(&trial, obs, frame);
        }

        if trial_error < error {
            pose = trial;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e8);
        }
    }

    pose
}

/// Residual rows and Jacobian rows (w.r.t. the left increment [δω | δt]) of
/// one observation, Huber- and information-weighted.
fn linearize(
    pose: &SE3,
    obs: &Observation,
    frame: &Frame,
) -> Option<(Vec<f64>, Vec<Vector6<f64>>)> {
    let cam = &frame.camera;
    let q = pose.transform_point(&obs.position);
    if q.z <= 1e-6 {
        return None;
    }

    let invz = 1.0 / q.z;
    let invz2 = invz * invz;
    let u = cam.fx * q.x * invz + cam.cx;
    let v = cam.fy * q.y * invz + cam.cy;

    let e_u = obs.uv.x - u;
    let e_v = obs.uv.y - v;

    // du/dq, dv/dq rows.
    let a = Matrix2x3::new(
        cam.fx * invz,
        0.0,
        -cam.fx * q.x * invz2,
        0.0,
        cam.fy * invz,
        -cam.fy * q.y * invz2,
    );
    let sq = skew(&q);

    // de/dδ = [A·[q]× | -A] for e = observed - projected.
    let j_rot = a * sq;
    let row_u = Vector6::new(
        j_rot[(0, 0)],
        j_rot[(0, 1)],
        j_rot[(0, 2)],
        -a[(0, 0)],
        -a[(0, 1)],
        -a[(0, 2)],
    );
    let row_v = Vector6::new(
        j_rot[(1, 0)],
        j_rot[(1, 1)],
        j_rot[(1, 2)],
        -a[(1, 0)],
        -a[(1, 1)],
        -a[(1, 2)],
    );

    let sqrt_info = obs.inv_sigma2.sqrt();
    let mut residual = vec![e_u, e_v];
    let mut rows = vec![row_u, row_v];

    if let Some(ur_obs) = obs.u_right {
        let ur = u - cam.bf * invz;
        let e_r = ur_obs - ur;
        let a_r = nalgebra::RowVector3::new(
            cam.fx * invz,
            0.0,
            (cam.bf - cam.fx * q.x) * invz2,
        );
        let j_rot_r = a_r * sq;
        let row_r = Vector6::new(
            j_rot_r[0],
            j_rot_r[1],
            j_rot_r[2],
            -a_r[0],
            -a_r[1],
            -a_r[2],
        );
        residual.push(e_r);
        rows.push(row_r);
    }

    // Huber on the χ² of the whole observation.
    let chi2: f64 = residual.iter().map(|e| e * e).sum::<f64>() * obs.inv_sigma2;
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

    let w = sqrt_info * huber_w.sqrt();
    for e in residual.iter_mut() {
        *e *= w;
    }
    for j in rows.iter_mut() {
        *j *= w;
    }
    Some((residual, rows))
}

fn weighted_error(pose: &SE3, obs: &Observation, frame: &Frame) -> f64 {
    linearize(pose, obs, frame)
        .map(|(residual, _)| residual.iter().map(|e| e * e).sum())
        .unwrap_or(1e6)
}

fn observation_chi2(pose: &SE3, obs: &Observation, frame: &Frame) -> f64 {
    let cam = &frame.camera;
    let q = pose.transform_point(&obs.position);
    if q.z <= 1e-6 {
        return f64::INFINITY;
    }
    let u = cam.fx * q.x / q.z + cam.cx;
    let v = cam.fy * q.y / q.z + cam.cy;
    let mut chi2 = (obs.uv.x - u).powi(2) + (obs.uv.y - v).powi(2);
    if let Some(ur_obs) = obs.u_right {
        let ur = u - cam.bf / q.z;
        chi2 += (ur_obs - ur).powi(2);
    }
    chi2 * obs.inv_sigma2
}
