//! Perspective-n-Point pose estimation with RANSAC.
//!
//! Works in normalized image coordinates (pixels pre-multiplied by K⁻¹) so
//! the solver stays independent of the camera model. Minimal hypotheses come
//! from a 6-point DLT; consensus is scored by reprojection error and the
//! winning hypothesis is refit on its inliers. Relocalization refines the
//! result further with the pose-only optimizer.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::SE3;

/// Minimum correspondences for a DLT pose hypothesis.
const MIN_SAMPLE: usize = 6;

#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated world → camera transform.
    pub pose_cw: SE3,
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

pub struct PnPConfig {
    pub iterations: usize,
    /// Inlier threshold on reprojection error in normalized coordinates
    /// (≈ pixels / fx).
    pub threshold: f64,
    /// Minimum consensus for a hypothesis to be considered at all.
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for PnPConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            threshold: 8.0 / 500.0,
            min_inliers: 10,
            seed: 0x5eed,
        }
    }
}

/// Solve camera pose from 3D world points and their normalized projections.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    config: &PnPConfig,
) -> Option<PnPResult> {
    assert_eq!(points3d.len(), points2d.len());
    let n = points3d.len();
    if n < MIN_SAMPLE {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best_inliers: Vec<bool> = Vec::new();
    let mut best_count = 0usize;

    for _ in 0..config.iterations {
        let sample = sample_indices(&mut rng, n, MIN_SAMPLE);
        let pose = match pose_from_dlt(
            &sample.iter().map(|&i| points3d[i]).collect::<Vec<_>>(),
            &sample.iter().map(|&i| points2d[i]).collect::<Vec<_>>(),
        ) {
            Some(p) => p,
            None => continue,
        };

        let (mask, count) = score_pose(&pose, points3d, points2d, config.threshold);
        if count > best_count {
            best_count = count;
            best_inliers = mask;
        }
    }

    if best_count < config.min_inliers.max(MIN_SAMPLE) {
        return None;
    }

    // Refit on the consensus set.
    let in3d: Vec<Vector3<f64>> = points3d
        .iter()
        .zip(&best_inliers)
        .filter(|(_, &m)| m)
        .map(|(p, _)| *p)
        .collect();
    let in2d: Vec<Vector2<f64>> = points2d
        .iter()
        .zip(&best_inliers)
        .filter(|(_, &m)| m)
        .map(|(p, _)| *p)
        .collect();

    let refined = pose_from_dlt(&in3d, &in2d)?;
    let (mask, count) = score_pose(&refined, points3d, points2d, config.threshold);

    Some(PnPResult {
        pose_cw: refined,
        num_inliers: count,
        inlier_mask: mask,
    })
}

fn sample_indices(rng: &mut StdRng, n: usize, k: usize) -> Vec<usize> {
    let mut picked = Vec::with_capacity(k);
    while picked.len() < k {
        let idx = rng.gen_range(0..n);
        if !picked.contains(&idx) {
            picked.push(idx);
        }
    }
    picked
}

fn score_pose(
    pose: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    threshold: f64,
) -> (Vec<bool>, usize) {
    let mut mask = vec![false; points3d.len()];
    let mut count = 0;
    for (i, (p, obs)) in points3d.iter().zip(points2d).enumerate() {
        let c = pose.transform_point(p);
        if c.z <= 1e-6 {
            continue;
        }
        let err = (Vector2::new(c.x / c.z, c.y / c.z) - obs).norm();
        if err < threshold {
            mask[i] = true;
            count += 1;
        }
    }
    (mask, count)
}

/// Direct linear transform: recover `[R|t]` up to scale from ≥ 6 points,
/// then project onto SE(3) via SVD orthogonalization.
fn pose_from_dlt(points3d: &[Vector3<f64>], points2d: &[Vector2<f64>]) -> Option<SE3> {
    let n = points3d.len();
    if n < MIN_SAMPLE {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, obs)) in points3d.iter().zip(points2d).enumerate() {
        let (x, y) = (obs.x, obs.y);
        let row = 2 * i;
        // [X 1 0 0 -x·X -x] / [0 0 X 1 -y·X -y] layout over the 3 rows of P.
        a[(row, 0)] = p.x;
        a[(row, 1)] = p.y;
        a[(row, 2)] = p.z;
        a[(row, 3)] = 1.0;
        a[(row, 8)] = -x * p.x;
        a[(row, 9)] = -x * p.y;
        a[(row, 10)] = -x * p.z;
        a[(row, 11)] = -x;
        a[(row + 1, 4)] = p.x;
        a[(row + 1, 5)] = p.y;
        a[(row + 1, 6)] = p.z;
        a[(row + 1, 7)] = 1.0;
        a[(row + 1, 8)] = -y * p.x;
        a[(row + 1, 9)] = -y * p.y;
        a[(row + 1, 10)] = -y * p.z;
        a[(row + 1, 11)] = -y;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(11);

    let mut m = Matrix3::new(h[0], h[1], h[2], h[4], h[5], h[6], h[8], h[9], h[10]);
    let mut t_raw = Vector3::new(h[3], h[7], h[11]);

    // P is recovered up to sign; pick the sign that puts the majority of the
    // sample in front of the camera (projective depth w = P₂·[X;1]).
    let behind = points3d
        .iter()
        .filter(|p| m[(2, 0)] * p.x + m[(2, 1)] * p.y + m[(2, 2)] * p.z + t_raw.z <= 0.0)
        .count();
    if behind * 2 > n {
        m = -m;
        t_raw = -t_raw;
    }

    // Project M onto a scaled rotation.
    let m_svd = m.svd(true, true);
    let (u, v_t3) = (m_svd.u?, m_svd.v_t?);
    let scale = m_svd.singular_values.mean();
    if scale.abs() < 1e-12 {
        return None;
    }

    let mut r = u * v_t3;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t3;
    }
    let t = t_raw / scale;

    Some(SE3::from_matrix(&r, t))
}
