//! Monocular map initialization.
//!
//! From a matched reference/current frame pair, homography and fundamental
//! models are estimated in parallel by RANSAC, scored by symmetric transfer
//! error, and the winning model is decomposed into a relative motion. The
//! candidate motions are vetted by triangulating the inlier matches and
//! counting points that land in front of both cameras with enough parallax
//! and small reprojection error.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::camera::PinholeCamera;
use crate::geometry::{triangulate_dlt, SE3};
use crate::tracking::frame::Frame;

/// Inlier gate for the fundamental transfer error (1 dof).
const CHI2_F: f64 = 3.841;
/// Inlier gate for the homography transfer error (2 dof) and the score cap
/// shared by both models.
const CHI2_SCORE: f64 = 5.991;
/// Homography is chosen when it explains this share of the combined score.
const H_RATIO: f64 = 0.40;
/// Minimum triangulated points for a successful reconstruction.
const MIN_TRIANGULATED: usize = 50;
/// Minimum median-ish parallax (degrees) for a successful reconstruction.
const MIN_PARALLAX_DEG: f64 = 1.0;

/// Result of a successful two-view reconstruction. The world frame is the
/// reference camera; `pose_cw2` is world → current camera.
pub struct Initialization {
    pub pose_cw2: SE3,
    /// Triangulated point per reference keypoint index.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Matches that survived as triangulated inliers.
    pub triangulated: Vec<bool>,
}

pub struct Initializer {
    camera: PinholeCamera,
    sigma2: f64,
    iterations: usize,
    /// Reference keypoint pixel positions.
    ref_points: Vec<Vector2<f64>>,
}

struct MatchedPair {
    ref_idx: usize,
    x1: Vector2<f64>,
    x2: Vector2<f64>,
}

impl Initializer {
    pub fn new(reference: &Frame, sigma: f64, iterations: usize) -> Self {
        Self {
            camera: reference.camera,
            sigma2: sigma * sigma,
            iterations,
            ref_points: reference
                .keypoints
                .iter()
                .map(|kp| Vector2::new(kp.x, kp.y))
                .collect(),
        }
    }

    /// Attempt reconstruction from `matches12` (reference keypoint →
    /// current keypoint).
    pub fn initialize(&self, current: &Frame, matches12: &[Option<usize>]) -> Option<Initialization> {
        let pairs: Vec<MatchedPair> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| {
                m.map(|i2| MatchedPair {
                    ref_idx: i1,
                    x1: self.ref_points[i1],
                    x2: Vector2::new(current.keypoints[i2].x, current.keypoints[i2].y),
                })
            })
            .collect();
        if pairs.len() < 8 {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(pairs.len() as u64 ^ 0x51ac);
        let sample_sets: Vec<Vec<usize>> = (0..self.iterations)
            .map(|_| sample_indices(&mut rng, pairs.len(), 8))
            .collect();

        let (h21, score_h, inliers_h) = self.find_homography(&pairs, &sample_sets);
        let (f21, score_f, inliers_f) = self.find_fundamental(&pairs, &sample_sets);

        let ratio = if score_h + score_f > 0.0 {
            score_h / (score_h + score_f)
        } else {
            0.0
        };

        if ratio > H_RATIO {
            self.reconstruct_h(&pairs, &h21, &inliers_h)
        } else {
            self.reconstruct_f(&pairs, &f21, &inliers_f)
        }
    }

    // ── Model estimation ────────────────────────────────────────────────

    fn find_homography(
        &self,
        pairs: &[MatchedPair],
        sample_sets: &[Vec<usize>],
    ) -> (Matrix3<f64>, f64, Vec<bool>) {
        let (norm1, t1) = normalize_points(pairs.iter().map(|p| p.x1));
        let (norm2, t2) = normalize_points(pairs.iter().map(|p| p.x2));
        let t2_inv = t2.try_inverse().unwrap_or_else(Matrix3::identity);

        let mut best = (Matrix3::identity(), -1.0, vec![false; pairs.len()]);
        for sample in sample_sets {
            let h_norm = match compute_h21(&norm1, &norm2, sample) {
                Some(h) => h,
                None => continue,
            };
            let h21 = t2_inv * h_norm * t1;
            let (score, inliers) = self.check_homography(pairs, &h21);
            if score > best.1 {
                best = (h21, score, inliers);
            }
        }
        best
    }

    fn find_fundamental(
        &self,
        pairs: &[MatchedPair],
        sample_sets: &[Vec<usize>],
    ) -> (Matrix3<f64>, f64, Vec<bool>) {
        let (norm1, t1) = normalize_points(pairs.iter().map(|p| p.x1));
        let (norm2, t2) = normalize_points(pairs.iter().map(|p| p.x2));

        let mut best = (Matrix3::identity(), -1.0, vec![false; pairs.len()]);
        for sample in sample_sets {
            let f_norm = match compute_f21(&norm1, &norm2, sample) {
                Some(f) => f,
                None => continue,
            };
            let f21 = t2.transpose() * f_norm * t1;
            let (score, inliers) = self.check_fundamental(pairs, &f21);
            if score > best.1 {
                best = (f21, score, inliers);
            }
        }
        best
    }

    /// Symmetric transfer score of a homography hypothesis.
    fn check_homography(&self, pairs: &[MatchedPair], h21: &Matrix3<f64>) -> (f64, Vec<bool>) {
        let h12 = match h21.try_inverse() {
            Some(h) => h,
            None => return (-1.0, vec![false; pairs.len()]),
        };
        let inv_sigma2 = 1.0 / self.sigma2;
        let mut score = 0.0;
        let mut inliers = vec![false; pairs.len()];

        for (i, pair) in pairs.iter().enumerate() {
            let d2_in_1 = homography_transfer_error(&h12, &pair.x2, &pair.x1);
            let d2_in_2 = homography_transfer_error(h21, &pair.x1, &pair.x2);
            let chi1 = d2_in_1 * inv_sigma2;
            let chi2 = d2_in_2 * inv_sigma2;
            if chi1 <= CHI2_SCORE && chi2 <= CHI2_SCORE {
                score += (CHI2_SCORE - chi1) + (CHI2_SCORE - chi2);
                inliers[i] = true;
            }
        }
        (score, inliers)
    }

    /// Symmetric epipolar score of a fundamental hypothesis.
    fn check_fundamental(&self, pairs: &[MatchedPair], f21: &Matrix3<f64>) -> (f64, Vec<bool>) {
        let inv_sigma2 = 1.0 / self.sigma2;
        let mut score = 0.0;
        let mut inliers = vec![false; pairs.len()];

        for (i, pair) in pairs.iter().enumerate() {
            let d2_in_2 = epipolar_distance_sq(f21, &pair.x1, &pair.x2);
            let d2_in_1 = epipolar_distance_sq(&f21.transpose(), &pair.x2, &pair.x1);
            let chi1 = d2_in_2 * inv_sigma2;
            let chi2 = d2_in_1 * inv_sigma2;
            let ok1 = chi1 <= CHI2_F;
            let ok2 = chi2 <= CHI2_F;
            if ok1 && ok2 {
                score += (CHI2_SCORE - chi1) + (CHI2_SCORE - chi2);
                inliers[i] = true;
            }
        }
        (score, inliers)
    }

    // ── Reconstruction ──────────────────────────────────────────────────

    fn reconstruct_f(
        &self,
        pairs: &[MatchedPair],
        f21: &Matrix3<f64>,
        inliers: &[bool],
    ) -> Option<Initialization> {
        let k = self.camera.intrinsic_matrix();
        let e21 = k.transpose() * f21 * k;

        let (r1, r2, t) = decompose_essential(&e21)?;
        let candidates = [
            (r1, t),
            (r1, -t),
            (r2, t),
            (r2, -t),
        ];
        self.select_motion(pairs, inliers, &candidates, 0.7)
    }

    fn reconstruct_h(
        &self,
        pairs: &[MatchedPair],
        h21: &Matrix3<f64>,
        inliers: &[bool],
    ) -> Option<Initialization> {
        let k = self.camera.intrinsic_matrix();
        let k_inv = k.try_inverse()?;
        let a = k_inv * h21 * k;

        let candidates = decompose_homography(&a)?;
        self.select_motion(pairs, inliers, &candidates, 0.75)
    }

    /// Triangulate under each motion hypothesis and keep a clear winner.
    fn select_motion(
        &self,
        pairs: &[MatchedPair],
        inliers: &[bool],
        candidates: &[(Matrix3<f64>, Vector3<f64>)],
        second_best_ratio: f64,
    ) -> Option<Initialization> {
        let n_inliers = inliers.iter().filter(|i| **i).count();
        let mut best_good = 0usize;
        let mut second_good = 0usize;
        let mut best: Option<(usize, CheckedMotion)> = None;

        for (ci, (r, t)) in candidates.iter().enumerate() {
            let checked = self.check_rt(r, t, pairs, inliers);
            if checked.n_good > best_good {
                second_good = best_good;
                best_good = checked.n_good;
                best = Some((ci, checked));
            } else if checked.n_good > second_good {
                second_good = checked.n_good;
            }
        }

        let (_, winner) = best?;
        // The winner must clearly dominate, explain most inliers, carry
        // enough parallax, and triangulate a minimum of points.
        if second_good as f64 > second_best_ratio * best_good as f64 {
            return None;
        }
        let min_good = ((0.9 * n_inliers as f64) as usize).max(MIN_TRIANGULATED);
        if best_good < min_good || winner.parallax_deg < MIN_PARALLAX_DEG {
            return None;
        }

        let mut points = vec![None; self.ref_points.len()];
        let mut triangulated = vec![false; self.ref_points.len()];
        for (pi, p3d) in winner.points.iter().enumerate() {
            if let Some(p) = p3d {
                let ref_idx = pairs[pi].ref_idx;
                points[ref_idx] = Some(*p);
                triangulated[ref_idx] = true;
            }
        }

        Some(Initialization {
            pose_cw2: SE3::from_matrix(&winner.rotation, winner.translation),
            points,
            triangulated,
        })
    }

    /// Count matches that triangulate in front of both cameras with small
    /// reprojection error under the hypothesis (R, t).
    fn check_rt(
        &self,
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        pairs: &[MatchedPair],
        inliers: &[bool],
    ) -> CheckedMotion {
        let pose1 = SE3::identity();
        let pose2 = SE3::from_matrix(r, *t);
        let o2 = pose2.inverse().translation;
        let th2 = 4.0 * self.sigma2;

        let mut points: Vec<Option<Vector3<f64>>> = vec![None; pairs.len()];
        let mut parallaxes: Vec<f64> = Vec::new();
        let mut n_good = 0;

        for (i, pair) in pairs.iter().enumerate() {
            if !inliers[i] {
                continue;
            }
            let xn1 = self.camera.normalize(pair.x1.x, pair.x1.y).push(1.0);
            let xn2 = self.camera.normalize(pair.x2.x, pair.x2.y).push(1.0);

            let Some(p) = triangulate_dlt(&xn1, &xn2, &pose1, &pose2) else {
                continue;
            };
            if !p.x.is_finite() || !p.y.is_finite() || !p.z.is_finite() {
                continue;
            }

            let ray1 = p;
            let ray2 = p - o2;
            let denom = ray1.norm() * ray2.norm();
            if denom < 1e-12 {
                continue;
            }
            let cos_parallax = ray1.dot(&ray2) / denom;

            // Cheirality (allow low-parallax points only if in front).
            if p.z <= 0.0 && cos_parallax < 0.99998 {
                continue;
            }
            let p_c2 = pose2.transform_point(&p);
            if p_c2.z <= 0.0 && cos_parallax < 0.99998 {
                continue;
            }

            let Some(uv1) = self.camera.project(&p) else {
                continue;
            };
            if (uv1 - pair.x1).norm_squared() > th2 {
                continue;
            }
            let Some(uv2) = self.camera.project(&p_c2) else {
                continue;
            };
            if (uv2 - pair.x2).norm_squared() > th2 {
                continue;
            }

            points[i] = Some(p);
            parallaxes.push(cos_parallax);
            n_good += 1;
        }

        let parallax_deg = if parallaxes.is_empty() {
            0.0
        } else {
            parallaxes.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = parallaxes.len().min(50) - 1;
            parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
        };

        CheckedMotion {
            rotation: *r,
            translation: *t,
            points,
            n_good,
            parallax_deg,
        }
    }
}

struct CheckedMotion {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    points: Vec<Option<Vector3<f64>>>,
    n_good: usize,
    parallax_deg: f64,
}

// ── Linear model solvers ────────────────────────────────────────────────

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

/// Hartley normalization: zero-mean, unit mean absolute deviation.
fn normalize_points<I: Iterator<Item = Vector2<f64>>>(
    points: I,
) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let pts: Vec<Vector2<f64>> = points.collect();
    let n = pts.len().max(1) as f64;
    let mean = pts.iter().sum::<Vector2<f64>>() / n;
    let mut dev = Vector2::zeros();
    for p in &pts {
        dev.x += (p.x - mean.x).abs();
        dev.y += (p.y - mean.y).abs();
    }
    dev /= n;
    let sx = if dev.x > 1e-12 { 1.0 / dev.x } else { 1.0 };
    let sy = if dev.y > 1e-12 { 1.0 / dev.y } else { 1.0 };

    let normalized = pts
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    (normalized, t)
}

/// DLT homography from an 8-point sample.
fn compute_h21(
    norm1: &[Vector2<f64>],
    norm2: &[Vector2<f64>],
    sample: &[usize],
) -> Option<Matrix3<f64>> {
    let n = sample.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (row, &idx) in sample.iter().enumerate() {
        let (p1, p2) = (&norm1[idx], &norm2[idx]);
        let r = 2 * row;
        a[(r, 0)] = 0.0;
        a[(r, 1)] = 0.0;
        a[(r, 2)] = 0.0;
        a[(r, 3)] = -p1.x;
        a[(r, 4)] = -p1.y;
        a[(r, 5)] = -1.0;
        a[(r, 6)] = p2.y * p1.x;
        a[(r, 7)] = p2.y * p1.y;
        a[(r, 8)] = p2.y;
        a[(r + 1, 0)] = p1.x;
        a[(r + 1, 1)] = p1.y;
        a[(r + 1, 2)] = 1.0;
        a[(r + 1, 6)] = -p2.x * p1.x;
        a[(r + 1, 7)] = -p2.x * p1.y;
        a[(r + 1, 8)] = -p2.x;
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(8);
    Some(Matrix3::new(
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8],
    ))
}

/// Normalized 8-point fundamental matrix with the rank-2 constraint.
fn compute_f21(
    norm1: &[Vector2<f64>],
    norm2: &[Vector2<f64>],
    sample: &[usize],
) -> Option<Matrix3<f64>> {
    let n = sample.len();
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (row, &idx) in sample.iter().enumerate() {
        let (p1, p2) = (&norm1[idx], &norm2[idx]);
        a[(row, 0)] = p2.x * p1.x;
        a[(row, 1)] = p2.x * p1.y;
        a[(row, 2)] = p2.x;
        a[(row, 3)] = p2.y * p1.x;
        a[(row, 4)] = p2.y * p1.y;
        a[(row, 5)] = p2.y;
        a[(row, 6)] = p1.x;
        a[(row, 7)] = p1.y;
        a[(row, 8)] = 1.0;
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let f = v_t.row(8);
    let f_pre = Matrix3::new(f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7], f[8]);

    // Enforce rank 2.
    let mut f_svd = f_pre.svd(true, true);
    f_svd.singular_values[2] = 0.0;
    f_svd.recompose().ok()
}

/// Transfer error |map(h, src) − dst|².
fn homography_transfer_error(
    h: &Matrix3<f64>,
    src: &Vector2<f64>,
    dst: &Vector2<f64>,
) -> f64 {
    let w = h[(2, 0)] * src.x + h[(2, 1)] * src.y + h[(2, 2)];
    if w.abs() < 1e-12 {
        return f64::INFINITY;
    }
    let u = (h[(0, 0)] * src.x + h[(0, 1)] * src.y + h[(0, 2)]) / w;
    let v = (h[(1, 0)] * src.x + h[(1, 1)] * src.y + h[(1, 2)]) / w;
    (u - dst.x).powi(2) + (v - dst.y).powi(2)
}

/// Squared distance of `x2` to the epipolar line `F x1`.
fn epipolar_distance_sq(f: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let a = f[(0, 0)] * x1.x + f[(0, 1)] * x1.y + f[(0, 2)];
    let b = f[(1, 0)] * x1.x + f[(1, 1)] * x1.y + f[(1, 2)];
    let c = f[(2, 0)] * x1.x + f[(2, 1)] * x1.y + f[(2, 2)];
    let den = a * a + b * b;
    if den < 1e-12 {
        return f64::INFINITY;
    }
    let num = a * x2.x + b * x2.y + c;
    num * num / den
}

/// E = U diag(1,1,0) Vᵀ → two rotations and the translation direction.
fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    let mut t = u.column(2).into_owned();
    let norm = t.norm();
    if norm < 1e-12 {
        return None;
    }
    t /= norm;
    Some((r1, r2, t))
}

/// Faugeras decomposition of a calibrated homography `A = K⁻¹ H K` into the
/// eight candidate motions.
fn decompose_homography(a: &Matrix3<f64>) -> Option<Vec<(Matrix3<f64>, Vector3<f64>)>> {
    let svd = a.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let v = v_t.transpose();
    let (d1, d2, d3) = (
        svd.singular_values[0],
        svd.singular_values[1],
        svd.singular_values[2],
    );
    if d1 / d2 < 1.0001 || d2 / d3 < 1.0001 {
        // Degenerate: no unique plane.
        return None;
    }
    let s = u.determinant() * v.determinant();

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).max(0.0).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).max(0.0).sqrt();
    let x1s = [aux1, aux1, -aux1, -aux1];
    let x3s = [aux3, -aux3, aux3, -aux3];

    let mut candidates = Vec::with_capacity(8);

    // d' = +d2
    let aux_s = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).max(0.0).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    for i in 0..4 {
        let stheta = if x1s[i] * x3s[i] >= 0.0 { -aux_s } else { aux_s };
        let rp = Matrix3::new(ctheta, 0.0, -stheta, 0.0, 1.0, 0.0, stheta, 0.0, ctheta);
        let r = s * u * rp * v_t;
        let tp = Vector3::new(x1s[i], 0.0, -x3s[i]) * (d1 - d3);
        let mut t = u * tp;
        let n = t.norm();
        if n > 1e-12 {
            t /= n;
        }
        candidates.push((r, t));
    }

    // d' = -d2
    let aux_sphi =
        ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).max(0.0).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    for i in 0..4 {
        let sphi = if x1s[i] * x3s[i] >= 0.0 { aux_sphi } else { -aux_sphi };
        let rp = Matrix3::new(cphi, 0.0, sphi, 0.0, -1.0, 0.0, sphi, 0.0, -cphi);
        let r = s * u * rp * v_t;
        let tp = Vector3::new(x1s[i], 0.0, x3s[i]) * (d1 + d3);
        let mut t = u * tp;
        let n = t.norm();
        if n > 1e-12 {
            t /= n;
        }
        candidates.push((r, t));
    }

    Some(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint};
    use crate::tracking::frame::test_camera;
    use nalgebra::UnitQuaternion;

    /// Two frames viewing a 3D grid with a sideways-translated second
    /// camera, plus the ground-truth match list.
    fn two_view_fixture(
        n: usize,
        planar: bool,
    ) -> (Frame, Frame, Vec<Option<usize>>, SE3) {
        let camera = test_camera();
        let pose2 = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.03, 0.0),
            Vector3::new(-0.3, 0.02, 0.01),
        );

        let mut f1_feats = Vec::new();
        let mut f2_feats = Vec::new();
        let mut matches = Vec::new();
        let mut kept = 0usize;
        for i in 0..n {
            let fi = i as f64;
            let depth_jitter = if planar {
                0.0
            } else {
                (fi * 0.713).sin() * 2.0
            };
            let p = Vector3::new(
                ((fi * 2.399).sin()) * 3.0,
                ((fi * 1.117).cos()) * 2.0,
                8.0 + depth_jitter,
            );
            let Some(uv1) = camera.project(&p) else { continue };
            let Some(uv2) = camera.project(&pose2.transform_point(&p)) else {
                continue;
            };
            if !camera.in_image(uv1.x, uv1.y) || !camera.in_image(uv2.x, uv2.y) {
                continue;
            }
            f1_feats.push((
                Keypoint {
                    x: uv1.x,
                    y: uv1.y,
                    octave: 0,
                    angle: 0.0,
                },
                Descriptor([i as u8; 32]),
            ));
            f2_feats.push((
                Keypoint {
                    x: uv2.x,
                    y: uv2.y,
                    octave: 0,
                    angle: 0.0,
                },
                Descriptor([i as u8; 32]),
            ));
            matches.push(Some(kept));
            kept += 1;
        }

        let f1 = Frame::new(0, 0.0, f1_feats, None, camera);
        let f2 = Frame::new(1, 0.1, f2_feats, None, camera);
        (f1, f2, matches, pose2)
    }

    #[test]
    fn reconstructs_general_scene_via_fundamental() {
        let (f1, f2, matches, truth) = two_view_fixture(220, false);
        let init = Initializer::new(&f1, 1.0, 200);
        let result = init.initialize(&f2, &matches).expect("initialization");

        let n_points = result.points.iter().filter(|p| p.is_some()).count();
        assert!(n_points >= MIN_TRIANGULATED, "triangulated {n_points}");

        // Translation is recovered up to scale: compare directions.
        let t_est = result.pose_cw2.translation.normalize();
        let t_true = truth.translation.normalize();
        assert!(
            (t_est - t_true).norm() < 0.05 || (t_est + t_true).norm() < 0.05,
            "direction error"
        );
        assert!(result.pose_cw2.rotation.angle_to(&truth.rotation) < 0.02);

        // Triangulated points reproject into camera 1.
        let camera = f1.camera;
        for (idx, p) in result.points.iter().enumerate() {
            if let Some(p) = p {
                let uv = camera.project(p).unwrap();
                let kp = &f1.keypoints[idx];
                assert!((uv.x - kp.x).abs() < 2.0 && (uv.y - kp.y).abs() < 2.0);
            }
        }
    }

    #[test]
    fn too_few_matches_fail() {
        let (f1, f2, mut matches, _) = two_view_fixture(220, false);
        // Keep only 80 matches: enough to run, but init needs ≥ 50
        // triangulated out of a 100-match minimum upstream; the caller
        // enforces the 100-match gate, here we just starve the solver.
        for m in matches.iter_mut().skip(6) {
            *m = None;
        }
        let init = Initializer::new(&f1, 1.0, 200);
        assert!(init.initialize(&f2, &matches).is_none());
    }

    #[test]
    fn planar_scene_still_reconstructs() {
        let (f1, f2, matches, truth) = two_view_fixture(260, true);
        let init = Initializer::new(&f1, 1.0, 200);
        if let Some(result) = init.initialize(&f2, &matches) {
            assert!(result.pose_cw2.rotation.angle_to(&truth.rotation) < 0.05);
            let t_est = result.pose_cw2.translation.normalize();
            let t_true = truth.translation.normalize();
            assert!((t_est - t_true).norm() < 0.1 || (t_est + t_true).norm() < 0.1);
        }
    }
}
