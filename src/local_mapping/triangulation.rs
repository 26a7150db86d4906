//! New map point creation from keyframe pairs.
//!
//! For each covisibility neighbor of the freshly processed keyframe, match
//! unassociated keypoints under the epipolar constraint and triangulate.
//! Candidates must clear a parallax decision (DLT when the rays disagree
//! enough, stereo unprojection as the fallback), cheirality in both views,
//! per-octave χ² reprojection gates, and a scale-consistency band before a
//! landmark is born.

use std::collections::VecDeque;

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::camera::PinholeCamera;
use crate::geometry::{skew, triangulate_dlt, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matching::Matcher;

/// Neighbors examined per keyframe.
const NUM_NEIGHBORS_MONO: usize = 20;
const NUM_NEIGHBORS: usize = 10;
/// Monocular baseline gate: baseline / median scene depth.
const MIN_BASELINE_DEPTH_RATIO: f64 = 0.01;
/// Rays this parallel carry no usable parallax without stereo evidence.
const MAX_COS_PARALLAX_RAYS: f64 = 0.9998;
const MAX_REPROJ_MONO: f64 = 5.991;
const MAX_REPROJ_STEREO: f64 = 7.8;

#[derive(Debug, Default)]
pub struct TriangulationOutcome {
    pub new_points: usize,
    pub pairs_tried: usize,
    pub matches_found: usize,
    /// A new keyframe arrived and the pass bailed out early.
    pub aborted: bool,
}

/// Fundamental matrix relating keyframe 1 to keyframe 2:
/// `x1ᵀ F₁₂ x2 = 0` for pixel coordinates.
pub fn compute_f12(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    camera: &PinholeCamera,
) -> Option<Matrix3<f64>> {
    let kf1 = map.keyframe(kf1_id)?;
    let kf2 = map.keyframe(kf2_id)?;
    let r1 = kf1.pose_cw().rotation_matrix();
    let t1 = kf1.pose_cw().translation;
    let r2 = kf2.pose_cw().rotation_matrix();
    let t2 = kf2.pose_cw().translation;

    let r12 = r1 * r2.transpose();
    let t12 = -r12 * t2 + t1;

    let k = camera.intrinsic_matrix();
    let k_inv = k.try_inverse()?;
    Some(k_inv.transpose() * skew(&t12) * r12 * k_inv)
}

/// Triangulate new landmarks between `kf_id` and its best covisibles.
/// `inbox_waiting` aborts the sweep after the first neighbor when new
/// keyframes queue up.
pub fn create_new_map_points(
    map: &mut Map,
    kf_id: KeyFrameId,
    camera: &PinholeCamera,
    is_monocular: bool,
    recent_points: &mut VecDeque<MapPointId>,
    inbox_waiting: &dyn Fn() -> bool,
) -> TriangulationOutcome {
    let mut outcome = TriangulationOutcome::default();

    let nn = if is_monocular {
        NUM_NEIGHBORS_MONO
    } else {
        NUM_NEIGHBORS
    };
    let neighbors = map.best_covisibility_keyframes(kf_id, nn);
    if neighbors.is_empty() {
        return outcome;
    }

    let matcher = Matcher::new(0.6, false);
    let ratio_factor = 1.5 * map.pyramid().scale_factor;

    let (pose1, center1) = match map.keyframe(kf_id) {
        Some(kf) => (kf.pose_cw().clone(), kf.camera_center()),
        None => return outcome,
    };

    for (i, &neighbor_id) in neighbors.iter().enumerate() {
        if i > 0 && inbox_waiting() {
            outcome.aborted = true;
            return outcome;
        }
        outcome.pairs_tried += 1;

        let Some(neighbor) = map.keyframe(neighbor_id) else {
            continue;
        };
        let center2 = neighbor.camera_center();
        let baseline = (center2 - center1).norm();

        if !is_monocular {
            if baseline < camera.baseline() {
                continue;
            }
        } else {
            let Some(median_depth) = map.scene_median_depth(neighbor_id, 2) else {
                continue;
            };
            if baseline / median_depth < MIN_BASELINE_DEPTH_RATIO {
                continue;
            }
        }

        let Some(f12) = compute_f12(map, kf_id, neighbor_id, camera) else {
            continue;
        };
        let matches = matcher.search_for_triangulation(map, kf_id, neighbor_id, &f12, camera);
        outcome.matches_found += matches.len();

        let pose2 = map.keyframe(neighbor_id).unwrap().pose_cw().clone();
        let rot1_wc = pose1.rotation.inverse();
        let rot2_wc = pose2.rotation.inverse();

        for (idx1, idx2) in matches {
            let Some(candidate) = evaluate_match(
                map,
                camera,
                kf_id,
                neighbor_id,
                idx1,
                idx2,
                &pose1,
                &pose2,
                &rot1_wc,
                &rot2_wc,
                ratio_factor,
            ) else {
                continue;
            };

            let descriptor = map.keyframe(kf_id).unwrap().descriptors[idx1];
            let mp_id = map.create_map_point(candidate, descriptor, kf_id);
            map.associate(kf_id, idx1, mp_id);
            map.associate(neighbor_id, idx2, mp_id);
            map.compute_distinctive_descriptor(mp_id);
            map.update_normal_and_depth(mp_id);
            recent_points.push_back(mp_id);
            outcome.new_points += 1;
        }
    }

    if outcome.new_points > 0 {
        debug!(
            kf = kf_id.0,
            new_points = outcome.new_points,
            pairs = outcome.pairs_tried,
            matches = outcome.matches_found,
            "triangulated new map points"
        );
    }
    outcome
}

/// Run one match through the whole acceptance ladder; returns the world
/// point on success.
#[allow(clippy::too_many_arguments)]
fn evaluate_match(
    map: &Map,
    camera: &PinholeCamera,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    idx1: usize,
    idx2: usize,
    pose1: &SE3,
    pose2: &SE3,
    rot1_wc: &nalgebra::UnitQuaternion<f64>,
    rot2_wc: &nalgebra::UnitQuaternion<f64>,
    ratio_factor: f64,
) -> Option<Vector3<f64>> {
    let kf1 = map.keyframe(kf1_id)?;
    let kf2 = map.keyframe(kf2_id)?;
    let pyramid = map.pyramid();

    let kp1 = &kf1.keypoints[idx1];
    let kp2 = &kf2.keypoints[idx2];
    let stereo1 = kf1.u_right[idx1].is_some();
    let stereo2 = kf2.u_right[idx2].is_some();

    let xn1 = camera.normalize(kp1.x, kp1.y).push(1.0);
    let xn2 = camera.normalize(kp2.x, kp2.y).push(1.0);
    let ray1 = rot1_wc * xn1;
    let ray2 = rot2_wc * xn2;
    let cos_parallax_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

    // Parallax the stereo depth itself would provide.
    let no_stereo = cos_parallax_rays + 1.0;
    let cos_parallax_stereo1 = if stereo1 {
        let z = kf1.depths[idx1].unwrap_or(f64::INFINITY);
        (2.0 * (camera.baseline() / 2.0).atan2(z)).cos()
    } else {
        no_stereo
    };
    let cos_parallax_stereo2 = if stereo2 {
        let z = kf2.depths[idx2].unwrap_or(f64::INFINITY);
        (2.0 * (camera.baseline() / 2.0).atan2(z)).cos()
    } else {
        no_stereo
    };
    let cos_parallax_stereo = cos_parallax_stereo1.min(cos_parallax_stereo2);

    let x3d: Vector3<f64> = if cos_parallax_rays < cos_parallax_stereo
        && cos_parallax_rays > 0.0
        && (stereo1 || stereo2 || cos_parallax_rays < MAX_COS_PARALLAX_RAYS)
    {
        triangulate_dlt(&xn1, &xn2, pose1, pose2)?
    } else if stereo1 && cos_parallax_stereo1 < cos_parallax_stereo2 {
        kf1.unproject(idx1, camera)?
    } else if stereo2 && cos_parallax_stereo2 < cos_parallax_stereo1 {
        kf2.unproject(idx2, camera)?
    } else {
        // No stereo and too little parallax.
        return None;
    };

    // In front of both cameras.
    let c1 = pose1.transform_point(&x3d);
    if c1.z <= 0.0 {
        return None;
    }
    let c2 = pose2.transform_point(&x3d);
    if c2.z <= 0.0 {
        return None;
    }

    // Reprojection gates, scaled by the octave variance.
    let sigma2_1 = pyramid.sigma2(kp1.octave);
    let uv1 = camera.project(&c1)?;
    let e1 = (uv1.x - kp1.x).powi(2) + (uv1.y - kp1.y).powi(2);
    if stereo1 {
        let ur = camera.right_eye_u(uv1.x, c1.z);
        let er = ur - kf1.u_right[idx1].unwrap();
        if e1 + er * er > MAX_REPROJ_STEREO * sigma2_1 {
            return None;
        }
    } else if e1 > MAX_REPROJ_MONO * sigma2_1 {
        return None;
    }

    let sigma2_2 = pyramid.sigma2(kp2.octave);
    let uv2 = camera.project(&c2)?;
    let e2 = (uv2.x - kp2.x).powi(2) + (uv2.y - kp2.y).powi(2);
    if stereo2 {
        let ur = camera.right_eye_u(uv2.x, c2.z);
        let er = ur - kf2.u_right[idx2].unwrap();
        if e2 + er * er > MAX_REPROJ_STEREO * sigma2_2 {
            return None;
        }
    } else if e2 > MAX_REPROJ_MONO * sigma2_2 {
        return None;
    }

    // Scale consistency between the two observing octaves.
    let dist1 = (x3d - kf1.camera_center()).norm();
    let dist2 = (x3d - kf2.camera_center()).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave = pyramid.scale(kp1.octave) / pyramid.scale(kp2.octave);
    if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
        return None;
    }

    Some(x3d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint, ScalePyramid};
    use crate::map::KeyFrameData;
    use crate::tracking::frame::test_camera;
    use nalgebra::UnitQuaternion;

    fn landmark(i: usize) -> Vector3<f64> {
        let fi = i as f64;
        Vector3::new(
            (fi * 2.399).sin() * 1.2,
            (fi * 1.117).cos() * 0.9,
            4.0 + (fi * 0.731).sin(),
        )
    }

    fn descriptor(i: usize) -> Descriptor {
        let h = (i as u32).wrapping_mul(2654435761);
        let mut d = [0u8; 32];
        for (j, b) in d.iter_mut().enumerate() {
            *b = (h.rotate_left((j as u32 * 7) % 32) & 0xff) as u8;
        }
        Descriptor(d)
    }

    /// Two keyframes with a sideways baseline viewing the same landmarks,
    /// connected in the covisibility graph through a handful of shared
    /// points so triangulation considers the pair.
    fn two_keyframe_map(
        baseline: f64,
        n: usize,
        with_depth: bool,
    ) -> (Map, PinholeCamera, KeyFrameId, KeyFrameId) {
        let camera = test_camera();
        let mut map = Map::new(ScalePyramid::new(8, 1.2));

        let poses = [
            SE3::identity(),
            SE3::new(UnitQuaternion::identity(), Vector3::new(-baseline, 0.0, 0.0)),
        ];
        let mut ids = Vec::new();
        for (k, pose) in poses.iter().enumerate() {
            let mut keypoints = Vec::new();
            let mut descriptors = Vec::new();
            let mut depths = Vec::new();
            let mut u_right = Vec::new();
            for i in 0..n {
                let p = landmark(i);
                let c = pose.transform_point(&p);
                let uv = camera.project(&c).unwrap();
                keypoints.push(Keypoint {
                    x: uv.x,
                    y: uv.y,
                    octave: 0,
                    angle: 0.0,
                });
                descriptors.push(descriptor(i));
                if with_depth {
                    depths.push(Some(c.z));
                    u_right.push(Some(camera.right_eye_u(uv.x, c.z)));
                } else {
                    depths.push(None);
                    u_right.push(None);
                }
            }
            ids.push(map.create_keyframe(KeyFrameData {
                source_frame_id: k as u64,
                timestamp: k as f64,
                pose_cw: pose.clone(),
                keypoints,
                descriptors,
                depths,
                u_right,
            }));
        }

        // Seed covisibility: the first 20 landmarks are already shared map
        // points, the rest are left for triangulation.
        for i in 0..20.min(n) {
            let mp = map.create_map_point(landmark(i), descriptor(i), ids[0]);
            map.associate(ids[0], i, mp);
            map.associate(ids[1], i, mp);
        }
        map.update_connections(ids[0]);
        map.update_connections(ids[1]);

        (map, camera, ids[0], ids[1])
    }

    #[test]
    fn triangulates_unmatched_features_between_neighbors() {
        let (mut map, camera, kf1, _kf2) = two_keyframe_map(0.3, 120, false);
        let before = map.num_map_points();
        let mut recent = VecDeque::new();

        let outcome =
            create_new_map_points(&mut map, kf1, &camera, true, &mut recent, &|| false);
        assert!(!outcome.aborted);
        assert!(outcome.new_points > 50, "created {}", outcome.new_points);
        assert_eq!(map.num_map_points(), before + outcome.new_points);
        assert_eq!(recent.len(), outcome.new_points);
        map.assert_consistent();

        // Triangulated points land on the true landmarks.
        for &mp_id in recent.iter().take(10) {
            let mp = map.map_point(mp_id).unwrap();
            let slot = map
                .keyframe(kf1)
                .unwrap()
                .slot_of(mp_id)
                .expect("new point observed by kf1");
            assert!((mp.position - landmark(slot)).norm() < 1e-6);
        }
    }

    #[test]
    fn short_baseline_creates_nothing() {
        // Monocular gate: baseline / median depth < 0.01.
        let (mut map, camera, kf1, _) = two_keyframe_map(0.01, 120, false);
        let mut recent = VecDeque::new();
        let outcome =
            create_new_map_points(&mut map, kf1, &camera, true, &mut recent, &|| false);
        assert_eq!(outcome.new_points, 0);
        assert!(recent.is_empty());
    }

    #[test]
    fn aborts_when_inbox_fills() {
        let (mut map, camera, kf1, _) = two_keyframe_map(0.3, 120, false);
        // Two neighbors would be needed to observe the early exit; with one
        // neighbor the first pair still runs, so matches are produced, but
        // the abort flag must short-circuit any further neighbor.
        let mut recent = VecDeque::new();
        let outcome = create_new_map_points(&mut map, kf1, &camera, true, &mut recent, &|| true);
        assert_eq!(outcome.pairs_tried, 1);
    }

    #[test]
    fn stereo_baseline_gate_uses_camera_baseline() {
        // Depth-capable pair closer than one stereo baseline: rejected.
        let (mut map, camera, kf1, _) = two_keyframe_map(0.01, 120, true);
        let mut recent = VecDeque::new();
        let outcome =
            create_new_map_points(&mut map, kf1, &camera, false, &mut recent, &|| false);
        assert_eq!(outcome.new_points, 0);
    }

    #[test]
    fn fundamental_matrix_annihilates_correspondences() {
        let (map, camera, kf1, kf2) = two_keyframe_map(0.3, 60, false);
        let f12 = compute_f12(&map, kf1, kf2, &camera).unwrap();
        let kf1_ref = map.keyframe(kf1).unwrap();
        let kf2_ref = map.keyframe(kf2).unwrap();
        for i in 0..60 {
            let kp1 = &kf1_ref.keypoints[i];
            let kp2 = &kf2_ref.keypoints[i];
            let x1 = Vector3::new(kp1.x, kp1.y, 1.0);
            let x2 = Vector3::new(kp2.x, kp2.y, 1.0);
            let residual = (x1.transpose() * f12 * x2)[(0, 0)];
            assert!(residual.abs() < 1e-6, "epipolar residual {residual}");
        }
    }
}
