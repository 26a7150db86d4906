//! Duplicate-landmark fusion across the covisibility neighborhood.
//!
//! The freshly processed keyframe's points are projected into its first-
//! and second-order neighbors, and the neighbors' points back into it.
//! Collisions are resolved through the replacement pointer (see
//! [`crate::map::Map::replace_map_point`]); afterwards descriptors, normals
//! and covisibility edges are refreshed.

use tracing::debug;

use crate::camera::PinholeCamera;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matching::Matcher;

const FIRST_ORDER_NEIGHBORS_MONO: usize = 20;
const FIRST_ORDER_NEIGHBORS: usize = 10;
const SECOND_ORDER_NEIGHBORS: usize = 5;
/// Projection search window multiplier for fusion.
const FUSE_RADIUS: f64 = 3.0;

#[derive(Debug, Default)]
pub struct FusionOutcome {
    pub targets: usize,
    pub fused_forward: usize,
    pub fused_backward: usize,
}

pub fn search_in_neighbors(
    map: &mut Map,
    kf_id: KeyFrameId,
    camera: &PinholeCamera,
    is_monocular: bool,
) -> FusionOutcome {
    let mut outcome = FusionOutcome::default();
    let nn = if is_monocular {
        FIRST_ORDER_NEIGHBORS_MONO
    } else {
        FIRST_ORDER_NEIGHBORS
    };

    // First- and second-order targets, deduplicated with fuse marks.
    let mut targets: Vec<KeyFrameId> = Vec::new();
    let first_order = map.best_covisibility_keyframes(kf_id, nn);
    for &neighbor_id in &first_order {
        let Some(neighbor) = map.keyframe_mut(neighbor_id) else {
            continue;
        };
        if neighbor.bad || neighbor.fuse_target_for == Some(kf_id) {
            continue;
        }
        neighbor.fuse_target_for = Some(kf_id);
        targets.push(neighbor_id);

        for second_id in map.best_covisibility_keyframes(neighbor_id, SECOND_ORDER_NEIGHBORS) {
            if second_id == kf_id {
                continue;
            }
            let Some(second) = map.keyframe_mut(second_id) else {
                continue;
            };
            if second.bad || second.fuse_target_for == Some(kf_id) {
                continue;
            }
            second.fuse_target_for = Some(kf_id);
            targets.push(second_id);
        }
    }
    if targets.is_empty() {
        return outcome;
    }
    outcome.targets = targets.len();

    let matcher = Matcher::default();

    // Forward: project the current keyframe's points into every target.
    let current_points: Vec<MapPointId> = map
        .keyframe(kf_id)
        .map(|kf| {
            kf.map_point_slots()
                .filter_map(|(_, raw)| map.resolve(raw))
                .collect()
        })
        .unwrap_or_default();
    for &target in &targets {
        outcome.fused_forward += matcher.fuse(map, target, &current_points, camera, FUSE_RADIUS);
    }

    // Backward: project the targets' points into the current keyframe,
    // each candidate only once.
    let mut fuse_candidates: Vec<MapPointId> = Vec::new();
    for &target in &targets {
        let target_points: Vec<MapPointId> = map
            .keyframe(target)
            .map(|kf| {
                kf.map_point_slots()
                    .filter_map(|(_, raw)| map.resolve(raw))
                    .collect()
            })
            .unwrap_or_default();
        for mp_id in target_points {
            let Some(mp) = map.map_point_mut(mp_id) else {
                continue;
            };
            if mp.bad || mp.fuse_candidate_for == Some(kf_id) {
                continue;
            }
            mp.fuse_candidate_for = Some(kf_id);
            fuse_candidates.push(mp_id);
        }
    }
    outcome.fused_backward += matcher.fuse(map, kf_id, &fuse_candidates, camera, FUSE_RADIUS);

    // Refresh the statistics of everything the current keyframe now sees.
    let refreshed: Vec<MapPointId> = map
        .keyframe(kf_id)
        .map(|kf| {
            kf.map_point_slots()
                .filter_map(|(_, raw)| map.resolve(raw))
                .collect()
        })
        .unwrap_or_default();
    for mp_id in refreshed {
        map.compute_distinctive_descriptor(mp_id);
        map.update_normal_and_depth(mp_id);
    }
    map.update_connections(kf_id);

    debug!(
        kf = kf_id.0,
        targets = outcome.targets,
        forward = outcome.fused_forward,
        backward = outcome.fused_backward,
        "neighborhood fusion"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::test_camera;
    use nalgebra::{UnitQuaternion, Vector3};

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

    fn keyframe_seeing_all(map: &mut Map, idx: u64, tx: f64, n: usize) -> KeyFrameId {
        let camera = test_camera();
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(tx, 0.0, 0.0));
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for i in 0..n {
            let uv = camera.project(&pose.transform_point(&landmark(i))).unwrap();
            keypoints.push(Keypoint {
                x: uv.x,
                y: uv.y,
                octave: 0,
                angle: 0.0,
            });
            descriptors.push(descriptor(i));
        }
        map.create_keyframe(KeyFrameData {
            source_frame_id: idx,
            timestamp: idx as f64,
            pose_cw: pose,
            keypoints,
            descriptors,
            depths: vec![None; n],
            u_right: vec![None; n],
        })
    }

    /// Duplicate landmarks: the current keyframe observes its own copies of
    /// points the neighbor already has; fusion must merge them through the
    /// replacement pointer.
    #[test]
    fn fuses_duplicate_points_with_neighbors() {
        let mut map = Map::new(ScalePyramid::new(8, 1.2));
        let camera = test_camera();
        let n = 60;
        let kf_a = keyframe_seeing_all(&mut map, 0, 0.0, n);
        let kf_b = keyframe_seeing_all(&mut map, 1, -0.2, n);

        // Shared covisibility backbone on the first 20 slots.
        for i in 0..20 {
            let mp = map.create_map_point(landmark(i), descriptor(i), kf_a);
            map.associate(kf_a, i, mp);
            map.associate(kf_b, i, mp);
        }
        // kf_b holds lone duplicates of landmarks 20..40 at slightly
        // perturbed positions; kf_a observes its own copies.
        let mut dup_a = Vec::new();
        let mut dup_b = Vec::new();
        for i in 20..40 {
            let a = map.create_map_point(landmark(i), descriptor(i), kf_a);
            map.associate(kf_a, i, a);
            dup_a.push(a);
            let b = map.create_map_point(
                landmark(i) + Vector3::new(1e-4, 0.0, 0.0),
                descriptor(i),
                kf_b,
            );
            map.associate(kf_b, i, b);
            dup_b.push(b);
        }
        for id in dup_a.iter().chain(dup_b.iter()) {
            map.update_normal_and_depth(*id);
        }
        map.update_connections(kf_a);
        map.update_connections(kf_b);

        let outcome = search_in_neighbors(&mut map, kf_a, &camera, true);
        assert!(outcome.targets >= 1);
        assert!(
            outcome.fused_forward + outcome.fused_backward >= 20,
            "fused {} + {}",
            outcome.fused_forward,
            outcome.fused_backward
        );

        // Every duplicate pair collapsed into a single landmark observed by
        // both keyframes.
        for (a, b) in dup_a.iter().zip(dup_b.iter()) {
            let ra = map.resolve(*a);
            let rb = map.resolve(*b);
            assert!(ra.is_some() || rb.is_some());
            if let (Some(ra), Some(rb)) = (ra, rb) {
                assert_eq!(ra, rb, "duplicates must merge");
                let survivor = map.map_point(ra).unwrap();
                assert!(survivor.is_observed_by(kf_a));
                assert!(survivor.is_observed_by(kf_b));
            }
        }
        map.assert_consistent();
    }

    /// Applying the pass twice converges: the second run has nothing left
    /// to merge.
    #[test]
    fn fusion_is_idempotent() {
        let mut map = Map::new(ScalePyramid::new(8, 1.2));
        let camera = test_camera();
        let n = 50;
        let kf_a = keyframe_seeing_all(&mut map, 0, 0.0, n);
        let kf_b = keyframe_seeing_all(&mut map, 1, -0.2, n);
        for i in 0..20 {
            let mp = map.create_map_point(landmark(i), descriptor(i), kf_a);
            map.associate(kf_a, i, mp);
            map.associate(kf_b, i, mp);
        }
        for i in 20..40 {
            let b = map.create_map_point(landmark(i), descriptor(i), kf_b);
            map.associate(kf_b, i, b);
            map.update_normal_and_depth(b);
        }
        map.update_connections(kf_a);
        map.update_connections(kf_b);

        let first = search_in_neighbors(&mut map, kf_a, &camera, true);
        assert!(first.fused_backward > 0);
        let second = search_in_neighbors(&mut map, kf_a, &camera, true);
        assert_eq!(second.fused_forward + second.fused_backward, 0);
        map.assert_consistent();
    }
}
