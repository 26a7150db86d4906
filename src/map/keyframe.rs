//! KeyFrame: a promoted frame participating in the map graph.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::camera::PinholeCamera;
use crate::features::{Descriptor, Keypoint};
use crate::geometry::SE3;

use super::types::{KeyFrameId, MapPointId};

/// The geometric payload a frame carries into keyframe promotion.
#[derive(Clone)]
pub struct KeyFrameData {
    pub source_frame_id: u64,
    pub timestamp: f64,
    /// World → camera transform.
    pub pose_cw: SE3,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// Metric depth per keypoint (`None` when unavailable).
    pub depths: Vec<Option<f64>>,
    /// Virtual right-eye column per keypoint (`None` when unavailable).
    pub u_right: Vec<Option<f64>>,
}

/// A persistent node of the map graph.
///
/// The bad flag is logical deletion: edges stay readable until the owner
/// physically compacts the map, and every reader checks badness first.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    pub source_frame_id: u64,
    pub timestamp: f64,

    pose_cw: SE3,
    camera_center: Vector3<f64>,

    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    pub depths: Vec<Option<f64>>,
    pub u_right: Vec<Option<f64>>,

    /// Keypoint slot → associated map point.
    map_points: Vec<Option<MapPointId>>,

    /// Covisibility adjacency: neighbor → number of shared map points.
    covisibility: HashMap<KeyFrameId, usize>,
    /// Cached neighbor list ordered by weight, rebuilt lazily.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    pub bad: bool,

    /// Fuse-target mark used by the neighborhood fusion pass.
    pub fuse_target_for: Option<KeyFrameId>,
}

impl KeyFrame {
    pub fn new(id: KeyFrameId, data: KeyFrameData) -> Self {
        let n = data.keypoints.len();
        let camera_center = data.pose_cw.inverse().translation;
        Self {
            id,
            source_frame_id: data.source_frame_id,
            timestamp: data.timestamp,
            pose_cw: data.pose_cw,
            camera_center,
            keypoints: data.keypoints,
            descriptors: data.descriptors,
            depths: data.depths,
            u_right: data.u_right,
            map_points: vec![None; n],
            covisibility: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            bad: false,
            fuse_target_for: None,
        }
    }

    // ── Pose ────────────────────────────────────────────────────────────

    pub fn pose_cw(&self) -> &SE3 {
        &self.pose_cw
    }

    pub fn set_pose_cw(&mut self, pose_cw: SE3) {
        self.camera_center = pose_cw.inverse().translation;
        self.pose_cw = pose_cw;
    }

    pub fn pose_wc(&self) -> SE3 {
        self.pose_cw.inverse()
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.camera_center
    }

    // ── Map point slots ─────────────────────────────────────────────────

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn map_point(&self, slot: usize) -> Option<MapPointId> {
        self.map_points.get(slot).copied().flatten()
    }

    pub fn set_map_point(&mut self, slot: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if slot >= self.map_points.len() {
            return None;
        }
        self.map_points[slot].replace(mp_id)
    }

    pub fn erase_map_point(&mut self, slot: usize) -> Option<MapPointId> {
        self.map_points.get_mut(slot).and_then(|s| s.take())
    }

    /// All occupied slots as (slot, map point) pairs.
    pub fn map_point_slots(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_points
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.iter().filter(|mp| mp.is_some()).count()
    }

    /// Slot the given map point occupies, if any.
    pub fn slot_of(&self, mp_id: MapPointId) -> Option<usize> {
        self.map_points
            .iter()
            .position(|slot| *slot == Some(mp_id))
    }

    // ── Covisibility ────────────────────────────────────────────────────

    pub fn set_covisibility_weight(&mut self, other: KeyFrameId, weight: usize) {
        if other == self.id {
            return;
        }
        self.covisibility.insert(other, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, other: KeyFrameId) {
        if self.covisibility.remove(&other).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn replace_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility = weights;
        self.covisibility.remove(&self.id);
        self.covisibility_dirty = true;
    }

    pub fn covisibility_weight(&self, other: KeyFrameId) -> usize {
        self.covisibility.get(&other).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility
    }

    /// The `n` covisible keyframes sharing the most map points.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// All covisible keyframes ordered by weight descending.
    pub fn ordered_covisibles(&mut self) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles.iter().map(|(id, _)| *id).collect()
    }

    /// Covisibles with at least `min_weight` shared observations, read-only
    /// (sorts on the fly, usable under a shared borrow).
    pub fn covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        let mut entries: Vec<(KeyFrameId, usize)> = self
            .covisibility
            .iter()
            .filter(|(_, &w)| w >= min_weight)
            .map(|(&id, &w)| (id, w))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.into_iter().map(|(id, _)| id).collect()
    }

    fn ensure_ordered(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self.covisibility.iter().map(|(&id, &w)| (id, w)).collect();
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ── Spatial queries ─────────────────────────────────────────────────

    /// Keypoint slots within `radius` of `(u, v)`, optionally restricted to
    /// an octave band.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        let mut out = Vec::new();
        for (i, kp) in self.keypoints.iter().enumerate() {
            if let Some(min) = min_level {
                if kp.octave < min {
                    continue;
                }
            }
            if let Some(max) = max_level {
                if kp.octave > max {
                    continue;
                }
            }
            let du = kp.x - u;
            let dv = kp.y - v;
            if du * du + dv * dv <= radius_sq {
                out.push(i);
            }
        }
        out
    }

    /// Back-project keypoint `slot` into world coordinates using its stored
    /// depth.
    pub fn unproject(&self, slot: usize, camera: &PinholeCamera) -> Option<Vector3<f64>> {
        let z = self.depths.get(slot).copied().flatten()?;
        if z <= 0.0 {
            return None;
        }
        let kp = self.keypoints.get(slot)?;
        let p_cam = camera.unproject(kp.x, kp.y, z);
        Some(self.pose_wc().transform_point(&p_cam))
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("features", &self.num_features())
            .field("map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility.len())
            .field("bad", &self.bad)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_keyframe_data(n: usize) -> KeyFrameData {
    let keypoints = (0..n)
        .map(|i| Keypoint {
            x: 10.0 * i as f64,
            y: 5.0 * i as f64,
            octave: i % 3,
            angle: 0.0,
        })
        .collect();
    KeyFrameData {
        source_frame_id: 0,
        timestamp: 0.0,
        pose_cw: SE3::identity(),
        keypoints,
        descriptors: vec![Descriptor::zeros(); n],
        depths: vec![None; n],
        u_right: vec![None; n],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_association() {
        let mut kf = KeyFrame::new(KeyFrameId(1), test_keyframe_data(10));

        assert_eq!(kf.set_map_point(3, MapPointId(100)), None);
        assert_eq!(kf.map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId(200));
        assert_eq!(prev, Some(MapPointId(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId(200)));
        assert_eq!(kf.map_point(3), None);
    }

    #[test]
    fn covisibility_ordering() {
        let mut kf = KeyFrame::new(KeyFrameId(1), test_keyframe_data(0));
        kf.set_covisibility_weight(KeyFrameId(2), 50);
        kf.set_covisibility_weight(KeyFrameId(3), 100);
        kf.set_covisibility_weight(KeyFrameId(4), 25);
        kf.set_covisibility_weight(KeyFrameId(1), 999); // self edge ignored

        assert_eq!(
            kf.best_covisibles(2),
            vec![KeyFrameId(3), KeyFrameId(2)]
        );
        assert_eq!(
            kf.covisibles_above_weight(30),
            vec![KeyFrameId(3), KeyFrameId(2)]
        );
        assert_eq!(kf.covisibility_weight(KeyFrameId(1)), 0);
    }

    #[test]
    fn features_in_area_filters_by_octave() {
        let kf = KeyFrame::new(KeyFrameId(0), test_keyframe_data(6));
        // Keypoints at (0,0), (10,5), (20,10)… with octaves 0,1,2,0,1,2.
        let near = kf.features_in_area(0.0, 0.0, 12.0, None, None);
        assert_eq!(near, vec![0, 1]);
        let level0 = kf.features_in_area(0.0, 0.0, 12.0, Some(1), Some(1));
        assert_eq!(level0, vec![1]);
    }

    #[test]
    fn pose_setter_refreshes_camera_center() {
        let mut kf = KeyFrame::new(KeyFrameId(0), test_keyframe_data(0));
        assert_eq!(kf.camera_center(), Vector3::zeros());

        // T_cw with translation t has center -R⁻¹ t.
        kf.set_pose_cw(SE3::new(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(0.0, 0.0, -4.0),
        ));
        assert!((kf.camera_center() - Vector3::new(0.0, 0.0, 4.0)).norm() < 1e-12);
    }
}
