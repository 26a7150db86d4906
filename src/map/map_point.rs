//! MapPoint: a 3D landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A sparse 3D landmark.
///
/// Observations map observing keyframes to the keypoint slot they see this
/// point at; the same edge is mirrored on the keyframe side. A fused point
/// is never deleted in place: it keeps its `replaced_by` pointer and readers
/// resolve the chain lazily through [`super::Map::resolve`].
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Representative descriptor: the observer descriptor with the smallest
    /// median Hamming distance to all the others.
    pub descriptor: Descriptor,

    /// keyframe → keypoint slot.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance bounds.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point fell inside a tracked frame's frustum.
    pub visible_count: u32,
    /// Times the point was actually matched in a tracked frame.
    pub found_count: u32,

    /// Oldest observing keyframe; invariant: no observer has a smaller id.
    pub first_kf_id: KeyFrameId,

    pub bad: bool,

    /// Set when this point was fused into another one.
    pub replaced_by: Option<MapPointId>,

    /// Fuse-candidate mark to avoid re-testing a point twice per keyframe
    /// during the neighborhood fusion pass.
    pub fuse_candidate_for: Option<KeyFrameId>,

    /// Last tracked frame this point was matched in (avoids double counting
    /// between the motion-model search and the local-map search).
    pub last_frame_seen: u64,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            bad: false,
            replaced_by: None,
            fuse_candidate_for: None,
            last_frame_seen: 0,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, slot: usize) {
        self.observations.insert(kf_id, slot);
    }

    /// Returns true when the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// found / visible; new points start at 1/1.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("found_ratio", &self.found_ratio())
            .field("bad", &self.bad)
            .field("replaced_by", &self.replaced_by)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> MapPoint {
        MapPoint::new(
            MapPointId(0),
            Vector3::new(0.0, 0.0, 5.0),
            Descriptor::zeros(),
            KeyFrameId(0),
        )
    }

    #[test]
    fn observation_bookkeeping() {
        let mut mp = point();
        mp.add_observation(KeyFrameId(0), 3);
        mp.add_observation(KeyFrameId(1), 8);
        assert_eq!(mp.num_observations(), 2);
        assert!(mp.is_observed_by(KeyFrameId(1)));

        assert!(mp.erase_observation(KeyFrameId(0)));
        assert!(!mp.erase_observation(KeyFrameId(0)));
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn found_ratio_defaults_high_for_new_points() {
        let mut mp = point();
        assert!((mp.found_ratio() - 1.0).abs() < 1e-12);

        mp.increase_visible(9);
        mp.increase_found(1);
        assert!((mp.found_ratio() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn distance_range_has_scale_margin() {
        let mut mp = point();
        mp.min_distance = 1.0;
        mp.max_distance = 10.0;
        assert!(mp.is_in_distance_range(0.9));
        assert!(mp.is_in_distance_range(11.0));
        assert!(!mp.is_in_distance_range(0.5));
        assert!(!mp.is_in_distance_range(20.0));
    }
}
