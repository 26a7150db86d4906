//! The shared map: keyframe and map-point arenas plus graph maintenance.
//!
//! Entities reference each other through stable ids. Deletion is logical
//! (bad flags); arena entries survive until [`Map::clear`] so concurrent
//! readers holding ids never dangle. Callers are expected to hold the map
//! lock owned by the system's shared state; the container itself is
//! single-threaded.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::features::{Descriptor, ScalePyramid};

use super::keyframe::{KeyFrame, KeyFrameData};
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Minimum shared observations for a covisibility edge.
const COVISIBILITY_THRESHOLD: usize = 15;

/// Observers a point may drop to before it is considered untracked and
/// marked bad on the next erase.
const MIN_SURVIVING_OBSERVATIONS: usize = 2;

pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    next_kf_id: u64,
    next_mp_id: u64,
    pyramid: ScalePyramid,
    origin: Option<KeyFrameId>,
    /// Local map points of the most recent tracking iteration, kept for
    /// visualization readers.
    reference_map_points: Vec<MapPointId>,
}

impl Map {
    pub fn new(pyramid: ScalePyramid) -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            pyramid,
            origin: None,
            reference_map_points: Vec::new(),
        }
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    /// The first keyframe (id 0). Never culled.
    pub fn origin(&self) -> Option<KeyFrameId> {
        self.origin
    }

    // ── KeyFrames ───────────────────────────────────────────────────────

    pub fn create_keyframe(&mut self, data: KeyFrameData) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes.insert(id, KeyFrame::new(id, data));
        if self.origin.is_none() {
            self.origin = Some(id);
        }
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.keyframes.keys().copied()
    }

    /// Number of non-bad keyframes.
    pub fn num_keyframes(&self) -> usize {
        self.keyframes.values().filter(|kf| !kf.bad).count()
    }

    // ── MapPoints ───────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    /// Number of non-bad map points.
    pub fn num_map_points(&self) -> usize {
        self.map_points.values().filter(|mp| !mp.bad).count()
    }

    /// Follow the replacement chain of a point; `None` for bad or unknown
    /// points. Every read site resolves before dereferencing.
    pub fn resolve(&self, id: MapPointId) -> Option<MapPointId> {
        let mut current = id;
        loop {
            let mp = self.map_points.get(&current)?;
            match mp.replaced_by {
                Some(next) => current = next,
                None => return if mp.bad { None } else { Some(current) },
            }
        }
    }

    pub fn set_reference_map_points(&mut self, points: Vec<MapPointId>) {
        self.reference_map_points = points;
    }

    pub fn reference_map_points(&self) -> &[MapPointId] {
        &self.reference_map_points
    }

    // ── Observation edges ───────────────────────────────────────────────

    /// Create the bidirectional observation edge (keyframe slot ↔ point).
    /// Covisibility is refreshed separately by [`Map::update_connections`].
    pub fn associate(&mut self, kf_id: KeyFrameId, slot: usize, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return false;
        };
        debug_assert!(!mp.bad, "bad map points must not gain observations");
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        mp.add_observation(kf_id, slot);
        // An observation edge never points back before the point's first
        // keyframe.
        mp.first_kf_id = mp.first_kf_id.min(kf_id);
        kf.set_map_point(slot, mp_id);
        true
    }

    /// Remove a keyframe's observation of a point; the point goes bad when
    /// it can no longer be triangulated.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId, mp_id: MapPointId) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            if let Some(slot) = kf.slot_of(mp_id) {
                kf.erase_map_point(slot);
            }
        }
        let remaining = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.num_observations()
            }
            None => return,
        };
        if remaining < MIN_SURVIVING_OBSERVATIONS {
            self.set_bad_map_point(mp_id);
        }
    }

    /// Logical deletion: clears the point's edges everywhere and flags it.
    pub fn set_bad_map_point(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.bad = true;
                mp.observations.drain().collect()
            }
            None => return,
        };
        for (kf_id, slot) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.map_point(slot) == Some(mp_id) {
                    kf.erase_map_point(slot);
                }
            }
        }
    }

    /// Physically drop a point that never gained an observer (the tracker's
    /// short-lived motion-model points). No-op once anything references it.
    pub fn discard_unobserved(&mut self, mp_id: MapPointId) {
        if let Some(mp) = self.map_points.get(&mp_id) {
            if mp.observations.is_empty() && mp.replaced_by.is_none() {
                self.map_points.remove(&mp_id);
            }
        }
    }

    /// Fuse `old` into `new`: transfer observations, counters, and leave the
    /// replacement pointer behind for lazy readers.
    pub fn replace_map_point(&mut self, old_id: MapPointId, new_id: MapPointId) {
        if old_id == new_id {
            return;
        }
        let (observations, visible, found, old_first) = match self.map_points.get_mut(&old_id) {
            Some(old) => {
                old.bad = true;
                old.replaced_by = Some(new_id);
                (
                    old.observations.drain().collect::<Vec<_>>(),
                    old.visible_count,
                    old.found_count,
                    old.first_kf_id,
                )
            }
            None => return,
        };

        for (kf_id, slot) in observations {
            let already_observed = self
                .map_points
                .get(&new_id)
                .map_or(true, |new| new.is_observed_by(kf_id));
            if already_observed {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    if kf.map_point(slot) == Some(old_id) {
                        kf.erase_map_point(slot);
                    }
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(slot, new_id);
                }
                if let Some(new) = self.map_points.get_mut(&new_id) {
                    new.add_observation(kf_id, slot);
                }
            }
        }

        if let Some(new) = self.map_points.get_mut(&new_id) {
            new.increase_visible(visible);
            new.increase_found(found);
            new.first_kf_id = new.first_kf_id.min(old_first);
        }
        self.compute_distinctive_descriptor(new_id);
    }

    // ── Covisibility maintenance ────────────────────────────────────────

    /// Recompute `kf`'s covisibility edges from shared observations and
    /// mirror them on the neighbors. Edges need at least
    /// `COVISIBILITY_THRESHOLD` shared points; if nothing qualifies the
    /// single best neighbor is linked so the graph stays connected.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let mut counters: HashMap<KeyFrameId, usize> = HashMap::new();
        {
            let Some(kf) = self.keyframes.get(&kf_id) else {
                return;
            };
            for (_, mp_id) in kf.map_point_slots() {
                if let Some(mp) = self.map_points.get(&mp_id) {
                    if mp.bad {
                        continue;
                    }
                    for (&other, _) in &mp.observations {
                        if other != kf_id {
                            *counters.entry(other).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        let mut edges: HashMap<KeyFrameId, usize> = counters
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(&id, &w)| (id, w))
            .collect();
        if edges.is_empty() {
            let best = counters
                .iter()
                .map(|(&id, &w)| (id, w))
                .max_by_key(|&(id, w)| (w, id));
            if let Some((best_id, best_w)) = best {
                edges.insert(best_id, best_w);
            }
        }

        for (&other, &weight) in &edges {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility_weight(kf_id, weight);
            }
        }

        // Drop mirror edges on former neighbors that no longer qualify.
        let stale: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| {
                kf.covisibility_weights()
                    .keys()
                    .filter(|id| !edges.contains_key(id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for other in stale {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.replace_covisibility(edges);
        }
    }

    /// Top-`n` covisibility neighbors of a keyframe, best first, skipping
    /// bad ones.
    pub fn best_covisibility_keyframes(&mut self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        let ordered = match self.keyframes.get_mut(&kf_id) {
            Some(kf) => kf.ordered_covisibles(),
            None => return Vec::new(),
        };
        ordered
            .into_iter()
            .filter(|id| self.keyframes.get(id).map_or(false, |kf| !kf.bad))
            .take(n)
            .collect()
    }

    // ── Keyframe removal ────────────────────────────────────────────────

    /// Logical deletion of a redundant keyframe: its observations and
    /// covisibility edges are withdrawn, the arena entry stays. The origin
    /// keyframe is never erased.
    pub fn set_bad_keyframe(&mut self, kf_id: KeyFrameId) {
        if Some(kf_id) == self.origin {
            debug_assert!(false, "attempted to erase the origin keyframe");
            return;
        }
        let (slots, neighbors) = match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                if kf.bad {
                    return;
                }
                kf.bad = true;
                (
                    kf.map_point_slots().collect::<Vec<_>>(),
                    kf.covisibility_weights().keys().copied().collect::<Vec<_>>(),
                )
            }
            None => return,
        };

        for (_, mp_id) in slots {
            self.erase_observation(kf_id, mp_id);
        }
        for other in neighbors {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        debug!(kf = kf_id.0, "keyframe marked bad");
    }

    // ── Point statistics ────────────────────────────────────────────────

    /// Refresh a point's mean viewing direction and scale-invariant distance
    /// bounds from its current observers.
    pub fn update_normal_and_depth(&mut self, mp_id: MapPointId) {
        let (position, observers, reference) = match self.map_points.get(&mp_id) {
            Some(mp) if !mp.bad => {
                let obs: Vec<(KeyFrameId, usize)> =
                    mp.observations.iter().map(|(&k, &s)| (k, s)).collect();
                if obs.is_empty() {
                    return;
                }
                let reference = obs
                    .iter()
                    .copied()
                    .find(|(k, _)| *k == mp.first_kf_id)
                    .unwrap_or(obs[0]);
                (mp.position, obs, reference)
            }
            _ => return,
        };

        let mut normal_sum = Vector3::zeros();
        let mut n = 0u32;
        for (kf_id, _) in &observers {
            if let Some(kf) = self.keyframes.get(kf_id) {
                let dir = position - kf.camera_center();
                let norm = dir.norm();
                if norm > 1e-10 {
                    normal_sum += dir / norm;
                    n += 1;
                }
            }
        }

        let (ref_kf_id, ref_slot) = reference;
        let Some(ref_kf) = self.keyframes.get(&ref_kf_id) else {
            return;
        };
        let dist = (position - ref_kf.camera_center()).norm();
        let level = ref_kf.keypoints.get(ref_slot).map_or(0, |kp| kp.octave);
        let (min_d, max_d) = self.pyramid.distance_bounds(dist, level);

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if n > 0 {
                mp.normal = normal_sum / n as f64;
            }
            mp.min_distance = min_d;
            mp.max_distance = max_d;
        }
    }

    /// Re-elect the representative descriptor: the observer descriptor with
    /// the least median distance to all the others.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<Descriptor> = match self.map_points.get(&mp_id) {
            Some(mp) if !mp.bad => mp
                .observations
                .iter()
                .filter_map(|(kf_id, &slot)| {
                    self.keyframes
                        .get(kf_id)
                        .filter(|kf| !kf.bad)
                        .and_then(|kf| kf.descriptors.get(slot))
                        .copied()
                })
                .collect(),
            _ => return,
        };
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptors[i].distance(&descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best_idx];
        }
    }

    /// Depth quantile of the keyframe's associated points in its own camera
    /// frame; `q` divides the sorted list (q = 2 → median).
    pub fn scene_median_depth(&self, kf_id: KeyFrameId, q: usize) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let pose_cw = kf.pose_cw();
        let mut depths: Vec<f64> = kf
            .map_point_slots()
            .filter_map(|(_, mp_id)| {
                let mp = self.map_points.get(&mp_id)?;
                if mp.bad {
                    return None;
                }
                let z = pose_cw.transform_point(&mp.position).z;
                (z > 0.0).then_some(z)
            })
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(depths[(depths.len() - 1) / q.max(1)])
    }

    /// Count the keyframe's tracked points with at least `min_obs`
    /// observations.
    pub fn tracked_points_in_keyframe(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.map_point_slots()
            .filter(|(_, mp_id)| {
                self.map_points
                    .get(mp_id)
                    .map_or(false, |mp| !mp.bad && mp.num_observations() >= min_obs)
            })
            .count()
    }

    /// Drop everything (system reset). Physical compaction happens only
    /// here, when no other thread holds entity ids.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.reference_map_points.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.origin = None;
    }

    /// Check the bidirectional-edge invariants; used by tests and debug
    /// builds after mutation batches.
    pub fn assert_consistent(&self) {
        for mp in self.map_points.values() {
            if mp.bad {
                continue;
            }
            for (&kf_id, &slot) in &mp.observations {
                let kf = self.keyframes.get(&kf_id).expect("observer must exist");
                if !kf.bad {
                    assert_eq!(
                        kf.map_point(slot),
                        Some(mp.id),
                        "{} observation in {} slot {} is not mirrored",
                        mp.id,
                        kf_id,
                        slot
                    );
                }
                assert!(
                    mp.first_kf_id <= kf_id,
                    "{} first keyframe must be its oldest observer",
                    mp.id
                );
            }
        }
        for kf in self.keyframes.values() {
            if kf.bad {
                continue;
            }
            for (slot, mp_id) in kf.map_point_slots() {
                let mp = self.map_points.get(&mp_id).expect("slot target must exist");
                assert!(
                    mp.bad || mp.observations.get(&kf.id) == Some(&slot),
                    "{} slot {} points at {} which does not observe it",
                    kf.id,
                    slot,
                    mp_id
                );
            }
        }
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes.len())
            .field("map_points", &self.map_points.len())
            .finish()
    }
}
