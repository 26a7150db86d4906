//! The local-mapping back end.
//!
//! A long-running consumer of the keyframe inbox. Each accepted keyframe
//! goes through: observation registration, recent-point culling, new-point
//! triangulation, neighborhood fusion, local BA and keyframe culling, then
//! is handed to the loop closer. The pause/reset/finish protocol lives in
//! [`SharedState`]; the tracker throttles itself on the accept flag.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::camera::PinholeCamera;
use crate::config::SensorKind;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::optimizer::{apply_local_ba, collect_local_ba, solve_local_ba, LocalBaConfig};
use crate::system::messages::NewKeyFrame;
use crate::system::shared_state::SharedState;

use super::search_in_neighbors::search_in_neighbors;
use super::triangulation::create_new_map_points;

/// Idle poll period; also bounds how quickly stop/finish are observed.
const RECV_TIMEOUT: Duration = Duration::from_millis(3);

/// Minimum found-ratio before a recent point is culled.
const MIN_FOUND_RATIO: f64 = 0.25;
/// Keyframes a recent point may age before the observation quota applies.
const CULL_AGE_OBSERVATIONS: u64 = 2;
/// Age at which a surviving recent point graduates out of the FIFO.
const CULL_AGE_GRADUATE: u64 = 3;
/// Redundancy: observers at equal-or-finer scale needed per point.
const REDUNDANT_OBSERVERS: usize = 3;
/// Share of redundant points that condemns a keyframe.
const REDUNDANCY_RATIO: f64 = 0.9;

pub struct LocalMapper {
    camera: PinholeCamera,
    sensor: SensorKind,
    shared: Arc<SharedState>,
    /// Keyframe handoff to the loop closer.
    lc_sender: Option<Sender<KeyFrameId>>,
    /// Recently created map points awaiting their culling verdict.
    recent_points: VecDeque<MapPointId>,
}

impl LocalMapper {
    pub fn new(
        camera: PinholeCamera,
        sensor: SensorKind,
        shared: Arc<SharedState>,
        lc_sender: Option<Sender<KeyFrameId>>,
    ) -> Self {
        Self {
            camera,
            sensor,
            shared,
            lc_sender,
            recent_points: VecDeque::new(),
        }
    }

    /// Main loop; returns when finish is requested or the inbox closes.
    pub fn run(&mut self, inbox: Receiver<NewKeyFrame>) {
        let shared = Arc::clone(&self.shared);
        info!("local mapper running");

        loop {
            // Tracking sees that this thread is busy while a keyframe is in
            // flight.
            shared.set_accept_keyframes(false);

            match inbox.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    self.process_keyframe(msg.keyframe_id, &inbox);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shared.try_enter_stop() {
                        debug!("local mapper paused");
                        shared.wait_while_stopped();
                        debug!("local mapper resumed");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }

            shared.reset_if_requested(|| {
                while inbox.try_recv().is_ok() {}
                self.recent_points.clear();
                debug!("local mapper reset");
            });

            shared.set_accept_keyframes(true);

            if shared.finish_requested() {
                break;
            }
        }

        shared.set_finished();
        info!("local mapper finished");
    }

    /// One pipeline iteration for a popped keyframe.
    fn process_keyframe(&mut self, kf_id: KeyFrameId, inbox: &Receiver<NewKeyFrame>) {
        let shared = Arc::clone(&self.shared);

        {
            let mut map = shared.map.write();
            self.process_new_keyframe(&mut map, kf_id);
            self.cull_recent_points(&mut map, kf_id);
            create_new_map_points(
                &mut map,
                kf_id,
                &self.camera,
                self.sensor.is_monocular(),
                &mut self.recent_points,
                &|| !inbox.is_empty(),
            );

            if inbox.is_empty() {
                search_in_neighbors(&mut map, kf_id, &self.camera, self.sensor.is_monocular());
            }
        }

        shared.clear_abort_ba();

        if inbox.is_empty() && !shared.stop_requested() {
            let run_ba = shared.map.read().num_keyframes() > 2;
            if run_ba {
                self.local_bundle_adjustment(kf_id);
            }
            let mut map = shared.map.write();
            self.cull_keyframes(&mut map, kf_id);
        }

        if let Some(sender) = &self.lc_sender {
            let _ = sender.try_send(kf_id);
        }
    }

    /// Register the tracked-match observations the tracker recorded as
    /// slots, refresh point statistics, and wire the keyframe into the
    /// covisibility graph. Points the tracker itself created (depth seeding)
    /// already observe the keyframe and instead enter the culling FIFO.
    fn process_new_keyframe(&mut self, map: &mut Map, kf_id: KeyFrameId) {
        let slots: Vec<(usize, MapPointId)> = match map.keyframe(kf_id) {
            Some(kf) => kf.map_point_slots().collect(),
            None => return,
        };

        for (slot, raw_id) in slots {
            let Some(mp_id) = map.resolve(raw_id) else {
                if let Some(kf) = map.keyframe_mut(kf_id) {
                    kf.erase_map_point(slot);
                }
                continue;
            };
            let observed = map
                .map_point(mp_id)
                .map_or(false, |mp| mp.is_observed_by(kf_id));
            if !observed {
                map.associate(kf_id, slot, mp_id);
                map.update_normal_and_depth(mp_id);
                map.compute_distinctive_descriptor(mp_id);
            } else {
                // A point born in the tracker; it must prove itself.
                self.recent_points.push_back(mp_id);
            }
        }

        map.update_connections(kf_id);
        debug!(kf = kf_id.0, "keyframe integrated");
    }

    /// Walk the recent-point FIFO and apply the culling policy.
    fn cull_recent_points(&mut self, map: &mut Map, current_kf: KeyFrameId) {
        let th_obs = if self.sensor.is_monocular() { 2 } else { 3 };
        let current = current_kf.0;
        let mut kept = VecDeque::with_capacity(self.recent_points.len());
        let mut culled = 0usize;

        for mp_id in self.recent_points.drain(..) {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.bad {
                continue;
            }
            let age = current.saturating_sub(mp.first_kf_id.0);
            if mp.found_ratio() < MIN_FOUND_RATIO {
                map.set_bad_map_point(mp_id);
                culled += 1;
            } else if age >= CULL_AGE_OBSERVATIONS && mp.num_observations() <= th_obs {
                map.set_bad_map_point(mp_id);
                culled += 1;
            } else if age >= CULL_AGE_GRADUATE {
                // Survived probation; it stays in the map unchecked.
            } else {
                kept.push_back(mp_id);
            }
        }
        self.recent_points = kept;

        if culled > 0 {
            debug!(kf = current, culled, "recent map points culled");
        }
    }

    fn local_bundle_adjustment(&self, kf_id: KeyFrameId) {
        let shared = &self.shared;
        let config = LocalBaConfig::default();

        let problem = {
            let map = shared.map.read();
            collect_local_ba(&map, kf_id, &config)
        };
        let Some(problem) = problem else { return };

        let should_abort = || shared.should_abort_ba();
        let Some(result) = solve_local_ba(&problem, &self.camera, &config, &should_abort) else {
            return;
        };

        if result.iterations > 0 {
            // The map-update lock keeps snapshot readers (trajectory export)
            // from interleaving with the write-back.
            let _epoch = shared.map_update.lock();
            let mut map = shared.map.write();
            apply_local_ba(&mut map, &result);
        }
    }

    /// Mark covisible keyframes redundant when ≥ 90 % of their (close, for
    /// depth sensors) points are seen by at least three other keyframes at
    /// the same or finer scale. The origin keyframe is never culled.
    fn cull_keyframes(&self, map: &mut Map, current_kf: KeyFrameId) {
        let candidates: Vec<KeyFrameId> = match map.keyframe(current_kf) {
            Some(kf) => kf.covisibility_weights().keys().copied().collect(),
            None => return,
        };
        let mut culled = 0usize;

        for kf_id in candidates {
            if Some(kf_id) == map.origin() || kf_id == current_kf {
                continue;
            }
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if kf.bad {
                continue;
            }

            let mut n_points = 0usize;
            let mut n_redundant = 0usize;
            for (slot, raw_id) in kf.map_point_slots() {
                let Some(mp_id) = map.resolve(raw_id) else {
                    continue;
                };
                let Some(mp) = map.map_point(mp_id) else {
                    continue;
                };

                if self.sensor.has_depth() {
                    // Far points need two keyframes anyway; only close ones
                    // witness redundancy.
                    match kf.depths[slot] {
                        Some(z) if z > 0.0 && z <= self.camera.depth_threshold => {}
                        _ => continue,
                    }
                }

                n_points += 1;
                if mp.num_observations() <= REDUNDANT_OBSERVERS {
                    continue;
                }
                let scale_level = kf.keypoints[slot].octave;
                let mut n_obs = 0usize;
                for (&other_kf, &other_slot) in &mp.observations {
                    if other_kf == kf_id {
                        continue;
                    }
                    let Some(other) = map.keyframe(other_kf) else {
                        continue;
                    };
                    let other_level = other.keypoints[other_slot].octave;
                    if other_level <= scale_level + 1 {
                        n_obs += 1;
                        if n_obs >= REDUNDANT_OBSERVERS {
                            break;
                        }
                    }
                }
                if n_obs >= REDUNDANT_OBSERVERS {
                    n_redundant += 1;
                }
            }

            if n_points > 0 && n_redundant as f64 > REDUNDANCY_RATIO * n_points as f64 {
                map.set_bad_keyframe(kf_id);
                self.shared.keyframe_index.lock().erase(kf_id);
                culled += 1;
            }
        }

        if culled > 0 {
            info!(kf = current_kf.0, culled, "redundant keyframes culled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::map::KeyFrameData;
    use crate::tracking::frame::test_camera;
    use crossbeam_channel::bounded;
    use nalgebra::{UnitQuaternion, Vector3};

    /// Landmarks inside the close-depth band of the test camera.
    fn landmark(i: usize) -> Vector3<f64> {
        let fi = i as f64;
        Vector3::new(
            (fi * 2.399).sin() * 0.6,
            (fi * 1.117).cos() * 0.45,
            2.0 + (fi * 0.731).sin() * 0.5,
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

    fn shared_state() -> Arc<SharedState> {
        SharedState::new(ScalePyramid::new(8, 1.2))
    }

    fn mapper(shared: &Arc<SharedState>, sensor: SensorKind) -> LocalMapper {
        LocalMapper::new(test_camera(), sensor, Arc::clone(shared), None)
    }

    fn add_keyframe(map: &mut Map, idx: u64, tx: f64, n: usize, octave: usize) -> KeyFrameId {
        let camera = test_camera();
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(tx, 0.0, 0.0));
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut depths = Vec::new();
        let mut u_right = Vec::new();
        for i in 0..n {
            let c = pose.transform_point(&landmark(i));
            let uv = camera.project(&c).unwrap();
            keypoints.push(Keypoint {
                x: uv.x,
                y: uv.y,
                octave,
                angle: 0.0,
            });
            descriptors.push(descriptor(i));
            depths.push(Some(c.z));
            u_right.push(Some(camera.right_eye_u(uv.x, c.z)));
        }
        map.create_keyframe(KeyFrameData {
            source_frame_id: idx,
            timestamp: idx as f64,
            pose_cw: pose,
            keypoints,
            descriptors,
            depths,
            u_right,
        })
    }

    #[test]
    fn process_new_keyframe_registers_tracked_matches() {
        let shared = shared_state();
        let mut mapper = mapper(&shared, SensorKind::Rgbd);
        let mut map = shared.map.write();

        let kf1 = add_keyframe(&mut map, 0, 0.0, 30, 0);
        let kf2 = add_keyframe(&mut map, 1, -0.2, 30, 0);

        // Landmarks observed by kf1; the tracker wrote slot-only matches
        // into kf2.
        for i in 0..30 {
            let mp = map.create_map_point(landmark(i), descriptor(i), kf1);
            map.associate(kf1, i, mp);
            map.keyframe_mut(kf2).unwrap().set_map_point(i, mp);
        }

        mapper.process_new_keyframe(&mut map, kf2);

        for i in 0..30 {
            let mp_id = map.keyframe(kf2).unwrap().map_point(i).unwrap();
            assert!(map.map_point(mp_id).unwrap().is_observed_by(kf2));
        }
        // Covisibility edge formed by the shared observations.
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf2), 30);
        map.assert_consistent();
    }

    #[test]
    fn tracker_born_points_enter_probation_fifo() {
        let shared = shared_state();
        let mut mapper = mapper(&shared, SensorKind::Rgbd);
        let mut map = shared.map.write();

        let kf = add_keyframe(&mut map, 0, 0.0, 10, 0);
        for i in 0..10 {
            let mp = map.create_map_point(landmark(i), descriptor(i), kf);
            map.associate(kf, i, mp);
        }
        mapper.process_new_keyframe(&mut map, kf);
        assert_eq!(mapper.recent_points.len(), 10);
    }

    #[test]
    fn recent_point_culling_follows_the_policy() {
        let shared = shared_state();
        let mut mapper = mapper(&shared, SensorKind::Rgbd);
        let mut map = shared.map.write();

        let kf0 = add_keyframe(&mut map, 0, 0.0, 40, 0);
        let kf1 = add_keyframe(&mut map, 1, -0.1, 40, 0);
        let kf2 = add_keyframe(&mut map, 2, -0.2, 40, 0);
        let kf3 = add_keyframe(&mut map, 3, -0.3, 40, 0);
        let current = add_keyframe(&mut map, 4, -0.4, 40, 0);

        // Point with a rotten found-ratio: culled immediately.
        let low_ratio = map.create_map_point(landmark(0), descriptor(0), kf0);
        map.associate(kf0, 0, low_ratio);
        map.associate(kf1, 0, low_ratio);
        map.associate(kf2, 0, low_ratio);
        map.associate(kf3, 0, low_ratio);
        {
            let mp = map.map_point_mut(low_ratio).unwrap();
            mp.visible_count = 100;
            mp.found_count = 5;
        }

        // Aged two keyframes with too few observers: culled.
        let under_observed = map.create_map_point(landmark(1), descriptor(1), kf0);
        map.associate(kf0, 1, under_observed);
        map.associate(kf1, 1, under_observed);

        // Aged ≥ 3 keyframes with enough observers: graduates out of the
        // FIFO and stays in the map.
        let graduate = map.create_map_point(landmark(2), descriptor(2), kf0);
        map.associate(kf0, 2, graduate);
        map.associate(kf1, 2, graduate);
        map.associate(kf2, 2, graduate);
        map.associate(kf3, 2, graduate);
        {
            let mp = map.map_point_mut(graduate).unwrap();
            mp.visible_count = 10;
            mp.found_count = 10;
        }

        // Fresh point: kept on probation.
        let fresh = map.create_map_point(landmark(3), descriptor(3), kf3);
        map.associate(kf3, 3, fresh);

        mapper
            .recent_points
            .extend([low_ratio, under_observed, graduate, fresh]);
        mapper.cull_recent_points(&mut map, current);

        assert!(map.map_point(low_ratio).unwrap().bad);
        assert!(map.map_point(under_observed).unwrap().bad);
        assert!(!map.map_point(graduate).unwrap().bad);
        assert!(!map.map_point(fresh).unwrap().bad);
        // Only the fresh point remains on probation.
        assert_eq!(mapper.recent_points, VecDeque::from(vec![fresh]));

        // Re-running over the same set is idempotent: bad points fall out
        // of the FIFO, survivors keep their verdicts.
        mapper
            .recent_points
            .extend([low_ratio, under_observed, graduate, fresh]);
        mapper.cull_recent_points(&mut map, current);
        assert!(map.map_point(graduate).map_or(false, |mp| !mp.bad));
        assert_eq!(mapper.recent_points, VecDeque::from(vec![fresh]));
    }

    #[test]
    fn keyframe_culling_marks_redundant_keyframe() {
        let shared = shared_state();
        let mapper = mapper(&shared, SensorKind::Rgbd);
        let mut map = shared.map.write();

        // Five keyframes sharing 100 close landmarks. The middle keyframe
        // observes them at a coarser octave (every point has ≥ 3 finer
        // observers elsewhere → fully redundant); its siblings each carry a
        // private tail of landmarks that keeps their redundancy ratio under
        // the bar regardless of culling order.
        let shared_n = 100;
        let tail = 15;
        let n = shared_n + 2 * tail;
        let mut kfs = Vec::new();
        for k in 0..5u64 {
            let octave = if k == 2 { 2 } else { 0 };
            kfs.push(add_keyframe(&mut map, k, -0.05 * k as f64, n, octave));
        }
        for i in 0..shared_n {
            let mp = map.create_map_point(landmark(i), descriptor(i), kfs[0]);
            for &kf in &kfs {
                map.associate(kf, i, mp);
            }
        }
        for i in shared_n..shared_n + tail {
            let mp = map.create_map_point(landmark(i), descriptor(i), kfs[1]);
            map.associate(kfs[1], i, mp);
        }
        for i in shared_n + tail..n {
            let mp = map.create_map_point(landmark(i), descriptor(i), kfs[3]);
            map.associate(kfs[3], i, mp);
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }

        mapper.cull_keyframes(&mut map, kfs[4]);

        assert!(map.keyframe(kfs[2]).unwrap().bad);
        assert!(!map.keyframe(kfs[0]).unwrap().bad);
        assert!(!map.keyframe(kfs[1]).unwrap().bad);
        assert!(!map.keyframe(kfs[3]).unwrap().bad);
        assert!(!map.keyframe(kfs[4]).unwrap().bad);

        // A culled keyframe no longer appears among covisibility neighbors.
        let neighbors = map.best_covisibility_keyframes(kfs[4], 10);
        assert!(!neighbors.contains(&kfs[2]));
        map.assert_consistent();
    }

    #[test]
    fn run_loop_processes_inbox_and_finishes() {
        let shared = shared_state();
        {
            let mut map = shared.map.write();
            let kf1 = add_keyframe(&mut map, 0, 0.0, 30, 0);
            let kf2 = add_keyframe(&mut map, 1, -0.2, 30, 0);
            for i in 0..30 {
                let mp = map.create_map_point(landmark(i), descriptor(i), kf1);
                map.associate(kf1, i, mp);
                map.keyframe_mut(kf2).unwrap().set_map_point(i, mp);
            }
        }

        let (tx, rx) = bounded(4);
        tx.send(NewKeyFrame {
            keyframe_id: KeyFrameId(1),
        })
        .unwrap();

        let run_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            let mut m = LocalMapper::new(test_camera(), SensorKind::Rgbd, run_shared, None);
            m.run(rx);
        });

        // Wait until the keyframe is integrated, then finish.
        for _ in 0..200 {
            if shared.map.read().keyframe(KeyFrameId(1)).map_or(false, |kf| {
                kf.covisibility_weight(KeyFrameId(0)) == 30
            }) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        shared.request_finish();
        handle.join().unwrap();
        assert!(shared.is_finished());
        assert_eq!(
            shared
                .map
                .read()
                .keyframe(KeyFrameId(1))
                .unwrap()
                .covisibility_weight(KeyFrameId(0)),
            30
        );
    }

    #[test]
    fn reset_drains_probation_queue() {
        let shared = shared_state();
        let (tx, rx) = bounded::<NewKeyFrame>(4);
        tx.send(NewKeyFrame {
            keyframe_id: KeyFrameId(7),
        })
        .unwrap();

        let run_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            let mut m = LocalMapper::new(test_camera(), SensorKind::Rgbd, run_shared, None);
            m.recent_points.push_back(MapPointId(3));
            m.run(rx);
        });

        shared.request_reset_and_wait();
        shared.request_finish();
        handle.join().unwrap();
        assert!(shared.is_finished());
    }
}
