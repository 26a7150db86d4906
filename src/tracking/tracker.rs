//! The tracking front end.
//!
//! One iteration per ingested image: predict a pose prior, associate map
//! points, optimize the pose, decide on keyframe admission, and keep the
//! per-frame trajectory record. Map initialization (stereo/RGB-D immediate,
//! monocular via two-view reconstruction, optional planar-pattern variant)
//! also lives here.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::Sender;
use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::{debug, info, warn};

use crate::camera::PinholeCamera;
use crate::config::{SensorKind, Settings};
use crate::features::{DepthImage, FeatureExtractor, GrayImage};
use crate::geometry::{solve_pnp_ransac, PnPConfig, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matching::{Matcher, ProjectedPoint};
use crate::optimizer::optimize_frame_pose;
use crate::system::messages::NewKeyFrame;
use crate::system::shared_state::SharedState;

use super::ekf::Ekf;
use super::frame::Frame;
use super::initializer::Initializer;
use super::TrackingState;

/// Matches needed before the monocular initializer is even attempted.
const MIN_INIT_MATCHES: usize = 100;
/// Survivors of pose optimization needed by the per-stage trackers.
const MIN_TRACK_INLIERS: usize = 10;
/// Local-map acceptance threshold, relaxed right after relocalization.
const MIN_LOCAL_INLIERS: usize = 30;
const MIN_LOCAL_INLIERS_RELOC: usize = 50;
/// Relocalization success threshold.
const MIN_RELOC_INLIERS: usize = 50;
/// Stereo/RGB-D bootstrap needs this many features in the first frame.
const MIN_STEREO_INIT_FEATURES: usize = 500;
/// Upper bound on the local keyframe set.
const MAX_LOCAL_KEYFRAMES: usize = 80;

/// External planar-fiducial detector for pattern-based initialization.
/// Returns the world → camera pose of the frame with the world anchored to
/// the pattern.
pub trait PatternDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Option<SE3>;
}

/// Per-frame trajectory entry: the frame pose expressed relatively to its
/// reference keyframe, so keyframe corrections propagate to the export.
#[derive(Debug, Clone)]
pub struct TrajectoryRecord {
    pub frame_id: u64,
    pub timestamp: f64,
    pub reference_kf: Option<KeyFrameId>,
    /// `T_cr` = current · reference⁻¹.
    pub relative_pose_cr: Option<SE3>,
    pub lost: bool,
}

/// What one ingest call produced.
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub state: TrackingState,
    pub pose_cw: Option<SE3>,
    pub num_inliers: usize,
}

pub struct Tracker {
    sensor: SensorKind,
    camera: PinholeCamera,
    extractor: Box<dyn FeatureExtractor>,
    /// Denser extractor used while bootstrapping a monocular map.
    init_extractor: Option<Box<dyn FeatureExtractor>>,
    pattern: Option<Box<dyn PatternDetector>>,
    use_pattern: bool,

    shared: Arc<SharedState>,
    kf_sender: Sender<NewKeyFrame>,

    state: TrackingState,
    last_frame: Option<Frame>,

    // Monocular initialization scratch.
    initial_frame: Option<Frame>,
    initializer: Option<Initializer>,
    prev_matched: Vec<(f64, f64)>,
    init_matches: Vec<Option<usize>>,

    reference_kf: Option<KeyFrameId>,
    local_keyframes: Vec<KeyFrameId>,
    local_points: Vec<MapPointId>,

    ekf: Ekf,

    frame_counter: u64,
    last_kf_frame_id: u64,
    last_reloc_frame_id: u64,
    min_frames: u64,
    max_frames: u64,
    matches_inliers: usize,

    /// Short-lived points backing RGB-D motion-model tracking; discarded
    /// every frame unless a keyframe adopted them.
    temporal_points: Vec<MapPointId>,
    trajectory: Vec<TrajectoryRecord>,
    pending_reset: bool,
}

impl Tracker {
    pub fn new(
        settings: &Settings,
        extractor: Box<dyn FeatureExtractor>,
        init_extractor: Option<Box<dyn FeatureExtractor>>,
        pattern: Option<Box<dyn PatternDetector>>,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrame>,
    ) -> Self {
        Self {
            sensor: settings.sensor,
            camera: PinholeCamera::from_settings(&settings.camera),
            extractor,
            init_extractor,
            pattern,
            use_pattern: settings.use_pattern,
            shared,
            kf_sender,
            state: TrackingState::SystemNotReady,
            last_frame: None,
            initial_frame: None,
            initializer: None,
            prev_matched: Vec::new(),
            init_matches: Vec::new(),
            reference_kf: None,
            local_keyframes: Vec::new(),
            local_points: Vec::new(),
            ekf: Ekf::default(),
            frame_counter: 0,
            last_kf_frame_id: 0,
            last_reloc_frame_id: 0,
            min_frames: settings.min_frames(),
            max_frames: settings.max_frames(),
            matches_inliers: 0,
            temporal_points: Vec::new(),
            trajectory: Vec::new(),
            pending_reset: false,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn trajectory(&self) -> &[TrajectoryRecord] {
        &self.trajectory
    }

    /// A system-level reset was demanded (e.g. tracking lost right after
    /// initialization). The owner clears map + mapper and calls
    /// [`Tracker::reset`].
    pub fn take_pending_reset(&mut self) -> bool {
        std::mem::take(&mut self.pending_reset)
    }

    pub fn reset(&mut self) {
        self.state = TrackingState::NoImagesYet;
        self.last_frame = None;
        self.initial_frame = None;
        self.initializer = None;
        self.prev_matched.clear();
        self.init_matches.clear();
        self.reference_kf = None;
        self.local_keyframes.clear();
        self.local_points.clear();
        self.ekf.reset();
        self.last_kf_frame_id = 0;
        self.last_reloc_frame_id = 0;
        self.matches_inliers = 0;
        self.temporal_points.clear();
        self.trajectory.clear();
    }

    /// Forward an external measurement vector to the motion model.
    pub fn set_measurements(&mut self, measurements: &[f64]) {
        self.ekf.set_measurements(measurements);
    }

    /// Ingest one frame (grayscale image, optional registered depth).
    pub fn ingest(&mut self, image: &GrayImage, depth: Option<&DepthImage>) -> TrackOutcome {
        if self.state == TrackingState::SystemNotReady {
            self.state = TrackingState::NoImagesYet;
        }
        debug_assert!(
            !self.sensor.has_depth() || depth.is_some(),
            "depth-capable sensor configured but no depth image supplied"
        );

        let use_init_extractor =
            self.sensor.is_monocular() && self.state != TrackingState::Ok && self.init_extractor.is_some();
        let features = if use_init_extractor {
            self.init_extractor.as_mut().unwrap().extract(image)
        } else {
            self.extractor.extract(image)
        };

        let timestamp = self.frame_counter as f64 / self.camera.fps.max(1.0);
        let frame = Frame::new(self.frame_counter, timestamp, features, depth, self.camera);
        self.frame_counter += 1;

        self.track(frame)
    }

    // ── Main per-frame pipeline ─────────────────────────────────────────

    fn track(&mut self, mut frame: Frame) -> TrackOutcome {
        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }
        let shared = Arc::clone(&self.shared);
        let mut map = shared.map.write();

        if self.state == TrackingState::NotInitialized {
            if self.sensor.has_depth() {
                self.stereo_initialization(&mut map, &mut frame);
            } else {
                self.monocular_initialization(&mut map, &mut frame);
            }
            let outcome = self.finish_frame(&map, frame);
            return outcome;
        }

        let dt = self
            .last_frame
            .as_ref()
            .map(|f| (frame.timestamp - f.timestamp).max(1e-6))
            .unwrap_or(1.0 / self.camera.fps.max(1.0));

        let mut ok = if self.state == TrackingState::Ok {
            self.check_replaced_in_last_frame(&map);
            let prior = self.ekf.predict(dt);
            let just_relocalized = frame.id < self.last_reloc_frame_id + 2;

            if prior.is_none() || just_relocalized {
                self.track_reference_keyframe(&map, &mut frame)
            } else {
                let with_model =
                    self.track_with_motion_model(&mut map, &mut frame, prior.unwrap());
                if with_model {
                    true
                } else {
                    self.track_reference_keyframe(&map, &mut frame)
                }
            }
        } else {
            self.relocalization(&map, &mut frame)
        };

        if ok {
            ok = self.track_local_map(&mut map, &mut frame);
        }

        let was_ok = self.state == TrackingState::Ok;
        self.state = if ok {
            TrackingState::Ok
        } else {
            TrackingState::Lost
        };

        if ok {
            if let Some(pose) = frame.pose_cw.clone() {
                self.ekf.update(&pose, dt);
            }

            // Outlier associations do not survive the frame.
            for slot in 0..frame.num_features() {
                if frame.outliers[slot] {
                    frame.map_points[slot] = None;
                    frame.outliers[slot] = false;
                }
            }

            if self.need_new_keyframe(&map, &frame) {
                self.create_new_keyframe(&mut map, &mut frame);
            }
        } else if was_ok {
            warn!(frame = frame.id, "tracking lost");
        }

        // Temporal points live exactly one frame unless a keyframe adopted
        // them.
        for mp_id in std::mem::take(&mut self.temporal_points) {
            map.discard_unobserved(mp_id);
        }

        if self.state == TrackingState::Lost && map.num_keyframes() <= 5 {
            info!("tracking lost soon after initialization; requesting system reset");
            self.pending_reset = true;
        }

        self.finish_frame(&map, frame)
    }

    /// Append the trajectory record and retire the frame into `last_frame`.
    fn finish_frame(&mut self, map: &Map, frame: Frame) -> TrackOutcome {
        let lost = self.state != TrackingState::Ok;
        let relative = match (&frame.pose_cw, self.reference_kf) {
            (Some(pose), Some(ref_kf)) => map
                .keyframe(ref_kf)
                .map(|kf| pose.compose(&kf.pose_cw().inverse())),
            _ => None,
        };
        self.trajectory.push(TrajectoryRecord {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            reference_kf: self.reference_kf,
            relative_pose_cr: relative,
            lost,
        });

        let outcome = TrackOutcome {
            state: self.state,
            pose_cw: frame.pose_cw.clone(),
            num_inliers: self.matches_inliers,
        };
        self.last_frame = Some(frame);
        outcome
    }

    // ── Initialization ──────────────────────────────────────────────────

    fn stereo_initialization(&mut self, map: &mut Map, frame: &mut Frame) {
        if frame.num_features() < MIN_STEREO_INIT_FEATURES {
            return;
        }
        frame.set_pose_cw(SE3::identity());

        let Some(data) = frame.to_keyframe_data() else {
            return;
        };
        let kf_id = map.create_keyframe(data);

        let mut created = 0usize;
        for slot in 0..frame.num_features() {
            if !frame.is_close(slot) {
                continue;
            }
            let Some(p_world) = frame.unproject(slot) else {
                continue;
            };
            let mp_id = map.create_map_point(p_world, frame.descriptors[slot], kf_id);
            map.associate(kf_id, slot, mp_id);
            map.update_normal_and_depth(mp_id);
            frame.map_points[slot] = Some(mp_id);
            created += 1;
        }
        map.update_connections(kf_id);

        self.shared
            .keyframe_index
            .lock()
            .add(kf_id, &map.keyframe(kf_id).unwrap().descriptors);

        self.reference_kf = Some(kf_id);
        self.local_keyframes = vec![kf_id];
        self.local_points = map
            .keyframe(kf_id)
            .unwrap()
            .map_point_slots()
            .map(|(_, mp)| mp)
            .collect();
        map.set_reference_map_points(self.local_points.clone());
        self.last_kf_frame_id = frame.id;
        self.matches_inliers = created;
        self.ekf.update(&SE3::identity(), 1.0 / self.camera.fps.max(1.0));

        let _ = self.kf_sender.send(NewKeyFrame { keyframe_id: kf_id });
        self.shared.interrupt_ba();

        info!(map_points = created, "map initialized from depth frame");
        self.state = TrackingState::Ok;
    }

    fn monocular_initialization(&mut self, map: &mut Map, frame: &mut Frame) {
        if self.initializer.is_none() {
            if frame.num_features() > MIN_INIT_MATCHES {
                self.prev_matched = frame.keypoints.iter().map(|kp| (kp.x, kp.y)).collect();
                self.initializer = Some(Initializer::new(frame, 1.0, 200));
                self.initial_frame = Some(frame.clone());
            }
            return;
        }

        if frame.num_features() <= MIN_INIT_MATCHES {
            self.initializer = None;
            self.initial_frame = None;
            return;
        }

        let initial = self.initial_frame.as_ref().unwrap();
        let matcher = Matcher::new(0.9, true);
        let (n_matches, matches) =
            matcher.search_for_initialization(initial, frame, &mut self.prev_matched, 100.0);
        if n_matches < MIN_INIT_MATCHES {
            self.initializer = None;
            self.initial_frame = None;
            return;
        }
        self.init_matches = matches;

        if self.use_pattern && self.pattern.is_some() {
            self.pattern_initialization(map, frame);
            return;
        }

        let Some(result) = self
            .initializer
            .as_ref()
            .unwrap()
            .initialize(frame, &self.init_matches)
        else {
            return; // InitializationFailed: retry with the next frame.
        };

        let pose1 = SE3::identity();
        let pose2 = result.pose_cw2.clone();
        let points = result.points.clone();
        self.create_initial_map_monocular(map, frame, pose1, pose2, points, false);
    }

    /// Planar-fiducial variant: poses come from the detector, structure from
    /// straight triangulation, and the world is re-anchored to the dominant
    /// plane of the bootstrap cloud.
    fn pattern_initialization(&mut self, map: &mut Map, frame: &mut Frame) {
        let detector = self.pattern.as_mut().unwrap();
        let pose2 = match detector.detect(frame) {
            Some(p) => p,
            None => return,
        };
        let pose1 = {
            let initial = self.initial_frame.as_ref().unwrap();
            match detector.detect(initial) {
                Some(p) => p,
                None => return,
            }
        };

        let initial = self.initial_frame.as_ref().unwrap();
        let camera = self.camera;
        let mut points: Vec<Option<Vector3<f64>>> = vec![None; initial.num_features()];
        for (i1, m) in self.init_matches.iter().enumerate() {
            let Some(i2) = *m else { continue };
            let kp1 = &initial.keypoints[i1];
            let kp2 = &frame.keypoints[i2];
            let xn1 = camera.normalize(kp1.x, kp1.y).push(1.0);
            let xn2 = camera.normalize(kp2.x, kp2.y).push(1.0);
            let Some(p) = crate::geometry::triangulate_dlt(&xn1, &xn2, &pose1, &pose2) else {
                continue;
            };
            if pose1.transform_point(&p).z <= 0.0 || pose2.transform_point(&p).z <= 0.0 {
                continue;
            }
            points[i1] = Some(p);
        }

        let n_points = points.iter().filter(|p| p.is_some()).count();
        if n_points < MIN_INIT_MATCHES / 2 {
            return;
        }
        self.create_initial_map_monocular(map, frame, pose1, pose2, points, true);
    }

    #[allow(clippy::too_many_arguments)]
    fn create_initial_map_monocular(
        &mut self,
        map: &mut Map,
        frame: &mut Frame,
        mut pose1: SE3,
        mut pose2: SE3,
        mut points: Vec<Option<Vector3<f64>>>,
        align_plane: bool,
    ) {
        if align_plane {
            if let Some(rotation) = plane_alignment(&points) {
                for p in points.iter_mut().flatten() {
                    *p = rotation * *p;
                }
                let r_inv = SE3::from_matrix(&rotation, Vector3::zeros()).inverse();
                pose1 = pose1.compose(&r_inv);
                pose2 = pose2.compose(&r_inv);
            }
        }

        let initial = self.initial_frame.as_mut().unwrap();
        initial.set_pose_cw(pose1.clone());
        frame.set_pose_cw(pose2.clone());

        let kf1 = map.create_keyframe(initial.to_keyframe_data().unwrap());
        let kf2 = map.create_keyframe(frame.to_keyframe_data().unwrap());

        for (i1, p) in points.iter().enumerate() {
            let (Some(p), Some(i2)) = (p, self.init_matches[i1]) else {
                continue;
            };
            let mp_id = map.create_map_point(*p, initial.descriptors[i1], kf1);
            map.associate(kf1, i1, mp_id);
            map.associate(kf2, i2, mp_id);
            map.compute_distinctive_descriptor(mp_id);
            map.update_normal_and_depth(mp_id);
            frame.map_points[i2] = Some(mp_id);
        }
        map.update_connections(kf1);
        map.update_connections(kf2);

        // Normalize scene scale: median depth of the first view becomes 1.
        let Some(median_depth) = map.scene_median_depth(kf1, 2) else {
            self.abort_initial_map(map, kf1, kf2);
            return;
        };
        let tracked = map.tracked_points_in_keyframe(kf2, 1);
        if median_depth <= 0.0 || tracked < MIN_INIT_MATCHES / 2 {
            info!(median_depth, tracked, "bootstrap rejected; resetting initializer");
            self.abort_initial_map(map, kf1, kf2);
            return;
        }
        let inv_depth = 1.0 / median_depth;
        for kf_id in [kf1, kf2] {
            let kf = map.keyframe_mut(kf_id).unwrap();
            let mut pose = kf.pose_cw().clone();
            pose.translation *= inv_depth;
            kf.set_pose_cw(pose);
        }
        let point_ids: Vec<MapPointId> = map.map_points().map(|mp| mp.id).collect();
        for mp_id in point_ids {
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.position *= inv_depth;
            }
            map.update_normal_and_depth(mp_id);
        }
        let mut scaled_pose2 = pose2.clone();
        scaled_pose2.translation *= inv_depth;
        frame.set_pose_cw(scaled_pose2.clone());

        {
            let mut index = self.shared.keyframe_index.lock();
            index.add(kf1, &map.keyframe(kf1).unwrap().descriptors);
            index.add(kf2, &map.keyframe(kf2).unwrap().descriptors);
        }

        self.reference_kf = Some(kf2);
        self.local_keyframes = vec![kf1, kf2];
        self.local_points = map.map_points().map(|mp| mp.id).collect();
        map.set_reference_map_points(self.local_points.clone());
        self.last_kf_frame_id = frame.id;
        self.matches_inliers = map.tracked_points_in_keyframe(kf2, 1);
        self.ekf.update(&scaled_pose2, 1.0 / self.camera.fps.max(1.0));

        let _ = self.kf_sender.send(NewKeyFrame { keyframe_id: kf1 });
        let _ = self.kf_sender.send(NewKeyFrame { keyframe_id: kf2 });
        self.shared.interrupt_ba();

        info!(
            points = map.num_map_points(),
            "monocular map initialized"
        );
        self.initializer = None;
        self.initial_frame = None;
        self.state = TrackingState::Ok;
    }

    fn abort_initial_map(&mut self, map: &mut Map, _kf1: KeyFrameId, _kf2: KeyFrameId) {
        map.clear();
        self.shared.keyframe_index.lock().clear();
        self.initializer = None;
        self.initial_frame = None;
    }

    // ── Per-frame tracking stages ───────────────────────────────────────

    /// Fused points may have been replaced since the last frame; follow the
    /// replacement pointers before reusing the associations.
    fn check_replaced_in_last_frame(&mut self, map: &Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        for slot in 0..last.map_points.len() {
            if let Some(mp_id) = last.map_points[slot] {
                last.map_points[slot] = map.resolve(mp_id);
            }
        }
    }

    /// Re-anchor the last frame pose on its (possibly optimized) reference
    /// keyframe, and give RGB-D frames short-lived points for close
    /// keypoints that had none.
    fn update_last_frame(&mut self, map: &mut Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        if let Some(record) = self.trajectory.last() {
            if let (Some(ref_kf), Some(rel)) = (record.reference_kf, &record.relative_pose_cr) {
                if let Some(kf) = map.keyframe(ref_kf) {
                    last.set_pose_cw(rel.compose(kf.pose_cw()));
                }
            }
        }

        if self.sensor.is_monocular() || self.last_kf_frame_id == last.id {
            return;
        }

        // Close keypoints without an association, nearest first.
        let mut depth_order: Vec<(f64, usize)> = last
            .depths
            .iter()
            .enumerate()
            .filter_map(|(slot, z)| z.map(|z| (z, slot)))
            .filter(|(z, _)| *z > 0.0)
            .collect();
        depth_order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let mut n_points = 0usize;
        for (z, slot) in depth_order {
            let needs_point = match last.map_points[slot] {
                None => true,
                Some(mp_id) => map
                    .map_point(mp_id)
                    .map_or(true, |mp| mp.num_observations() < 1),
            };
            if needs_point {
                if let Some(p_world) = last.unproject(slot) {
                    let mp_id =
                        map.create_map_point(p_world, last.descriptors[slot], KeyFrameId(0));
                    last.map_points[slot] = Some(mp_id);
                    self.temporal_points.push(mp_id);
                }
            }
            n_points += 1;
            if z > self.camera.depth_threshold && n_points > 100 {
                break;
            }
        }
    }

    fn track_with_motion_model(
        &mut self,
        map: &mut Map,
        frame: &mut Frame,
        prior: SE3,
    ) -> bool {
        self.update_last_frame(map);
        frame.set_pose_cw(prior);

        let th = if self.sensor.is_monocular() { 7.0 } else { 15.0 };
        let matcher = Matcher::new(0.9, true);
        let last = self.last_frame.as_ref().unwrap();
        let mut n_matches =
            matcher.search_by_projection_last(frame, last, map, th, self.sensor.is_monocular());

        if n_matches < 20 {
            // Wider window before giving up on the prior.
            frame.map_points.iter_mut().for_each(|m| *m = None);
            n_matches = matcher.search_by_projection_last(
                frame,
                last,
                map,
                2.0 * th,
                self.sensor.is_monocular(),
            );
        }
        if n_matches < 20 {
            return false;
        }

        let Some(result) = optimize_frame_pose(frame, map) else {
            return false;
        };
        let map_inliers = self.count_map_inliers(map, frame);
        debug!(
            frame = frame.id,
            matches = n_matches,
            inliers = result.num_inliers,
            map_inliers,
            "motion-model tracking"
        );
        map_inliers >= MIN_TRACK_INLIERS
    }

    fn track_reference_keyframe(&mut self, map: &Map, frame: &mut Frame) -> bool {
        let Some(ref_kf) = self.reference_kf else {
            return false;
        };
        let matcher = Matcher::new(0.7, true);
        let n_matches = matcher.search_by_descriptors(frame, map, ref_kf);
        if n_matches < 15 {
            return false;
        }

        let last_pose = self
            .last_frame
            .as_ref()
            .and_then(|f| f.pose_cw.clone())
            .unwrap_or_else(SE3::identity);
        frame.set_pose_cw(last_pose);

        let Some(_result) = optimize_frame_pose(frame, map) else {
            return false;
        };
        let map_inliers = self.count_map_inliers(map, frame);
        debug!(
            frame = frame.id,
            matches = n_matches,
            map_inliers,
            "reference-keyframe tracking"
        );
        map_inliers >= MIN_TRACK_INLIERS
    }

    /// Inliers whose landmark is an established map point (temporal points
    /// have no observers and do not count).
    fn count_map_inliers(&self, map: &Map, frame: &Frame) -> usize {
        frame
            .map_points
            .iter()
            .enumerate()
            .filter(|(slot, mp)| {
                !frame.outliers[*slot]
                    && mp.map_or(false, |id| {
                        map.map_point(id)
                            .map_or(false, |mp| !mp.bad && mp.num_observations() >= 1)
                    })
            })
            .count()
    }

    // ── Local map ───────────────────────────────────────────────────────

    fn track_local_map(&mut self, map: &mut Map, frame: &mut Frame) -> bool {
        self.update_local_keyframes(map, frame);
        self.update_local_points(map);
        map.set_reference_map_points(self.local_points.clone());
        self.search_local_points(map, frame);

        if optimize_frame_pose(frame, map).is_none() {
            return false;
        }

        // Count inliers and feed the found statistic.
        self.matches_inliers = 0;
        for slot in 0..frame.num_features() {
            let Some(mp_id) = frame.map_points[slot] else {
                continue;
            };
            if frame.outliers[slot] {
                continue;
            }
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.increase_found(1);
                if mp.num_observations() >= 1 {
                    self.matches_inliers += 1;
                }
            }
        }

        let threshold = if frame.id < self.last_reloc_frame_id + self.max_frames {
            MIN_LOCAL_INLIERS_RELOC
        } else {
            MIN_LOCAL_INLIERS
        };
        debug!(
            frame = frame.id,
            inliers = self.matches_inliers,
            threshold,
            "local-map tracking"
        );
        self.matches_inliers >= threshold
    }

    /// Rebuild the local keyframe set: every observer of the frame's current
    /// points votes; the best-voted keyframe becomes the reference, and the
    /// covisibility neighbors of the voters pad the set up to the bound.
    fn update_local_keyframes(&mut self, map: &mut Map, frame: &Frame) {
        let mut votes: std::collections::HashMap<KeyFrameId, usize> =
            std::collections::HashMap::new();
        for mp_entry in frame.map_points.iter().flatten() {
            if let Some(mp_id) = map.resolve(*mp_entry) {
                if let Some(mp) = map.map_point(mp_id) {
                    for &kf_id in mp.observations.keys() {
                        *votes.entry(kf_id).or_insert(0) += 1;
                    }
                }
            }
        }
        if votes.is_empty() {
            return;
        }

        self.local_keyframes.clear();
        let mut best: (usize, Option<KeyFrameId>) = (0, None);
        for (&kf_id, &count) in &votes {
            if map.keyframe(kf_id).map_or(true, |kf| kf.bad) {
                continue;
            }
            if count > best.0 {
                best = (count, Some(kf_id));
            }
            self.local_keyframes.push(kf_id);
        }

        let voters: Vec<KeyFrameId> = self.local_keyframes.clone();
        for kf_id in voters {
            if self.local_keyframes.len() >= MAX_LOCAL_KEYFRAMES {
                break;
            }
            for neighbor in map.best_covisibility_keyframes(kf_id, 10) {
                if !self.local_keyframes.contains(&neighbor) {
                    self.local_keyframes.push(neighbor);
                    break;
                }
            }
        }

        if let Some(reference) = best.1 {
            self.reference_kf = Some(reference);
        }
    }

    fn update_local_points(&mut self, map: &Map) {
        let mut seen = HashSet::new();
        self.local_points.clear();
        for &kf_id in &self.local_keyframes {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            for (_, raw) in kf.map_point_slots() {
                if let Some(mp_id) = map.resolve(raw) {
                    if seen.insert(mp_id) {
                        self.local_points.push(mp_id);
                    }
                }
            }
        }
    }

    /// Project unmatched local points into the frame and search for the
    /// extra associations, updating visibility statistics along the way.
    fn search_local_points(&mut self, map: &mut Map, frame: &mut Frame) {
        let Some(pose_cw) = frame.pose_cw.clone() else {
            return;
        };
        let camera_center = pose_cw.inverse().translation;

        // Points already matched this frame only get their counters bumped.
        for mp_entry in frame.map_points.iter().flatten() {
            if let Some(mp) = map.map_point_mut(*mp_entry) {
                mp.increase_visible(1);
                mp.last_frame_seen = frame.id;
            }
        }

        let mut candidates: Vec<ProjectedPoint> = Vec::new();
        for &mp_id in &self.local_points {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.bad || mp.last_frame_seen == frame.id {
                continue;
            }

            // Frustum test.
            let p_cam = pose_cw.transform_point(&mp.position);
            let Some(uv) = frame.camera.project(&p_cam) else {
                continue;
            };
            if !frame.camera.in_image(uv.x, uv.y) {
                continue;
            }
            let view_dir = mp.position - camera_center;
            let dist = view_dir.norm();
            if !mp.is_in_distance_range(dist) {
                continue;
            }
            let view_cos = if mp.normal.norm() > 1e-9 && dist > 1e-9 {
                view_dir.dot(&mp.normal) / (dist * mp.normal.norm())
            } else {
                1.0
            };
            if view_cos < 0.5 {
                continue;
            }

            let predicted_level = map.pyramid().predict_level(dist, mp.max_distance);
            candidates.push(ProjectedPoint {
                mp_id,
                u: uv.x,
                v: uv.y,
                predicted_level,
                view_cos,
                descriptor: mp.descriptor,
            });
        }

        for cand in &candidates {
            if let Some(mp) = map.map_point_mut(cand.mp_id) {
                mp.increase_visible(1);
            }
        }
        if candidates.is_empty() {
            return;
        }

        let mut th = 1.0;
        if self.sensor == SensorKind::Rgbd {
            th = 3.0;
        }
        if frame.id < self.last_reloc_frame_id + 2 {
            th = 5.0;
        }
        let matcher = Matcher::new(0.8, true);
        matcher.search_by_projection_local(frame, &candidates, th, map.pyramid());
    }

    // ── Keyframe admission ──────────────────────────────────────────────

    fn need_new_keyframe(&self, map: &Map, frame: &Frame) -> bool {
        if self.shared.is_stopped() || self.shared.stop_requested() {
            return false;
        }
        // A saturated inbox is a missed keyframe opportunity, never a stall.
        if self.kf_sender.is_full() {
            return false;
        }
        let n_kfs = map.num_keyframes();

        // Fresh after relocalization and the map is populated: wait.
        if frame.id < self.last_reloc_frame_id + self.max_frames && n_kfs as u64 > self.max_frames
        {
            return false;
        }

        let min_obs = if n_kfs <= 2 { 2 } else { 3 };
        let ref_matches = self
            .reference_kf
            .map(|kf| map.tracked_points_in_keyframe(kf, min_obs))
            .unwrap_or(0);
        let mapper_idle = self.shared.accept_keyframes();

        // Close-point budget for depth sensors.
        let (tracked_close, untracked_close) = if self.sensor.has_depth() {
            let mut tracked = 0;
            let mut untracked = 0;
            for slot in 0..frame.num_features() {
                if !frame.is_close(slot) {
                    continue;
                }
                if frame.map_points[slot].is_some() && !frame.outliers[slot] {
                    tracked += 1;
                } else {
                    untracked += 1;
                }
            }
            (tracked, untracked)
        } else {
            (0, 0)
        };
        let need_close = tracked_close < 100 && untracked_close > 70;

        let ref_ratio = if self.sensor.is_monocular() {
            0.9
        } else if n_kfs < 2 {
            0.4
        } else {
            0.75
        };

        let c1a = frame.id >= self.last_kf_frame_id + self.max_frames;
        let c1b = frame.id >= self.last_kf_frame_id + self.min_frames && mapper_idle;
        let c1c = self.sensor.has_depth()
            && (self.matches_inliers < (ref_matches as f64 * 0.25) as usize || need_close);
        let c2 = (self.matches_inliers < (ref_matches as f64 * ref_ratio) as usize || need_close)
            && self.matches_inliers > 15;

        if !((c1a || c1b || c1c) && c2) {
            return false;
        }
        if mapper_idle {
            return true;
        }
        self.shared.interrupt_ba();
        self.sensor.has_depth() && self.kf_sender.len() < 3
    }

    fn create_new_keyframe(&mut self, map: &mut Map, frame: &mut Frame) {
        if !self.shared.set_not_stop(true) {
            return;
        }

        let Some(data) = frame.to_keyframe_data() else {
            self.shared.set_not_stop(false);
            return;
        };
        let kf_id = map.create_keyframe(data);
        self.reference_kf = Some(kf_id);

        // Tracked associations become keyframe slots; the mapper registers
        // the observations when it processes the keyframe.
        for slot in 0..frame.num_features() {
            if let Some(mp_id) = frame.map_points[slot].and_then(|id| map.resolve(id)) {
                if map.map_point(mp_id).map_or(false, |mp| mp.num_observations() >= 1) {
                    map.keyframe_mut(kf_id).unwrap().set_map_point(slot, mp_id);
                }
            }
        }

        // Depth sensors: seed close-range landmarks for unmatched keypoints.
        if self.sensor.has_depth() {
            let mut depth_order: Vec<(f64, usize)> = frame
                .depths
                .iter()
                .enumerate()
                .filter_map(|(slot, z)| z.map(|z| (z, slot)))
                .filter(|(z, _)| *z > 0.0)
                .collect();
            depth_order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

            let mut created = 0usize;
            for (z, slot) in depth_order {
                let has_established = frame.map_points[slot]
                    .and_then(|id| map.resolve(id))
                    .and_then(|id| map.map_point(id))
                    .map_or(false, |mp| mp.num_observations() >= 1);
                if !has_established {
                    if let Some(p_world) = frame.unproject(slot) {
                        let mp_id = map.create_map_point(p_world, frame.descriptors[slot], kf_id);
                        map.associate(kf_id, slot, mp_id);
                        map.compute_distinctive_descriptor(mp_id);
                        map.update_normal_and_depth(mp_id);
                        frame.map_points[slot] = Some(mp_id);
                        created += 1;
                    }
                }
                if z > self.camera.depth_threshold && created > 100 {
                    break;
                }
            }
        }
        map.update_connections(kf_id);

        self.shared
            .keyframe_index
            .lock()
            .add(kf_id, &map.keyframe(kf_id).unwrap().descriptors);

        self.shared.interrupt_ba();
        if self.kf_sender.try_send(NewKeyFrame { keyframe_id: kf_id }).is_err() {
            // Single-producer and admission checks capacity first, so this
            // only fires if the mapper vanished; the keyframe stays in the
            // map either way.
            warn!(kf = kf_id.0, "keyframe inbox unavailable");
        }
        self.shared.set_not_stop(false);

        self.last_kf_frame_id = frame.id;
        debug!(kf = kf_id.0, frame = frame.id, "keyframe created");
    }

    // ── Relocalization ──────────────────────────────────────────────────

    fn relocalization(&mut self, map: &Map, frame: &mut Frame) -> bool {
        let candidates = self
            .shared
            .keyframe_index
            .lock()
            .candidates(&frame.descriptors, 10);
        if candidates.is_empty() {
            return false;
        }

        let matcher = Matcher::new(0.75, true);
        for candidate in candidates {
            let kf_id = candidate.keyframe_id;
            if map.keyframe(kf_id).map_or(true, |kf| kf.bad) {
                continue;
            }

            frame.map_points.iter_mut().for_each(|m| *m = None);
            frame.outliers.iter_mut().for_each(|o| *o = false);
            let n_matches = matcher.search_by_descriptors(frame, map, kf_id);
            if n_matches < 15 {
                continue;
            }

            // PnP seed from the descriptor matches.
            let mut points3d = Vec::new();
            let mut points2d = Vec::new();
            let mut slots = Vec::new();
            for slot in 0..frame.num_features() {
                if let Some(mp_id) = frame.map_points[slot] {
                    if let Some(mp) = map.map_point(mp_id) {
                        let kp = &frame.keypoints[slot];
                        points3d.push(mp.position);
                        points2d.push(Vector2::new(
                            (kp.x - self.camera.cx) / self.camera.fx,
                            (kp.y - self.camera.cy) / self.camera.fy,
                        ));
                        slots.push(slot);
                    }
                }
            }
            let Some(pnp) = solve_pnp_ransac(&points3d, &points2d, &PnPConfig::default()) else {
                continue;
            };
            // Keep only the consensus associations.
            for (i, &slot) in slots.iter().enumerate() {
                if !pnp.inlier_mask[i] {
                    frame.map_points[slot] = None;
                }
            }
            frame.set_pose_cw(pnp.pose_cw);

            let Some(mut opt) = optimize_frame_pose(frame, map) else {
                continue;
            };
            if opt.num_inliers < MIN_TRACK_INLIERS {
                continue;
            }

            if opt.num_inliers < MIN_RELOC_INLIERS {
                let found: HashSet<MapPointId> =
                    frame.map_points.iter().flatten().copied().collect();
                let additional = matcher
                    .search_by_projection_reloc(frame, map, kf_id, &found, 10.0, 100);
                if opt.num_inliers + additional >= MIN_RELOC_INLIERS {
                    opt = match optimize_frame_pose(frame, map) {
                        Some(o) => o,
                        None => continue,
                    };
                    if opt.num_inliers > 30 && opt.num_inliers < MIN_RELOC_INLIERS {
                        let found: HashSet<MapPointId> =
                            frame.map_points.iter().flatten().copied().collect();
                        matcher.search_by_projection_reloc(frame, map, kf_id, &found, 3.0, 64);
                        opt = match optimize_frame_pose(frame, map) {
                            Some(o) => o,
                            None => continue,
                        };
                    }
                }
            }

            if opt.num_inliers >= MIN_RELOC_INLIERS {
                self.last_reloc_frame_id = frame.id;
                self.reference_kf = Some(kf_id);
                info!(frame = frame.id, kf = kf_id.0, "relocalized");
                return true;
            }
        }
        false
    }
}

/// Rotation taking the dominant plane normal of the bootstrap cloud onto
/// +Z (least-squares plane through the centroid via SVD).
fn plane_alignment(points: &[Option<Vector3<f64>>]) -> Option<Matrix3<f64>> {
    let pts: Vec<&Vector3<f64>> = points.iter().flatten().collect();
    if pts.len() < 3 {
        return None;
    }
    let centroid = pts.iter().fold(Vector3::zeros(), |acc, p| acc + **p) / pts.len() as f64;
    let mut cov = Matrix3::zeros();
    for p in &pts {
        let d = **p - centroid;
        cov += d * d.transpose();
    }
    let eig = cov.symmetric_eigen();
    // Eigenvector of the smallest eigenvalue is the plane normal.
    let mut min_idx = 0;
    for i in 1..3 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_idx] {
            min_idx = i;
        }
    }
    let mut normal = eig.eigenvectors.column(min_idx).into_owned();
    if normal.z < 0.0 {
        normal = -normal;
    }
    let target = Vector3::z();
    let rotation = nalgebra::Rotation3::rotation_between(&normal, &target)?;
    Some(rotation.into_inner())
}
