//! System assembly: wires the tracker and the local-mapping thread around
//! the shared map and owns the shutdown, reset, and trajectory-export
//! surfaces.

use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};
use tracing::info;

use crate::camera::PinholeCamera;
use crate::config::Settings;
use crate::features::{DepthImage, FeatureExtractor, GrayImage, ScalePyramid};
use crate::local_mapping::LocalMapper;
use crate::map::KeyFrameId;
use crate::tracking::{PatternDetector, TrackOutcome, Tracker, TrackingState, TrajectoryRecord};

use super::messages::NewKeyFrame;
use super::shared_state::SharedState;

/// Capacity of the tracker → mapper keyframe inbox. Backpressure is the
/// accept flag, not the channel: with nominal pacing the queue stays short.
const KEYFRAME_INBOX_CAPACITY: usize = 16;

pub struct SlamSystem {
    shared: Arc<SharedState>,
    tracker: Tracker,
    mapper_handle: Option<JoinHandle<()>>,
    /// Keyframes the mapper has finished with, for an external loop closer.
    lc_receiver: Option<Receiver<KeyFrameId>>,
}

impl SlamSystem {
    /// Build the system and spawn the local-mapping thread.
    pub fn new(
        settings: Settings,
        extractor: Box<dyn FeatureExtractor>,
        init_extractor: Option<Box<dyn FeatureExtractor>>,
        pattern: Option<Box<dyn PatternDetector>>,
    ) -> Result<Self> {
        settings.validate().context("invalid settings")?;

        let pyramid = ScalePyramid::new(
            settings.features.pyramid_levels,
            settings.features.scale_factor,
        );
        let shared = SharedState::new(pyramid);
        let camera = PinholeCamera::from_settings(&settings.camera);

        let (kf_sender, kf_receiver) = bounded::<NewKeyFrame>(KEYFRAME_INBOX_CAPACITY);
        let (lc_sender, lc_receiver) = bounded::<KeyFrameId>(KEYFRAME_INBOX_CAPACITY);

        let tracker = Tracker::new(
            &settings,
            extractor,
            init_extractor,
            pattern,
            Arc::clone(&shared),
            kf_sender,
        );

        let mapper_shared = Arc::clone(&shared);
        let sensor = settings.sensor;
        let mapper_handle = std::thread::Builder::new()
            .name("local-mapping".into())
            .spawn(move || {
                let mut mapper = LocalMapper::new(camera, sensor, mapper_shared, Some(lc_sender));
                mapper.run(kf_receiver);
            })
            .context("failed to spawn the local-mapping thread")?;

        Ok(Self {
            shared,
            tracker,
            mapper_handle: Some(mapper_handle),
            lc_receiver: Some(lc_receiver),
        })
    }

    /// Process one RGB-D frame.
    pub fn ingest_rgbd(&mut self, image: &GrayImage, depth: &DepthImage) -> TrackOutcome {
        let outcome = self.tracker.ingest(image, Some(depth));
        self.handle_pending_reset();
        outcome
    }

    /// Process one monocular frame.
    pub fn ingest_monocular(&mut self, image: &GrayImage) -> TrackOutcome {
        let outcome = self.tracker.ingest(image, None);
        self.handle_pending_reset();
        outcome
    }

    /// Forward an external measurement vector (e.g. odometry velocity) to
    /// the motion model ahead of the next ingest.
    pub fn set_measurements(&mut self, measurements: &[f64]) {
        self.tracker.set_measurements(measurements);
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn trajectory(&self) -> &[TrajectoryRecord] {
        self.tracker.trajectory()
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Hand out the loop-closer inbox (keyframes the mapper has processed).
    pub fn take_loop_closer_inbox(&mut self) -> Option<Receiver<KeyFrameId>> {
        self.lc_receiver.take()
    }

    /// Clear the map, the place index and the tracker; the mapper drops its
    /// queues through the request/acknowledge protocol.
    pub fn request_reset(&mut self) {
        info!("system reset requested");
        self.shared.request_reset_and_wait();
        self.shared.keyframe_index.lock().clear();
        {
            let _epoch = self.shared.map_update.lock();
            self.shared.map.write().clear();
        }
        self.tracker.reset();
    }

    fn handle_pending_reset(&mut self) {
        if self.tracker.take_pending_reset() {
            self.request_reset();
        }
    }

    /// Stop the back end and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.request_finish();
        if let Some(handle) = self.mapper_handle.take() {
            let _ = handle.join();
        }
    }

    /// Write the per-frame trajectory as CSV. Each row re-anchors the
    /// frame's relative pose on its (possibly optimized) reference keyframe;
    /// frames tracked as lost are skipped. Runs under the map-update lock so
    /// an optimization epoch can not interleave.
    pub fn export_trajectory<W: Write>(&self, writer: W) -> Result<()> {
        let _epoch = self.shared.map_update.lock();
        let map = self.shared.map.read();
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record([
            "timestamp", "frame", "ref_kf", "tx", "ty", "tz", "qx", "qy", "qz", "qw",
        ])?;

        for record in self.tracker.trajectory() {
            if record.lost {
                continue;
            }
            let (Some(ref_kf), Some(rel)) = (record.reference_kf, &record.relative_pose_cr)
            else {
                continue;
            };
            let Some(kf) = map.keyframe(ref_kf) else {
                continue;
            };
            let pose_wc = rel.compose(kf.pose_cw()).inverse();
            let t = pose_wc.translation;
            let q = pose_wc.rotation;
            csv.write_record([
                format!("{:.6}", record.timestamp),
                record.frame_id.to_string(),
                ref_kf.0.to_string(),
                format!("{:.9}", t.x),
                format!("{:.9}", t.y),
                format!("{:.9}", t.z),
                format!("{:.9}", q.i),
                format!("{:.9}", q.j),
                format!("{:.9}", q.k),
                format!("{:.9}", q.w),
            ])?;
        }
        csv.flush()?;
        Ok(())
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint};
    use crate::geometry::SE3;
    use nalgebra::Vector3;
    use std::time::Duration;

    /// Fixed landmark field projected through a scripted trajectory; one
    /// extract() call per frame.
    struct ScriptedExtractor {
        pyramid: ScalePyramid,
        world: Vec<Vector3<f64>>,
        poses: Vec<SE3>,
        camera: PinholeCamera,
        next: usize,
    }

    impl ScriptedExtractor {
        fn new(camera: PinholeCamera, n_points: usize, poses: Vec<SE3>) -> Self {
            let world = (0..n_points)
                .map(|i| {
                    let fi = i as f64;
                    Vector3::new(
                        ((fi * 2.399).sin()) * 1.2,
                        ((fi * 1.117).cos()) * 0.9,
                        2.0 + ((fi * 0.731).sin() + 1.1) * 0.8,
                    )
                })
                .collect();
            Self {
                pyramid: ScalePyramid::new(8, 1.2),
                world,
                poses,
                camera,
                next: 0,
            }
        }

        fn pose_at(&self, idx: usize) -> &SE3 {
            &self.poses[idx.min(self.poses.len() - 1)]
        }

        fn depth_image(&self, idx: usize) -> DepthImage {
            let pose = self.pose_at(idx);
            let mut depths = vec![0.0f32; (self.camera.width * self.camera.height) as usize];
            for p in &self.world {
                let c = pose.transform_point(p);
                if let Some(uv) = self.camera.project(&c) {
                    if self.camera.in_image(uv.x, uv.y) {
                        let (x, y) = (uv.x.round() as i64, uv.y.round() as i64);
                        for dy in -1..=1i64 {
                            for dx in -1..=1i64 {
                                let (xx, yy) = (x + dx, y + dy);
                                if xx >= 0
                                    && yy >= 0
                                    && (xx as u32) < self.camera.width
                                    && (yy as u32) < self.camera.height
                                {
                                    depths[(yy as u32 * self.camera.width + xx as u32) as usize] =
                                        c.z as f32;
                                }
                            }
                        }
                    }
                }
            }
            DepthImage::new(self.camera.width, self.camera.height, depths)
        }
    }

    impl FeatureExtractor for ScriptedExtractor {
        fn pyramid(&self) -> &ScalePyramid {
            &self.pyramid
        }

        fn extract(&mut self, _image: &GrayImage) -> Vec<(Keypoint, Descriptor)> {
            let pose = self.pose_at(self.next).clone();
            self.next += 1;
            self.world
                .iter()
                .enumerate()
                .filter_map(|(i, p)| {
                    let c = pose.transform_point(p);
                    let uv = self.camera.project(&c)?;
                    if !self.camera.in_image(uv.x, uv.y) {
                        return None;
                    }
                    let h = (i as u32).wrapping_mul(2654435761);
                    let mut d = [0u8; 32];
                    for (j, b) in d.iter_mut().enumerate() {
                        *b = (h.rotate_left((j as u32 * 7) % 32) & 0xff) as u8;
                    }
                    Some((
                        Keypoint {
                            x: uv.x,
                            y: uv.y,
                            octave: 0,
                            angle: 0.0,
                        },
                        Descriptor(d),
                    ))
                })
                .collect()
        }
    }

    fn settings() -> Settings {
        Settings::from_yaml_str(
            r#"
sensor: rgbd
camera:
  fx: 500.0
  fy: 500.0
  cx: 320.0
  cy: 240.0
  bf: 40.0
  depth_threshold: 10.0
  depth_map_factor: 1.0
  width: 640
  height: 480
  fps: 30.0
"#,
        )
        .unwrap()
    }

    fn blank() -> GrayImage {
        GrayImage::new(8, 8, vec![0; 64])
    }

    #[test]
    fn rgbd_pipeline_bootstraps_tracks_and_exports() {
        let settings = settings();
        let camera = PinholeCamera::from_settings(&settings.camera);
        let n_frames = 8;
        let poses: Vec<SE3> = (0..n_frames)
            .map(|i| {
                SE3::new(
                    nalgebra::UnitQuaternion::identity(),
                    Vector3::new(0.0, 0.0, -(i as f64) * 0.01),
                )
            })
            .collect();
        let extractor = ScriptedExtractor::new(camera, 700, poses);
        let depths: Vec<DepthImage> = (0..n_frames).map(|i| extractor.depth_image(i)).collect();

        let mut system =
            SlamSystem::new(settings, Box::new(extractor), None, None).expect("system");

        let mut last_state = TrackingState::SystemNotReady;
        for depth in &depths {
            let outcome = system.ingest_rgbd(&blank(), depth);
            last_state = outcome.state;
        }
        assert_eq!(last_state, TrackingState::Ok);

        // Give the mapper a moment to integrate the bootstrap keyframe.
        for _ in 0..300 {
            {
                let map = system.shared().map.read();
                let integrated = map
                    .keyframe(KeyFrameId(0))
                    .map_or(false, |kf| kf.num_map_points() > 0);
                if integrated && map.num_keyframes() >= 1 {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(system.tracking_state(), TrackingState::Ok);
        assert_eq!(system.trajectory().len(), n_frames);

        let mut out = Vec::new();
        system.export_trajectory(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // Header plus one row per tracked frame.
        assert_eq!(lines.len(), 1 + n_frames);
        assert!(lines[0].starts_with("timestamp,"));

        system.shutdown();
        assert!(system.shared().is_finished());
    }

    #[test]
    fn reset_clears_map_and_tracker() {
        let settings = settings();
        let camera = PinholeCamera::from_settings(&settings.camera);
        let poses = vec![SE3::identity(); 3];
        let extractor = ScriptedExtractor::new(camera, 700, poses);
        let depth = extractor.depth_image(0);

        let mut system =
            SlamSystem::new(settings, Box::new(extractor), None, None).expect("system");
        let outcome = system.ingest_rgbd(&blank(), &depth);
        assert_eq!(outcome.state, TrackingState::Ok);
        assert!(system.shared().map.read().num_keyframes() >= 1);

        system.request_reset();
        assert_eq!(system.shared().map.read().num_keyframes(), 0);
        assert_eq!(system.tracking_state(), TrackingState::NoImagesYet);
        assert!(system.shared().keyframe_index.lock().is_empty());

        system.shutdown();
    }
}
