//! Frame: the transient per-image record the tracker works on.

use nalgebra::Vector3;

use crate::camera::PinholeCamera;
use crate::features::{DepthImage, Descriptor, Keypoint};
use crate::geometry::SE3;
use crate::map::{KeyFrameData, MapPointId};

/// One image's extracted features, associations and pose estimate.
///
/// Immutable once built except for the association columns
/// (`map_points` / `outliers`) and the pose, which tracking refines.
/// A frame either gets promoted into a keyframe or is dropped after the
/// next frame arrives (the tracker keeps it once, as the last frame).
#[derive(Clone)]
pub struct Frame {
    pub id: u64,
    pub timestamp: f64,

    /// Undistorted keypoints.
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// Metric depth per keypoint.
    pub depths: Vec<Option<f64>>,
    /// Virtual right-eye column per keypoint.
    pub u_right: Vec<Option<f64>>,

    /// Data association against the map, per keypoint.
    pub map_points: Vec<Option<MapPointId>>,
    /// Outlier flags from the last pose optimization.
    pub outliers: Vec<bool>,

    /// World → camera estimate; `None` until tracking assigns one.
    pub pose_cw: Option<SE3>,

    pub camera: PinholeCamera,
}

impl Frame {
    /// Build a frame from raw extractor output. Depth is sampled at the raw
    /// keypoint position (the depth map is registered to the raw image),
    /// then coordinates are undistorted so all downstream geometry lives in
    /// the ideal pinhole image.
    pub fn new(
        id: u64,
        timestamp: f64,
        features: Vec<(Keypoint, Descriptor)>,
        depth_image: Option<&DepthImage>,
        camera: PinholeCamera,
    ) -> Self {
        let n = features.len();
        let mut keypoints = Vec::with_capacity(n);
        let mut descriptors = Vec::with_capacity(n);
        let mut depths = vec![None; n];
        let mut u_right = vec![None; n];

        for (i, (kp, desc)) in features.into_iter().enumerate() {
            let raw_depth = depth_image.and_then(|img| img.at(kp.x, kp.y));
            let (ux, uy) = camera.undistort(kp.x, kp.y);
            let kp = Keypoint {
                x: ux,
                y: uy,
                ..kp
            };

            if let Some(raw) = raw_depth {
                let z = raw as f64 / camera.depth_map_factor;
                if z > 0.0 {
                    depths[i] = Some(z);
                    u_right[i] = Some(camera.right_eye_u(ux, z));
                }
            }

            keypoints.push(kp);
            descriptors.push(desc);
        }

        Self {
            id,
            timestamp,
            keypoints,
            descriptors,
            depths,
            u_right,
            map_points: vec![None; n],
            outliers: vec![false; n],
            pose_cw: None,
            camera,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn set_pose_cw(&mut self, pose: SE3) {
        self.pose_cw = Some(pose);
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.as_ref().map(|p| p.inverse().translation)
    }

    /// Whether the keypoint has reliable single-view depth.
    pub fn is_close(&self, slot: usize) -> bool {
        matches!(self.depths.get(slot), Some(Some(z)) if *z > 0.0 && *z <= self.camera.depth_threshold)
    }

    /// Back-project keypoint `slot` to world coordinates using its depth and
    /// the current pose.
    pub fn unproject(&self, slot: usize) -> Option<Vector3<f64>> {
        let z = self.depths.get(slot).copied().flatten()?;
        if z <= 0.0 {
            return None;
        }
        let pose_cw = self.pose_cw.as_ref()?;
        let kp = self.keypoints.get(slot)?;
        let p_cam = self.camera.unproject(kp.x, kp.y, z);
        Some(pose_cw.inverse().transform_point(&p_cam))
    }

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

    /// Snapshot the geometric payload for keyframe promotion.
    pub fn to_keyframe_data(&self) -> Option<KeyFrameData> {
        Some(KeyFrameData {
            source_frame_id: self.id,
            timestamp: self.timestamp,
            pose_cw: self.pose_cw.clone()?,
            keypoints: self.keypoints.clone(),
            descriptors: self.descriptors.clone(),
            depths: self.depths.clone(),
            u_right: self.u_right.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_camera() -> PinholeCamera {
    PinholeCamera::from_settings(&crate::config::CameraSettings {
        fx: 500.0,
        fy: 500.0,
        cx: 320.0,
        cy: 240.0,
        k1: 0.0,
        k2: 0.0,
        p1: 0.0,
        p2: 0.0,
        k3: 0.0,
        bf: 40.0,
        depth_threshold: 3.0,
        depth_map_factor: 1.0,
        width: 640,
        height: 480,
        fps: 30.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_features(n: usize) -> Vec<(Keypoint, Descriptor)> {
        (0..n)
            .map(|i| {
                (
                    Keypoint {
                        x: 20.0 + (i % 30) as f64 * 20.0,
                        y: 20.0 + (i / 30) as f64 * 20.0,
                        octave: 0,
                        angle: 0.0,
                    },
                    Descriptor([i as u8; 32]),
                )
            })
            .collect()
    }

    #[test]
    fn depth_columns_follow_the_depth_image() {
        let camera = test_camera();
        let depth = DepthImage::new(640, 480, vec![2.0; 640 * 480]);
        let frame = Frame::new(0, 0.0, grid_features(10), Some(&depth), camera);

        for slot in 0..frame.num_features() {
            let z = frame.depths[slot].unwrap();
            assert!((z - 2.0).abs() < 1e-9);
            let kp = &frame.keypoints[slot];
            let ur = frame.u_right[slot].unwrap();
            assert!((ur - (kp.x - camera.bf / 2.0)).abs() < 1e-9);
            assert!(frame.is_close(slot));
        }
    }

    #[test]
    fn unproject_uses_pose_and_depth() {
        let camera = test_camera();
        let depth = DepthImage::new(640, 480, vec![4.0; 640 * 480]);
        let mut frame = Frame::new(0, 0.0, grid_features(4), Some(&depth), camera);
        frame.set_pose_cw(SE3::identity());

        let p = frame.unproject(0).unwrap();
        let kp = &frame.keypoints[0];
        assert!((p - camera.unproject(kp.x, kp.y, 4.0)).norm() < 1e-9);
        // Beyond the close threshold this depth is not "close".
        assert!(!frame.is_close(0));
    }

    #[test]
    fn monocular_frames_have_no_depth() {
        let frame = Frame::new(0, 0.0, grid_features(5), None, test_camera());
        assert!(frame.depths.iter().all(|d| d.is_none()));
        assert!(frame.u_right.iter().all(|d| d.is_none()));
    }
}
