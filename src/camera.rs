//! Pinhole camera model with radial-tangential distortion.

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::config::CameraSettings;

/// Intrinsics plus the stereo/depth parameters the tracker needs.
///
/// `bf` is baseline × fx; dividing by a metric depth yields the disparity of
/// the virtual right eye. `depth_threshold` separates close points (reliable
/// from a single view) from far ones (requiring two keyframes).
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub bf: f64,
    pub depth_threshold: f64,
    pub depth_map_factor: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl PinholeCamera {
    pub fn from_settings(s: &CameraSettings) -> Self {
        Self {
            fx: s.fx,
            fy: s.fy,
            cx: s.cx,
            cy: s.cy,
            k1: s.k1,
            k2: s.k2,
            p1: s.p1,
            p2: s.p2,
            k3: s.k3,
            bf: s.bf,
            depth_threshold: s.depth_threshold,
            depth_map_factor: if s.depth_map_factor.abs() < 1e-9 {
                1.0
            } else {
                s.depth_map_factor
            },
            width: s.width,
            height: s.height,
            fps: if s.fps > 0.0 { s.fps } else { 30.0 },
        }
    }

    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn baseline(&self) -> f64 {
        if self.fx.abs() < 1e-12 {
            0.0
        } else {
            self.bf / self.fx
        }
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0 || self.k3 != 0.0
    }

    /// Project a camera-frame point to pixel coordinates. `None` behind the
    /// camera. Projection is distortion-free: keypoints are undistorted once
    /// at frame construction, so both sides of every comparison live in the
    /// ideal pinhole image.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Back-project an undistorted pixel at metric depth `z`.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) / self.fx * z, (v - self.cy) / self.fy * z, z)
    }

    /// Normalized image coordinates of an undistorted pixel.
    pub fn normalize(&self, u: f64, v: f64) -> Vector2<f64> {
        Vector2::new((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Remove lens distortion from a raw pixel (iterative inversion of the
    /// radial-tangential model).
    pub fn undistort(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }

        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;

        let mut x = xd;
        let mut y = yd;
        for _ in 0..8 {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }

        (self.fx * x + self.cx, self.fy * y + self.cy)
    }

    /// Bounds check with a small margin for projection searches.
    pub fn in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width as f64 && v >= 0.0 && v < self.height as f64
    }

    /// Disparity of the virtual right eye for a point at depth `z`.
    pub fn right_eye_u(&self, u: f64, z: f64) -> f64 {
        u - self.bf / z
    }
}
