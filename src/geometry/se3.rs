//! Rigid transforms in SE(3).
//!
//! A pose is stored as a unit quaternion plus a translation. Throughout the
//! crate the authoritative quantity is `T_cw` (world → camera): transforming
//! a world point with a keyframe pose yields camera coordinates. Helpers for
//! the inverse convention are provided where the camera center is needed.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::so3::skew;

/// A rigid transform: `p' = R p + t`.
#[derive(Clone, Debug, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix and translation vector.
    pub fn from_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = nalgebra::Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: `(self ∘ other)(p) = self(other(p))`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Axis-angle + translation parameterization used by the optimizers.
    pub fn to_params(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.rotation.scaled_axis(), self.translation)
    }

    pub fn from_params(axis_angle: &Vector3<f64>, translation: &Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(*axis_angle),
            translation: *translation,
        }
    }
}

impl std::ops::Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

/// Essential matrix of the relative motion `T_12 = (R_12, t_12)`.
///
/// `E = [t_12]× R_12`; points satisfy `x2ᵀ E x1 = 0` in normalized
/// coordinates when `T_12` maps camera-1 coordinates into camera 2.
pub fn essential_from_motion(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}
