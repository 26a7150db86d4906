//! Extended Kalman filter motion model.
//!
//! Tracks the camera state (position, orientation, linear and angular
//! velocity) and produces the pose prior for the next frame. The filter is
//! strictly a prior source: optimized poses are authoritative and fed back
//! through [`Ekf::update`], which also corrects the velocity estimate
//! through the cross covariance. An exogenous measurement vector (odometry,
//! inertial velocity) can override the velocity block of the prediction.

use nalgebra::{SMatrix, SVector, UnitQuaternion, Vector3};

use crate::geometry::SE3;

type Mat12 = SMatrix<f64, 12, 12>;
type Mat6x12 = SMatrix<f64, 6, 12>;
type Mat6 = SMatrix<f64, 6, 6>;
type Vec12 = SVector<f64, 12>;
type Vec6 = SVector<f64, 6>;

/// Process/measurement noise configuration.
#[derive(Debug, Clone)]
pub struct EkfNoise {
    /// Linear acceleration density (drives velocity drift).
    pub accel: f64,
    /// Angular acceleration density.
    pub alpha: f64,
    /// Position measurement noise.
    pub meas_position: f64,
    /// Orientation measurement noise (radians).
    pub meas_rotation: f64,
}

impl Default for EkfNoise {
    fn default() -> Self {
        Self {
            accel: 4.0,
            alpha: 2.0,
            meas_position: 1e-3,
            meas_rotation: 1e-3,
        }
    }
}

/// Error-state EKF over (p, q, v, ω).
///
/// Position and orientation describe the camera in the world (`R_wc`, camera
/// center); the produced prior is the world → camera transform the tracker
/// expects.
pub struct Ekf {
    position: Vector3<f64>,
    orientation: UnitQuaternion<f64>,
    velocity: Vector3<f64>,
    angular_velocity: Vector3<f64>,
    covariance: Mat12,
    noise: EkfNoise,
    updates: usize,
    exogenous: Option<Vec<f64>>,
}

impl Ekf {
    pub fn new(noise: EkfNoise) -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            covariance: Mat12::identity() * 1e-2,
            noise,
            updates: 0,
            exogenous: None,
        }
    }

    /// Feed an external measurement vector: `[vx, vy, vz]` or
    /// `[vx, vy, vz, wx, wy, wz]` in world/body frame. Consumed by the next
    /// prediction.
    pub fn set_measurements(&mut self, measurements: &[f64]) {
        if measurements.len() >= 3 {
            self.exogenous = Some(measurements.to_vec());
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.updates >= 2
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.velocity
    }

    /// Propagate the state by `dt` and return the pose prior (world →
    /// camera). `None` until at least one update has seeded the state.
    pub fn predict(&mut self, dt: f64) -> Option<SE3> {
        if self.updates == 0 || dt <= 0.0 {
            return None;
        }

        if let Some(m) = self.exogenous.take() {
            self.velocity = Vector3::new(m[0], m[1], m[2]);
            if m.len() >= 6 {
                self.angular_velocity = Vector3::new(m[3], m[4], m[5]);
            }
        }

        self.position += self.velocity * dt;
        self.orientation =
            self.orientation * UnitQuaternion::from_scaled_axis(self.angular_velocity * dt);

        // F = I with dt couplings position←velocity, orientation←angular.
        let mut f = Mat12::identity();
        for i in 0..3 {
            f[(i, 6 + i)] = dt;
            f[(3 + i, 9 + i)] = dt;
        }
        let mut q = Mat12::zeros();
        let qa = self.noise.accel * self.noise.accel * dt * dt;
        let qw = self.noise.alpha * self.noise.alpha * dt * dt;
        for i in 0..3 {
            q[(i, i)] = 0.25 * qa * dt * dt;
            q[(3 + i, 3 + i)] = 0.25 * qw * dt * dt;
            q[(6 + i, 6 + i)] = qa;
            q[(9 + i, 9 + i)] = qw;
        }
        self.covariance = f * self.covariance * f.transpose() + q;

        Some(self.pose_wc().inverse())
    }

    /// Correct the state with an optimized pose (world → camera).
    pub fn update(&mut self, pose_cw: &SE3, dt: f64) {
        let pose_wc = pose_cw.inverse();
        let p_m = pose_wc.translation;
        let q_m = pose_wc.rotation;

        match self.updates {
            0 => {
                self.position = p_m;
                self.orientation = q_m;
            }
            1 => {
                // Seed the velocities from the first pose delta.
                if dt > 0.0 {
                    self.velocity = (p_m - self.position) / dt;
                    self.angular_velocity =
                        (self.orientation.inverse() * q_m).scaled_axis() / dt;
                }
                self.position = p_m;
                self.orientation = q_m;
            }
            _ => {
                let residual_p = p_m - self.position;
                let residual_q = (self.orientation.inverse() * q_m).scaled_axis();
                let mut z = Vec6::zeros();
                for i in 0..3 {
                    z[i] = residual_p[i];
                    z[3 + i] = residual_q[i];
                }

                let mut h = Mat6x12::zeros();
                for i in 0..6 {
                    h[(i, i)] = 1.0;
                }
                let mut r = Mat6::zeros();
                for i in 0..3 {
                    r[(i, i)] = self.noise.meas_position * self.noise.meas_position;
                    r[(3 + i, 3 + i)] = self.noise.meas_rotation * self.noise.meas_rotation;
                }

                let s = h * self.covariance * h.transpose() + r;
                let Some(s_inv) = s.try_inverse() else {
                    // Degenerate innovation covariance: fall back to a hard reset
                    // of the pose block.
                    self.position = p_m;
                    self.orientation = q_m;
                    self.updates += 1;
                    return;
                };
                let k = self.covariance * h.transpose() * s_inv;
                let dx: Vec12 = k * z;

                self.position += Vector3::new(dx[0], dx[1], dx[2]);
                self.orientation = self.orientation
                    * UnitQuaternion::from_scaled_axis(Vector3::new(dx[3], dx[4], dx[5]));
                self.velocity += Vector3::new(dx[6], dx[7], dx[8]);
                self.angular_velocity += Vector3::new(dx[9], dx[10], dx[11]);
                self.covariance = (Mat12::identity() - k * h) * self.covariance;
            }
        }
        self.updates += 1;
    }

    pub fn reset(&mut self) {
        let noise = self.noise.clone();
        *self = Ekf::new(noise);
    }

    fn pose_wc(&self) -> SE3 {
        SE3::new(self.orientation, self.position)
    }
}

impl Default for Ekf {
    fn default() -> Self {
        Self::new(EkfNoise::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_cw_at(t: f64) -> SE3 {
        // Camera moving along +x at 1 unit/s, no rotation.
        SE3::new(UnitQuaternion::identity(), Vector3::new(t, 0.0, 0.0)).inverse()
    }

    #[test]
    fn no_prior_before_first_update() {
        let mut ekf = Ekf::default();
        assert!(ekf.predict(0.033).is_none());
    }

    #[test]
    fn constant_velocity_prediction_converges() {
        let mut ekf = Ekf::default();
        let dt = 0.1;
        for i in 0..20 {
            let t = i as f64 * dt;
            ekf.predict(dt);
            ekf.update(&pose_cw_at(t), dt);
        }
        assert!(ekf.is_initialized());
        assert!((ekf.velocity() - Vector3::new(1.0, 0.0, 0.0)).norm() < 0.05);

        let prior = ekf.predict(dt).unwrap();
        let expected = pose_cw_at(2.0);
        let err = (prior.inverse().translation - expected.inverse().translation).norm();
        assert!(err < 0.05, "prediction error {err}");
    }

    #[test]
    fn update_overrides_divergent_prediction() {
        let mut ekf = Ekf::default();
        let dt = 0.1;
        ekf.update(&pose_cw_at(0.0), dt);
        ekf.update(&pose_cw_at(0.1), dt);
        // Diverge: predict far ahead several times without corrections.
        for _ in 0..5 {
            ekf.predict(dt);
        }
        // One correction snaps the pose estimate back near the measurement.
        ekf.update(&pose_cw_at(0.2), dt);
        let prior = ekf.predict(1e-9).unwrap();
        let center = prior.inverse().translation;
        assert!((center - Vector3::new(0.2, 0.0, 0.0)).norm() < 0.1);
    }

    #[test]
    fn exogenous_velocity_feeds_the_prior() {
        let mut ekf = Ekf::default();
        ekf.update(&pose_cw_at(0.0), 0.1);
        ekf.update(&pose_cw_at(0.0), 0.1); // stationary so far
        ekf.set_measurements(&[0.0, 0.0, 2.0]);
        let prior = ekf.predict(0.5).unwrap();
        let center = prior.inverse().translation;
        assert!((center - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-6);
    }
}
