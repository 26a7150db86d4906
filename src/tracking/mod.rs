//! Tracking front end: per-frame feature extraction, data association,
//! pose estimation and keyframe admission.

pub mod ekf;
pub mod frame;
pub mod initializer;
pub mod tracker;

pub use ekf::{Ekf, EkfNoise};
pub use frame::Frame;
pub use tracker::{PatternDetector, TrackOutcome, Tracker, TrajectoryRecord};

/// Tracking thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Constructed but not yet wired into a running system.
    #[default]
    SystemNotReady,
    /// Waiting for the first image.
    NoImagesYet,
    /// Images arriving, map not yet bootstrapped.
    NotInitialized,
    /// Tracking nominally.
    Ok,
    /// Tracking lost; relocalization required.
    Lost,
}
