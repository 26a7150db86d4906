//! Real-time monocular / RGB-D visual SLAM core.
//!
//! Two cooperating units share a sparse map: the [`tracking`] front end
//! estimates a camera pose for every ingested frame and decides when to
//! promote one into a keyframe; the [`local_mapping`] back end consumes
//! those keyframes asynchronously, triangulates new landmarks, fuses
//! duplicates, runs local bundle adjustment over the covisibility
//! neighborhood, and culls redundancy. ORB extraction, loop closing and the
//! optimizer-free driver glue stay outside the crate behind the traits and
//! channels in [`features`] and [`system`].

pub mod camera;
pub mod config;
pub mod features;
pub mod geometry;
pub mod local_mapping;
pub mod map;
pub mod matching;
pub mod optimizer;
pub mod system;
pub mod tracking;

pub use config::{SensorKind, Settings};
pub use system::SlamSystem;
pub use tracking::{TrackOutcome, TrackingState};
