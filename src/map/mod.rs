//! The shared map graph: keyframes, map points, covisibility.

pub mod keyframe;
pub mod keyframe_index;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::{KeyFrame, KeyFrameData};
pub use keyframe_index::{Candidate, KeyFrameIndex};
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
