//! Inter-thread messages.

use crate::map::KeyFrameId;

/// Handoff from the tracker to the local mapper: the keyframe already lives
/// in the shared map; the mapper integrates it (observations, covisibility,
/// triangulation) when it pops the message.
#[derive(Debug, Clone, Copy)]
pub struct NewKeyFrame {
    pub keyframe_id: KeyFrameId,
}
