//! Stable ids for map entities.
//!
//! The keyframe ↔ map-point graph is naturally pointer-cyclic; here both
//! sides live in arenas and refer to each other through these ids. Ids are
//! assigned sequentially and never reused, so a keyframe with a lower id is
//! always older.

/// Unique identifier for a [`super::KeyFrame`] within a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a [`super::MapPoint`] within a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}
