//! Id types for map entities.
//!
//! Keyframes and map points cross-reference each other by integer id
//! rather than shared pointers, which keeps the map graph free of
//! ownership cycles. Ids are assigned sequentially and are strictly
//! monotonic for the lifetime of a map instance.

/// Identifier of a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Identifier of a map point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}
