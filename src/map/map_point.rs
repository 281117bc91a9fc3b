//! A 3D landmark triangulated from keyframe pairs.

use nalgebra::Vector3;
use opencv::core::Mat;

use super::types::{KeyFrameId, MapPointId};

/// A sparse map point.
///
/// Holds one representative descriptor (a cloned row from the keyframe
/// that created it) and the ids of the keyframes that observed it. Bad
/// points are excluded from matching but never physically removed, so
/// ids stay stable.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in the world frame (monocular arbitrary scale).
    pub world_pos: Vector3<f64>,

    /// Representative 256-bit descriptor. Must be an owned Mat, not a
    /// row view into a keyframe's descriptor block.
    pub descriptor: Mat,

    /// Keyframes that observed this point, in observation order.
    pub observations: Vec<KeyFrameId>,

    /// Number of times the point has been matched.
    pub match_count: u32,

    /// Monotonic bad flag.
    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(id: MapPointId, world_pos: Vector3<f64>, descriptor: Mat) -> Self {
        Self {
            id,
            world_pos,
            descriptor,
            observations: Vec::new(),
            match_count: 1,
            is_bad: false,
        }
    }

    /// Record an observation from a keyframe.
    pub fn add_observation(&mut self, kf_id: KeyFrameId) {
        self.observations.push(kf_id);
        self.match_count += 1;
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Mark the point bad. There is no way back.
    pub fn mark_bad(&mut self) {
        self.is_bad = true;
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("world_pos", &self.world_pos)
            .field("observations", &self.observations.len())
            .field("match_count", &self.match_count)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_point() -> MapPoint {
        MapPoint::new(
            MapPointId(0),
            Vector3::new(0.5, -0.2, 3.0),
            Mat::default(),
        )
    }

    #[test]
    fn test_observations_bump_match_count() {
        let mut mp = test_point();
        assert_eq!(mp.match_count, 1);

        mp.add_observation(KeyFrameId(0));
        mp.add_observation(KeyFrameId(1));

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.match_count, 3);
        assert_eq!(mp.observations, vec![KeyFrameId(0), KeyFrameId(1)]);
    }

    #[test]
    fn test_mark_bad_is_monotonic() {
        let mut mp = test_point();
        assert!(!mp.is_bad);
        mp.mark_bad();
        assert!(mp.is_bad);
        mp.mark_bad();
        assert!(mp.is_bad);
    }
}
