//! A retained frame anchoring the map.

use opencv::core::{KeyPoint, Mat, Vector};
use opencv::prelude::*;

use crate::geometry::SE3;

use super::types::{KeyFrameId, MapPointId};

/// A keyframe: image snapshot, features, pose and map-point linkage.
///
/// The image and descriptors are owned deep copies so the caller's frame
/// buffer can be reused immediately after insertion. `map_point_ids`
/// runs parallel to `keypoints`; a `None` slot means the keypoint has no
/// triangulated counterpart yet.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Grayscale snapshot, retained for loop detection.
    pub image: Mat,

    /// World-from-camera pose at insertion time.
    pub pose: SE3,

    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,

    /// Map-point link per keypoint. Always the same length as
    /// `keypoints`.
    pub map_point_ids: Vec<Option<MapPointId>>,
}

impl KeyFrame {
    /// Create a keyframe from owned snapshots of the frame data.
    pub fn new(
        id: KeyFrameId,
        image: Mat,
        pose: SE3,
        keypoints: Vector<KeyPoint>,
        descriptors: Mat,
    ) -> Self {
        let num_features = keypoints.len();
        Self {
            id,
            image,
            pose,
            keypoints,
            descriptors,
            map_point_ids: vec![None; num_features],
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Map point linked to the given keypoint, if any.
    pub fn map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Link a keypoint to a map point. Out-of-range indices are ignored.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) {
        if let Some(slot) = self.map_point_ids.get_mut(feature_idx) {
            *slot = Some(mp_id);
        }
    }

    /// Number of keypoints with a linked map point.
    pub fn num_linked(&self) -> usize {
        self.map_point_ids.iter().filter(|m| m.is_some()).count()
    }

    /// Camera centre in the world frame.
    pub fn camera_center(&self) -> nalgebra::Vector3<f64> {
        self.pose.translation
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("num_features", &self.num_features())
            .field("num_linked", &self.num_linked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe_with_features(n: usize) -> KeyFrame {
        let mut keypoints = Vector::<KeyPoint>::new();
        for i in 0..n {
            keypoints.push(
                KeyPoint::new_coords(i as f32, i as f32, 7.0, -1.0, 0.0, 0, -1).unwrap(),
            );
        }
        KeyFrame::new(
            KeyFrameId(0),
            Mat::default(),
            SE3::identity(),
            keypoints,
            Mat::default(),
        )
    }

    #[test]
    fn test_links_run_parallel_to_keypoints() {
        let kf = keyframe_with_features(5);
        assert_eq!(kf.map_point_ids.len(), kf.keypoints.len());
        assert_eq!(kf.num_linked(), 0);
    }

    #[test]
    fn test_set_and_get_map_point() {
        let mut kf = keyframe_with_features(4);

        kf.set_map_point(2, MapPointId(9));
        assert_eq!(kf.map_point(2), Some(MapPointId(9)));
        assert_eq!(kf.map_point(0), None);
        assert_eq!(kf.num_linked(), 1);

        // Out of range is a no-op.
        kf.set_map_point(99, MapPointId(1));
        assert_eq!(kf.num_linked(), 1);
    }
}
