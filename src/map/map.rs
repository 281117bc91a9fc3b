//! Map store: owner of all keyframes and map points.
//!
//! The store is mutated only by the tracker. Other components read
//! snapshots (descriptor batches, point positions) and never hold
//! references into the store across frames.

use std::collections::HashMap;

use anyhow::Result;
use nalgebra::Vector3;
use opencv::core::{KeyPoint, Mat, Vector};
use opencv::prelude::*;

use crate::geometry::SE3;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Container for the SLAM graph.
pub struct MapStore {
    /// Keyframes in insertion order; `KeyFrameId(i)` lives at index `i`.
    keyframes: Vec<KeyFrame>,

    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,
}

impl MapStore {
    pub fn new() -> Self {
        Self {
            keyframes: Vec::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────

    /// Create a keyframe from owned frame snapshots and return its id.
    pub fn create_keyframe(
        &mut self,
        image: Mat,
        pose: SE3,
        keypoints: Vector<KeyPoint>,
        descriptors: Mat,
    ) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes
            .push(KeyFrame::new(id, image, pose, keypoints, descriptors));
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(id.0 as usize)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(id.0 as usize)
    }

    pub fn keyframes(&self) -> &[KeyFrame] {
        &self.keyframes
    }

    pub fn last_keyframe(&self) -> Option<&KeyFrame> {
        self.keyframes.last()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────
    // MapPoints
    // ─────────────────────────────────────────────────────────────────

    /// Create a map point and return its id. The descriptor must be an
    /// owned Mat.
    pub fn create_map_point(&mut self, world_pos: Vector3<f64>, descriptor: Mat) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, world_pos, descriptor));
        id
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Link a keyframe keypoint to a map point, recording the
    /// observation on the point. Returns false when either id is stale.
    pub fn link(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return false;
        };
        let Some(kf) = self.keyframes.get_mut(kf_id.0 as usize) else {
            return false;
        };
        kf.set_map_point(feature_idx, mp_id);
        mp.add_observation(kf_id);
        true
    }

    // ─────────────────────────────────────────────────────────────────
    // Snapshots for matching and geometry services
    // ─────────────────────────────────────────────────────────────────

    /// Descriptors of all non-bad map points stacked into one Mat, with
    /// the parallel list of point ids. Row `i` belongs to `ids[i]`.
    pub fn descriptor_batch(&self) -> Result<(Mat, Vec<MapPointId>)> {
        let mut batch = Mat::default();
        let mut ids = Vec::new();

        let mut sorted: Vec<&MapPoint> = self.map_points.values().collect();
        sorted.sort_by_key(|mp| mp.id);

        for mp in sorted {
            if mp.is_bad || mp.descriptor.empty() {
                continue;
            }
            batch.push_back(&mp.descriptor)?;
            ids.push(mp.id);
        }
        Ok((batch, ids))
    }

    /// World positions of all non-bad map points.
    pub fn world_positions(&self) -> Vec<Vector3<f64>> {
        let mut sorted: Vec<&MapPoint> = self.map_points.values().collect();
        sorted.sort_by_key(|mp| mp.id);
        sorted
            .into_iter()
            .filter(|mp| !mp.is_bad)
            .map(|mp| mp.world_pos)
            .collect()
    }

    /// Drop everything and restart id assignment.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapStore")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_keyframe(map: &mut MapStore) -> KeyFrameId {
        map.create_keyframe(
            Mat::default(),
            SE3::identity(),
            Vector::new(),
            Mat::default(),
        )
    }

    fn descriptor_row(fill: u8) -> Mat {
        Mat::from_slice_2d(&[[fill; 32]]).unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut map = MapStore::new();
        let a = empty_keyframe(&mut map);
        let b = empty_keyframe(&mut map);
        assert!(a < b);

        let p = map.create_map_point(Vector3::zeros(), Mat::default());
        let q = map.create_map_point(Vector3::zeros(), Mat::default());
        assert!(p < q);
        assert_eq!(map.num_keyframes(), 2);
        assert_eq!(map.num_map_points(), 2);
    }

    #[test]
    fn test_link_records_observation_on_both_sides() {
        let mut map = MapStore::new();
        let kf_id = map.create_keyframe(
            Mat::default(),
            SE3::identity(),
            {
                let mut kps = Vector::<KeyPoint>::new();
                for i in 0..3 {
                    kps.push(
                        KeyPoint::new_coords(i as f32, 0.0, 7.0, -1.0, 0.0, 0, -1).unwrap(),
                    );
                }
                kps
            },
            Mat::default(),
        );
        let mp_id = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), descriptor_row(1));

        assert!(map.link(kf_id, 1, mp_id));
        assert_eq!(map.keyframe(kf_id).unwrap().map_point(1), Some(mp_id));
        assert_eq!(
            map.map_point(mp_id).unwrap().observations,
            vec![kf_id]
        );

        // Stale ids fail without touching anything.
        assert!(!map.link(KeyFrameId(99), 0, mp_id));
        assert!(!map.link(kf_id, 0, MapPointId(99)));
    }

    #[test]
    fn test_descriptor_batch_skips_bad_points() {
        let mut map = MapStore::new();
        let good = map.create_map_point(Vector3::zeros(), descriptor_row(1));
        let bad = map.create_map_point(Vector3::zeros(), descriptor_row(2));
        map.map_point_mut(bad).unwrap().mark_bad();

        let (batch, ids) = map.descriptor_batch().unwrap();
        assert_eq!(batch.rows(), 1);
        assert_eq!(ids, vec![good]);
    }

    #[test]
    fn test_world_positions_skip_bad_points() {
        let mut map = MapStore::new();
        map.create_map_point(Vector3::new(1.0, 0.0, 0.0), descriptor_row(1));
        let bad = map.create_map_point(Vector3::new(2.0, 0.0, 0.0), descriptor_row(2));
        map.map_point_mut(bad).unwrap().mark_bad();

        let positions = map.world_positions();
        assert_eq!(positions, vec![Vector3::new(1.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_clear_restarts_ids() {
        let mut map = MapStore::new();
        empty_keyframe(&mut map);
        map.create_map_point(Vector3::zeros(), Mat::default());

        map.clear();
        assert_eq!(map.num_keyframes(), 0);
        assert_eq!(map.num_map_points(), 0);
        assert_eq!(empty_keyframe(&mut map), KeyFrameId(0));
    }
}
