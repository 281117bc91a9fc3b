//! Loop-closure detection over retained keyframes.
//!
//! Candidate search is a brute-force descriptor comparison against all
//! sufficiently old keyframes. A confirmed loop triggers the local
//! bundle-adjustment hook; the default hook leaves poses unchanged and
//! exists so hosts can plug in a nonlinear refiner.

use anyhow::Result;
use opencv::prelude::*;
use tracing::info;

use crate::features::HammingMatcher;
use crate::map::{KeyFrameId, MapStore};

/// Keyframes younger than this id gap are never loop candidates.
const MIN_KEYFRAME_GAP: u64 = 5;

/// Hamming distance under which a match counts toward a candidate.
const LOOP_MATCH_DISTANCE: f32 = 40.0;

/// Minimum good-match count for a loop hit.
const MIN_LOOP_MATCHES: usize = 50;

/// Extension point invoked after a detected loop.
pub trait BundleAdjuster {
    /// Refine the map after the loop `current` ↔ `candidate`.
    fn adjust(&mut self, map: &mut MapStore, current: KeyFrameId, candidate: KeyFrameId);
}

/// Default hook: logs and leaves the map untouched.
pub struct NoopBundleAdjuster;

impl BundleAdjuster for NoopBundleAdjuster {
    fn adjust(&mut self, _map: &mut MapStore, current: KeyFrameId, candidate: KeyFrameId) {
        info!("local bundle adjustment hook invoked for {current} ↔ {candidate}");
    }
}

/// Search for a loop candidate for a just-inserted keyframe.
///
/// Compares against every keyframe at least [`MIN_KEYFRAME_GAP`] ids
/// older than `current`; the candidate with the highest good-match
/// count wins, provided the count exceeds [`MIN_LOOP_MATCHES`].
pub fn detect_loop(
    map: &MapStore,
    current: KeyFrameId,
    matcher: &HammingMatcher,
) -> Result<Option<KeyFrameId>> {
    let Some(current_kf) = map.keyframe(current) else {
        return Ok(None);
    };
    if current_kf.descriptors.empty() {
        return Ok(None);
    }

    let mut best: Option<KeyFrameId> = None;
    let mut best_count = MIN_LOOP_MATCHES;

    for kf in map.keyframes() {
        if kf.id.0 + MIN_KEYFRAME_GAP >= current.0 {
            continue;
        }

        let matches = matcher.match_cross_checked(&kf.descriptors, &current_kf.descriptors)?;
        let good = matches
            .iter()
            .filter(|m| m.distance < LOOP_MATCH_DISTANCE)
            .count();

        if good > best_count {
            best_count = good;
            best = Some(kf.id);
        }
    }

    if let Some(candidate) = best {
        info!("loop closure detected: {current} ↔ {candidate} ({best_count} matches)");
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use opencv::core::{KeyPoint, Mat, Vector};

    fn add_keyframe(map: &mut MapStore, descriptors: Mat) -> KeyFrameId {
        let mut keypoints = Vector::<KeyPoint>::new();
        for i in 0..descriptors.rows() {
            keypoints.push(
                KeyPoint::new_coords(i as f32, 0.0, 7.0, -1.0, 0.0, 0, -1).unwrap(),
            );
        }
        map.create_keyframe(Mat::default(), SE3::identity(), keypoints, descriptors)
    }

    /// 60 distinct descriptor rows; enough for a loop hit when repeated.
    fn block(seed: u8) -> Mat {
        let rows: Vec<[u8; 32]> = (0..60)
            .map(|i| {
                let mut r = [seed; 32];
                r[0] = i as u8;
                r
            })
            .collect();
        Mat::from_slice_2d(&rows).unwrap()
    }

    #[test]
    fn test_recent_keyframes_are_not_candidates() {
        let mut map = MapStore::new();
        let matcher = HammingMatcher::new().unwrap();

        // Identical appearance but all within the id gap.
        for _ in 0..5 {
            add_keyframe(&mut map, block(0xAB));
        }
        let current = add_keyframe(&mut map, block(0xAB));

        let hit = detect_loop(&map, current, &matcher).unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn test_revisited_appearance_is_detected() {
        let mut map = MapStore::new();
        let matcher = HammingMatcher::new().unwrap();

        let old = add_keyframe(&mut map, block(0xAB));
        // Distinct filler keyframes to satisfy the id gap.
        for seed in 1..=6u8 {
            add_keyframe(&mut map, block(seed.wrapping_mul(17)));
        }
        let current = add_keyframe(&mut map, block(0xAB));

        let hit = detect_loop(&map, current, &matcher).unwrap();
        assert_eq!(hit, Some(old));
    }

    #[test]
    fn test_noop_adjuster_leaves_poses() {
        let mut map = MapStore::new();
        let a = add_keyframe(&mut map, block(1));
        let b = add_keyframe(&mut map, block(2));
        let pose_before = map.keyframe(a).unwrap().pose.clone();

        NoopBundleAdjuster.adjust(&mut map, b, a);
        assert_eq!(map.keyframe(a).unwrap().pose, pose_before);
    }
}
