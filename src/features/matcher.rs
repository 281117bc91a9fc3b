//! Brute-force Hamming matching over binary descriptors.
//!
//! Two modes are used by the pipeline: cross-checked one-to-one matching
//! (tracking, triangulation, loop closure) and k-nearest-neighbour
//! matching with Lowe's ratio test (image-target detection).

use anyhow::Result;
use opencv::core::{DMatch, Mat, Vector, NORM_HAMMING};
use opencv::features2d::BFMatcher;
use opencv::prelude::*;
use opencv::types::VectorOfVectorOfDMatch;

/// Lowe ratio used for k-NN target matching.
pub const GOOD_MATCH_RATIO: f32 = 0.75;

/// Hamming matcher with both matching modes.
pub struct HammingMatcher {
    cross_checked: BFMatcher,
    ratio: BFMatcher,
}

impl HammingMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            cross_checked: BFMatcher::new(NORM_HAMMING, true)?,
            ratio: BFMatcher::new(NORM_HAMMING, false)?,
        })
    }

    /// One-to-one matches that agree in both directions.
    ///
    /// Empty descriptor sets yield an empty match list rather than an
    /// OpenCV error.
    pub fn match_cross_checked(&self, query: &Mat, train: &Mat) -> Result<Vector<DMatch>> {
        let mut matches = Vector::<DMatch>::new();
        if query.empty() || train.empty() {
            return Ok(matches);
        }
        self.cross_checked
            .train_match(query, train, &mut matches, &Mat::default())?;
        Ok(matches)
    }

    /// k=2 nearest-neighbour matching filtered by Lowe's ratio test.
    pub fn knn_ratio_match(&self, query: &Mat, train: &Mat, ratio: f32) -> Result<Vector<DMatch>> {
        let mut good = Vector::<DMatch>::new();
        if query.empty() || train.empty() || train.rows() < 2 {
            return Ok(good);
        }

        let mut knn = VectorOfVectorOfDMatch::new();
        self.ratio
            .knn_train_match(query, train, &mut knn, 2, &Mat::default(), false)?;

        for pair in knn.iter() {
            if pair.len() < 2 {
                continue;
            }
            let best = pair.get(0)?;
            let second = pair.get(1)?;
            if best.distance < ratio * second.distance {
                good.push(best);
            }
        }
        Ok(good)
    }
}

/// Distance filter applied to initialization matches: keep matches
/// within `max(2 * min_distance, 30)` Hamming bits.
pub fn filter_good_matches(matches: &Vector<DMatch>) -> Vector<DMatch> {
    let mut min_dist = f32::MAX;
    for m in matches.iter() {
        if m.distance < min_dist {
            min_dist = m.distance;
        }
    }

    let cutoff = (2.0 * min_dist).max(30.0);
    let mut good = Vector::<DMatch>::new();
    for m in matches.iter() {
        if m.distance <= cutoff {
            good.push(m);
        }
    }
    good
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a descriptor Mat from 32-byte rows.
    fn descriptors(rows: &[[u8; 32]]) -> Mat {
        Mat::from_slice_2d(rows).unwrap()
    }

    fn row(fill: u8) -> [u8; 32] {
        [fill; 32]
    }

    #[test]
    fn test_cross_check_matches_identical_sets() {
        let matcher = HammingMatcher::new().unwrap();
        let set = descriptors(&[row(0x00), row(0xFF), row(0x0F)]);

        let matches = matcher.match_cross_checked(&set, &set).unwrap();
        assert_eq!(matches.len(), 3);
        for m in matches.iter() {
            assert_eq!(m.query_idx, m.train_idx);
            assert_eq!(m.distance, 0.0);
        }
    }

    #[test]
    fn test_cross_check_empty_input() {
        let matcher = HammingMatcher::new().unwrap();
        let set = descriptors(&[row(0x00)]);
        let matches = matcher.match_cross_checked(&Mat::default(), &set).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_knn_ratio_rejects_ambiguous_matches() {
        let matcher = HammingMatcher::new().unwrap();
        // Query 0 is equidistant from two train rows (2 bits each), so
        // the ratio test rejects it; query 1 has a unique exact match.
        let mut near_a = row(0xAA);
        near_a[0] ^= 0x03;
        let mut near_b = row(0xAA);
        near_b[1] ^= 0x03;

        let query = descriptors(&[row(0xAA), row(0x00)]);
        let train = descriptors(&[near_a, near_b, row(0x00)]);

        let good = matcher
            .knn_ratio_match(&query, &train, GOOD_MATCH_RATIO)
            .unwrap();

        let kept: Vec<i32> = good.iter().map(|m| m.query_idx).collect();
        assert!(!kept.contains(&0), "ambiguous query must be rejected");
        assert!(kept.contains(&1));
        assert_eq!(good.len(), 1);
    }

    #[test]
    fn test_filter_good_matches_cutoff() {
        let mut matches = Vector::<DMatch>::new();
        for (i, dist) in [5.0f32, 9.0, 40.0].iter().enumerate() {
            matches.push(DMatch::new(i as i32, i as i32, *dist).unwrap());
        }

        // min = 5 -> cutoff = max(10, 30) = 30: the 40-bit match drops.
        let good = filter_good_matches(&matches);
        assert_eq!(good.len(), 2);
        for m in good.iter() {
            assert!(m.distance <= 30.0);
        }
    }
}
