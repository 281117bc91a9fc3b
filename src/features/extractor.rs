//! ORB feature extraction.
//!
//! Two extractor profiles exist in the pipeline: the tracker runs with a
//! 2000-feature budget for spatial coverage, the image-target path with
//! 1000 features per template and per probe frame.

use anyhow::Result;
use opencv::core::{KeyPoint, Mat, Ptr, Vector};
use opencv::features2d::{ORB, ORB_ScoreType};
use opencv::prelude::*;

/// Feature budget for the SLAM tracker.
pub const TRACKER_MAX_FEATURES: i32 = 2000;

/// Feature budget for image-target templates and probe frames.
pub const TARGET_MAX_FEATURES: i32 = 1000;

/// Keypoints with their 256-bit binary descriptors (one row each).
#[derive(Clone)]
pub struct FeatureSet {
    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// ORB detector/descriptor wrapper.
pub struct FeatureExtractor {
    orb: Ptr<ORB>,
}

impl FeatureExtractor {
    /// Create an extractor with the given feature budget.
    ///
    /// Pyramid scale 1.2 over 8 levels, Harris corner score, FAST
    /// threshold 20 — tuned for handheld mobile footage.
    pub fn new(max_features: i32) -> Result<Self> {
        let orb = ORB::create(
            max_features,
            1.2,
            8,
            31,
            0,
            2,
            ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        Ok(Self { orb })
    }

    /// Detect keypoints and compute descriptors on a grayscale image.
    pub fn detect(&mut self, image: &Mat) -> Result<FeatureSet> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        self.orb
            .detect_and_compute(image, &Mat::default(), &mut keypoints, &mut descriptors, false)?;
        Ok(FeatureSet {
            keypoints,
            descriptors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1};

    fn flat_image() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, CV_8UC1, Scalar::all(128.0)).unwrap()
    }

    #[test]
    fn test_flat_image_yields_no_features() {
        let mut extractor = FeatureExtractor::new(TRACKER_MAX_FEATURES).unwrap();
        let features = extractor.detect(&flat_image()).unwrap();
        assert!(features.is_empty());
        assert_eq!(features.descriptors.rows(), 0);
    }

    #[test]
    fn test_feature_budget_is_respected() {
        let mut extractor = FeatureExtractor::new(50).unwrap();
        let features = extractor.detect(&flat_image()).unwrap();
        assert!(features.len() <= 50);
    }
}
