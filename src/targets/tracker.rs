//! Image-target registration and per-frame detection.
//!
//! Targets are planar image markers registered up front with a physical
//! width. Detection matches target descriptors into the frame with a
//! ratio test, validates the match set with a homography and a convexity
//! gate on the projected corners, then solves PnP on metric object
//! points to recover the marker pose.

use anyhow::Result;
use nalgebra::Vector3;
use opencv::core::{count_non_zero, perspective_transform, Mat, Point2f, Vector};
use opencv::imgproc::is_contour_convex;
use opencv::prelude::*;
use opencv::calib3d;
use tracing::{debug, info};

use crate::features::{FeatureExtractor, HammingMatcher, GOOD_MATCH_RATIO, TARGET_MAX_FEATURES};
use crate::geometry::{solve_pnp_ransac, CameraIntrinsics, SE3};

/// A registered planar marker template.
pub struct ImageTarget {
    pub id: i32,
    pub name: String,
    /// Grayscale template.
    pub image: Mat,
    pub keypoints: Vector<opencv::core::KeyPoint>,
    pub descriptors: Mat,
    /// Physical size in meters.
    pub width_m: f64,
    pub height_m: f64,
}

/// One per-frame detection result.
#[derive(Clone)]
pub struct DetectedTarget {
    pub target_id: i32,
    pub name: String,
    /// World-from-marker transform (marker origin at the template
    /// centre, z = 0 plane).
    pub pose: SE3,
    /// Projected template corners in frame pixels, clockwise from the
    /// template's top-left.
    pub corners: [Point2f; 4],
    /// Homography inliers over good matches, in [0, 1].
    pub confidence: f64,
    pub is_tracking: bool,
}

impl DetectedTarget {
    /// Pose flattened row-major, as serialized across the embedding
    /// boundary.
    pub fn pose_row_major(&self) -> [f64; 16] {
        let m = self.pose.to_homogeneous();
        let mut out = [0.0; 16];
        for row in 0..4 {
            for col in 0..4 {
                out[row * 4 + col] = m[(row, col)];
            }
        }
        out
    }
}

/// Target-tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Minimum keypoints at registration and minimum good matches /
    /// homography inliers at detection.
    pub min_matches: usize,
    /// Lowe ratio for k-NN matching.
    pub good_match_ratio: f32,
    /// Homography RANSAC reprojection threshold in pixels.
    pub homography_threshold: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            min_matches: 15,
            good_match_ratio: GOOD_MATCH_RATIO,
            homography_threshold: 5.0,
        }
    }
}

/// Registry of image targets plus the most recent detection results.
pub struct ImageTargetTracker {
    config: TargetConfig,
    extractor: FeatureExtractor,
    matcher: HammingMatcher,
    targets: Vec<ImageTarget>,
    detections: Vec<DetectedTarget>,
    next_target_id: i32,
}

impl ImageTargetTracker {
    pub fn new() -> Result<Self> {
        Self::with_config(TargetConfig::default())
    }

    pub fn with_config(config: TargetConfig) -> Result<Self> {
        Ok(Self {
            config,
            extractor: FeatureExtractor::new(TARGET_MAX_FEATURES)?,
            matcher: HammingMatcher::new()?,
            targets: Vec::new(),
            detections: Vec::new(),
            next_target_id: 0,
        })
    }

    /// Register a grayscale template. `height_m` defaults to the width
    /// scaled by the template's aspect ratio. Returns the target id, or
    /// -1 when the template is empty or too feature-poor to track.
    pub fn add_target(
        &mut self,
        gray: &Mat,
        name: &str,
        width_m: f64,
        height_m: Option<f64>,
    ) -> Result<i32> {
        if gray.empty() {
            debug!("target '{name}': empty template");
            return Ok(-1);
        }

        let features = self.extractor.detect(gray)?;
        if features.len() < self.config.min_matches {
            debug!(
                "target '{name}': only {} keypoints, need {}",
                features.len(),
                self.config.min_matches
            );
            return Ok(-1);
        }

        let height_m = match height_m {
            Some(h) if h > 0.0 => h,
            _ => width_m * gray.rows() as f64 / gray.cols() as f64,
        };

        let id = self.next_target_id;
        self.next_target_id += 1;
        info!(
            "target {id} '{name}' registered ({} keypoints, {width_m:.2}x{height_m:.2} m)",
            features.len()
        );
        self.targets.push(ImageTarget {
            id,
            name: name.to_string(),
            image: gray.try_clone()?,
            keypoints: features.keypoints,
            descriptors: features.descriptors,
            width_m,
            height_m,
        });
        Ok(id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Detect all registered targets in a frame. `camera_pose` is the
    /// current world-from-camera transform used to lift the PnP result
    /// into the world frame. Returns whether anything was detected.
    pub fn detect(
        &mut self,
        frame: &Mat,
        camera: &CameraIntrinsics,
        camera_pose: &SE3,
    ) -> Result<bool> {
        self.detections.clear();
        if self.targets.is_empty() || frame.empty() {
            return Ok(false);
        }

        let frame_features = self.extractor.detect(frame)?;
        if frame_features.len() < self.config.min_matches {
            return Ok(false);
        }

        for target in &self.targets {
            if target.descriptors.empty() {
                continue;
            }

            let good = self.matcher.knn_ratio_match(
                &target.descriptors,
                &frame_features.descriptors,
                self.config.good_match_ratio,
            )?;
            if good.len() < self.config.min_matches {
                continue;
            }

            let mut src = Vector::<Point2f>::new();
            let mut dst = Vector::<Point2f>::new();
            for m in good.iter() {
                src.push(target.keypoints.get(m.query_idx as usize)?.pt());
                dst.push(frame_features.keypoints.get(m.train_idx as usize)?.pt());
            }

            let mut mask = Mat::default();
            let homography = calib3d::find_homography(
                &src,
                &dst,
                &mut mask,
                calib3d::RANSAC,
                self.config.homography_threshold,
            )?;
            if homography.empty() {
                continue;
            }

            let inliers = count_non_zero(&mask)? as usize;
            if inliers < self.config.min_matches {
                continue;
            }

            let Some(corners) = project_corners(target, &homography)? else {
                continue;
            };

            let Some(cam_from_marker) = solve_marker_pose(target, &src, &dst, camera)? else {
                continue;
            };

            let detected = DetectedTarget {
                target_id: target.id,
                name: target.name.clone(),
                pose: camera_pose * &cam_from_marker,
                corners,
                confidence: inliers as f64 / good.len() as f64,
                is_tracking: true,
            };
            info!(
                "target '{}' detected (confidence {:.0}%)",
                detected.name,
                detected.confidence * 100.0
            );
            self.detections.push(detected);
        }

        Ok(!self.detections.is_empty())
    }

    pub fn detections(&self) -> &[DetectedTarget] {
        &self.detections
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.targets.retain(|t| t.id != target_id);
    }

    pub fn clear_targets(&mut self) {
        self.targets.clear();
        self.detections.clear();
        self.next_target_id = 0;
    }

    pub fn clear_detections(&mut self) {
        self.detections.clear();
    }
}

/// Push the template's corners through the homography and keep the quad
/// only when it stays convex.
fn project_corners(target: &ImageTarget, homography: &Mat) -> Result<Option<[Point2f; 4]>> {
    let cols = target.image.cols() as f32;
    let rows = target.image.rows() as f32;

    let mut template_corners = Vector::<Point2f>::new();
    template_corners.push(Point2f::new(0.0, 0.0));
    template_corners.push(Point2f::new(cols, 0.0));
    template_corners.push(Point2f::new(cols, rows));
    template_corners.push(Point2f::new(0.0, rows));

    let mut projected = Vector::<Point2f>::new();
    perspective_transform(&template_corners, &mut projected, homography)?;

    if !is_contour_convex(&projected)? {
        return Ok(None);
    }

    Ok(Some([
        projected.get(0)?,
        projected.get(1)?,
        projected.get(2)?,
        projected.get(3)?,
    ]))
}

/// PnP on metric object points: each matched template pixel maps to the
/// marker plane z = 0 with the origin at the template centre.
fn solve_marker_pose(
    target: &ImageTarget,
    src: &Vector<Point2f>,
    dst: &Vector<Point2f>,
    camera: &CameraIntrinsics,
) -> Result<Option<SE3>> {
    let cols = target.image.cols() as f64;
    let rows = target.image.rows() as f64;

    let mut object_points = Vec::with_capacity(src.len());
    let mut image_points = Vec::with_capacity(dst.len());
    for (s, d) in src.iter().zip(dst.iter()) {
        let x = (s.x as f64 / cols - 0.5) * target.width_m;
        let y = (s.y as f64 / rows - 0.5) * target.height_m;
        object_points.push(Vector3::new(x, y, 0.0));
        image_points.push(d);
    }

    solve_pnp_ransac(&object_points, &image_points, camera)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use opencv::core::{Scalar, CV_8UC1};

    #[test]
    fn test_flat_template_is_rejected() {
        let mut tracker = ImageTargetTracker::new().unwrap();
        let flat = Mat::new_rows_cols_with_default(200, 200, CV_8UC1, Scalar::all(200.0)).unwrap();

        let id = tracker.add_target(&flat, "blank", 0.2, None).unwrap();
        assert_eq!(id, -1);
        assert_eq!(tracker.target_count(), 0);
    }

    #[test]
    fn test_empty_template_is_rejected() {
        let mut tracker = ImageTargetTracker::new().unwrap();
        let id = tracker.add_target(&Mat::default(), "nothing", 0.2, None).unwrap();
        assert_eq!(id, -1);
    }

    #[test]
    fn test_detect_without_targets_is_false() {
        let mut tracker = ImageTargetTracker::new().unwrap();
        let frame = Mat::new_rows_cols_with_default(480, 640, CV_8UC1, Scalar::all(90.0)).unwrap();

        let hit = tracker
            .detect(&frame, &CameraIntrinsics::default(), &SE3::identity())
            .unwrap();
        assert!(!hit);
        assert!(tracker.detections().is_empty());
    }

    #[test]
    fn test_pose_row_major_layout() {
        let mut pose = SE3::identity();
        pose.translation = Vector3::new(1.0, 2.0, 3.0);
        let detected = DetectedTarget {
            target_id: 0,
            name: "t".into(),
            pose,
            corners: [Point2f::new(0.0, 0.0); 4],
            confidence: 1.0,
            is_tracking: true,
        };

        let flat = detected.pose_row_major();
        // Row-major: translation occupies indices 3, 7, 11.
        assert_relative_eq!(flat[3], 1.0);
        assert_relative_eq!(flat[7], 2.0);
        assert_relative_eq!(flat[11], 3.0);
        assert_relative_eq!(flat[15], 1.0);
        assert_relative_eq!(flat[0], 1.0);
    }

    #[test]
    fn test_convexity_gate() {
        // An identity homography keeps the rectangle convex.
        let target = ImageTarget {
            id: 0,
            name: "t".into(),
            image: Mat::new_rows_cols_with_default(100, 100, CV_8UC1, Scalar::all(0.0)).unwrap(),
            keypoints: Vector::new(),
            descriptors: Mat::default(),
            width_m: 0.2,
            height_m: 0.2,
        };
        let identity = Mat::from_slice_2d(&[
            [1.0f64, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ])
        .unwrap();

        let corners = project_corners(&target, &identity).unwrap().unwrap();
        assert_relative_eq!(corners[2].x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(corners[2].y, 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_object_point_mapping_is_centred() {
        // The template centre must map to the marker origin.
        let target = ImageTarget {
            id: 0,
            name: "t".into(),
            image: Mat::new_rows_cols_with_default(100, 200, CV_8UC1, Scalar::all(0.0)).unwrap(),
            keypoints: Vector::new(),
            descriptors: Mat::default(),
            width_m: 0.4,
            height_m: 0.2,
        };

        let cols = target.image.cols() as f64;
        let rows = target.image.rows() as f64;
        let centre_x = (100.0 / cols - 0.5) * target.width_m;
        let corner_x = (0.0 / cols - 0.5) * target.width_m;
        let corner_y = (0.0 / rows - 0.5) * target.height_m;

        assert_relative_eq!(centre_x, 0.0);
        assert_relative_eq!(corner_x, -0.2);
        assert_relative_eq!(corner_y, -0.1);
    }
}
