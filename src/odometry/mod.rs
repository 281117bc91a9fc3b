//! Self-contained visual-odometry variant.
//!
//! Tracks FAST corners with pyramidal Lucas-Kanade optical flow and
//! accumulates pose from frame-to-frame essential matrices. Unlike the
//! SLAM tracker it keeps no map and cannot hit-test; it publishes a
//! flat [`VoFrameData`] snapshot per frame for rendering overlays.

use std::time::Instant;

use anyhow::Result;
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use opencv::core::{KeyPoint, Mat, Point2f, Size, TermCriteria, Vector};
use opencv::prelude::*;
use opencv::{features2d, imgproc, video};

use crate::geometry::{estimate_relative_pose, mat4, CameraIntrinsics};

/// Tuning knobs of the visual-odometry front end.
#[derive(Debug, Clone)]
pub struct VoConfig {
    /// FAST corner threshold.
    pub fast_threshold: i32,
    pub fast_nonmax_suppression: bool,
    /// Maximum tracked corners.
    pub max_features: usize,
    /// Minimum spacing between kept corners in pixels.
    pub min_feature_distance: f32,

    /// Lucas-Kanade window size.
    pub lk_win_size: i32,
    /// Pyramid levels.
    pub lk_max_level: i32,
    /// Iteration cap.
    pub lk_max_iter: i32,
    /// Convergence epsilon.
    pub lk_epsilon: f64,

    /// Essential-matrix RANSAC threshold in pixels.
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    /// Minimum recover-pose inliers for a pose update.
    pub min_inliers: usize,
}

impl Default for VoConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            fast_nonmax_suppression: true,
            max_features: 500,
            min_feature_distance: 10.0,
            lk_win_size: 21,
            lk_max_level: 3,
            lk_max_iter: 30,
            lk_epsilon: 0.01,
            ransac_threshold: 1.0,
            ransac_confidence: 0.999,
            min_inliers: 20,
        }
    }
}

/// Accumulated camera pose as quaternion + translation.
#[derive(Debug, Clone)]
pub struct VoPose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    /// Recover-pose inlier fraction, in [0, 1].
    pub confidence: f64,
    pub valid: bool,
}

impl Default for VoPose {
    fn default() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            confidence: 0.0,
            valid: false,
        }
    }
}

/// Per-frame publication for the rendering side.
#[derive(Debug, Clone)]
pub struct VoFrameData {
    /// Flat `[x0, y0, x1, y1, ...]` feature positions.
    pub feature_positions: Vec<f32>,
    /// Flat `[size, response, id, age, ...]` per feature.
    pub feature_meta: Vec<f32>,
    pub feature_count: usize,

    /// Flat `[prev_idx, curr_idx, ...]` pairs of surviving tracks.
    pub matches: Vec<i32>,
    pub match_count: usize,

    /// Flat `[dx, dy, ...]` optical-flow deltas per surviving track.
    pub flow_vectors: Vec<f32>,

    pub pose: VoPose,

    /// Column-major view matrix `[R^T | -R^T t]`.
    pub view_matrix: [f64; 16],

    pub initialized: bool,
    pub tracking: bool,
    pub frame_number: u64,
    pub processing_time_ms: f64,
}

impl Default for VoFrameData {
    fn default() -> Self {
        Self {
            feature_positions: Vec::new(),
            feature_meta: Vec::new(),
            feature_count: 0,
            matches: Vec::new(),
            match_count: 0,
            flow_vectors: Vec::new(),
            pose: VoPose::default(),
            view_matrix: mat4::identity(),
            initialized: false,
            tracking: false,
            frame_number: 0,
            processing_time_ms: 0.0,
        }
    }
}

/// FAST + optical-flow visual odometry.
pub struct VisualOdometry {
    config: VoConfig,
    camera: CameraIntrinsics,

    prev_gray: Option<Mat>,
    prev_points: Vec<Point2f>,
    curr_points: Vec<Point2f>,
    point_ids: Vec<i32>,
    point_ages: Vec<i32>,

    r_total: Matrix3<f64>,
    t_total: Vector3<f64>,
    /// Monocular scale applied to each translation step.
    scale: f64,

    frame_count: u64,
    next_point_id: i32,
    initialized: bool,

    frame_data: VoFrameData,
}

impl VisualOdometry {
    pub fn new() -> Self {
        Self::with_config(VoConfig::default())
    }

    pub fn with_config(config: VoConfig) -> Self {
        Self {
            config,
            camera: CameraIntrinsics::default(),
            prev_gray: None,
            prev_points: Vec::new(),
            curr_points: Vec::new(),
            point_ids: Vec::new(),
            point_ages: Vec::new(),
            r_total: Matrix3::identity(),
            t_total: Vector3::zeros(),
            scale: 1.0,
            frame_count: 0,
            next_point_id: 0,
            initialized: false,
            frame_data: VoFrameData::default(),
        }
    }

    pub fn set_camera_params(&mut self, fx: f64, fy: f64, cx: f64, cy: f64) {
        self.camera = CameraIntrinsics::new(fx, fy, cx, cy);
    }

    pub fn frame_data(&self) -> &VoFrameData {
        &self.frame_data
    }

    pub fn reset(&mut self) {
        self.prev_gray = None;
        self.prev_points.clear();
        self.curr_points.clear();
        self.point_ids.clear();
        self.point_ages.clear();
        self.r_total = Matrix3::identity();
        self.t_total = Vector3::zeros();
        self.scale = 1.0;
        self.frame_count = 0;
        self.next_point_id = 0;
        self.initialized = false;
        self.frame_data = VoFrameData::default();
    }

    /// Process a grayscale (CV_8UC1) frame.
    pub fn process_frame(&mut self, gray: &Mat) -> Result<bool> {
        let started = Instant::now();

        if gray.empty() || gray.typ() != opencv::core::CV_8UC1 {
            return Ok(false);
        }

        self.frame_count += 1;

        if !self.initialized {
            // First frame: seed the corner set only.
            self.extract_features(gray)?;
            if self.curr_points.len() >= self.config.min_inliers {
                self.initialized = true;
                self.frame_data.initialized = true;
            }
        } else {
            self.track_features(gray)?;

            if self.curr_points.len() >= self.config.min_inliers {
                let pose_ok = self.estimate_pose()?;
                self.frame_data.tracking = pose_ok;
                if pose_ok {
                    self.update_view_matrix();
                }
            } else {
                self.frame_data.tracking = false;
            }

            // Replenish the corner set once it thins out.
            if self.curr_points.len() < self.config.max_features / 2 {
                self.extract_features(gray)?;
            }
        }

        self.prev_gray = Some(gray.try_clone()?);
        self.prev_points = self.curr_points.clone();

        self.publish_features();
        self.frame_data.frame_number = self.frame_count;
        self.frame_data.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(true)
    }

    /// RGBA entry point. On the first frame the intrinsics are
    /// estimated from the frame size assuming a 60 degree field of view.
    pub fn process_frame_rgba(&mut self, width: u32, height: u32, data: &[u8]) -> Result<bool> {
        if data.len() != (width as usize) * (height as usize) * 4 {
            return Ok(false);
        }

        if self.frame_count == 0 {
            let focal = width as f64 / (2.0 * (30.0f64).to_radians().tan());
            self.camera =
                CameraIntrinsics::new(focal, focal, width as f64 / 2.0, height as f64 / 2.0);
        }

        let flat = Mat::from_slice(data)?;
        let rgba = flat.reshape(4, height as i32)?;
        let mut gray = Mat::default();
        imgproc::cvt_color_def(&rgba, &mut gray, imgproc::COLOR_RGBA2GRAY)?;
        self.process_frame(&gray)
    }

    /// Detect FAST corners and top up the tracked set, keeping the
    /// configured minimum spacing to corners that already exist.
    fn extract_features(&mut self, gray: &Mat) -> Result<()> {
        let mut keypoints = Vector::<KeyPoint>::new();
        features2d::fast(
            gray,
            &mut keypoints,
            self.config.fast_threshold,
            self.config.fast_nonmax_suppression,
        )?;

        // Strongest corners first.
        let mut sorted: Vec<KeyPoint> = keypoints.iter().collect();
        sorted.sort_by(|a, b| b.response().total_cmp(&a.response()));
        sorted.truncate(self.config.max_features);

        let min_dist_sq = self.config.min_feature_distance * self.config.min_feature_distance;
        for kp in sorted {
            if self.curr_points.len() >= self.config.max_features {
                break;
            }
            let pt = kp.pt();
            let too_close = self.curr_points.iter().any(|existing| {
                let dx = pt.x - existing.x;
                let dy = pt.y - existing.y;
                dx * dx + dy * dy < min_dist_sq
            });
            if too_close {
                continue;
            }
            self.curr_points.push(pt);
            self.point_ids.push(self.next_point_id);
            self.point_ages.push(0);
            self.next_point_id += 1;
        }
        Ok(())
    }

    /// Track the previous corner set into the new frame with pyramidal
    /// LK; drops failed and out-of-bounds tracks.
    fn track_features(&mut self, gray: &Mat) -> Result<()> {
        self.frame_data.flow_vectors.clear();
        self.frame_data.matches.clear();

        let Some(prev_gray) = self.prev_gray.as_ref() else {
            return Ok(());
        };
        if self.prev_points.is_empty() {
            self.curr_points.clear();
            return Ok(());
        }

        let prev_pts = Vector::<Point2f>::from_iter(self.prev_points.iter().copied());
        let mut next_pts = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();

        let criteria = TermCriteria::new(
            opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
            self.config.lk_max_iter,
            self.config.lk_epsilon,
        )?;
        video::calc_optical_flow_pyr_lk(
            prev_gray,
            gray,
            &prev_pts,
            &mut next_pts,
            &mut status,
            &mut err,
            Size::new(self.config.lk_win_size, self.config.lk_win_size),
            self.config.lk_max_level,
            criteria,
            0,
            1e-4,
        )?;

        let cols = gray.cols() as f32;
        let rows = gray.rows() as f32;

        let mut good_prev = Vec::new();
        let mut good_curr = Vec::new();
        let mut good_ids = Vec::new();
        let mut good_ages = Vec::new();

        for i in 0..status.len() {
            if status.get(i)? == 0 {
                continue;
            }
            let next = next_pts.get(i)?;
            if next.x < 0.0 || next.x >= cols || next.y < 0.0 || next.y >= rows {
                continue;
            }
            let prev = self.prev_points[i];

            self.frame_data.flow_vectors.push(next.x - prev.x);
            self.frame_data.flow_vectors.push(next.y - prev.y);
            self.frame_data.matches.push(good_prev.len() as i32);
            self.frame_data.matches.push(good_curr.len() as i32);

            good_prev.push(prev);
            good_curr.push(next);
            good_ids.push(self.point_ids[i]);
            good_ages.push(self.point_ages[i] + 1);
        }

        self.prev_points = good_prev;
        self.curr_points = good_curr;
        self.point_ids = good_ids;
        self.point_ages = good_ages;
        self.frame_data.match_count = self.curr_points.len();
        Ok(())
    }

    /// Essential-matrix pose step over the surviving tracks; keeps only
    /// the RANSAC inliers for the next round.
    fn estimate_pose(&mut self) -> Result<bool> {
        if self.prev_points.len() < 8 || self.curr_points.len() < 8 {
            return Ok(false);
        }

        let pts1 = Vector::<Point2f>::from_iter(self.prev_points.iter().copied());
        let pts2 = Vector::<Point2f>::from_iter(self.curr_points.iter().copied());

        let rel = estimate_relative_pose(
            &pts1,
            &pts2,
            &self.camera,
            self.config.ransac_confidence,
            self.config.ransac_threshold,
        )?;
        let Some(rel) = rel else {
            return Ok(false);
        };
        if rel.inliers < self.config.min_inliers {
            return Ok(false);
        }

        // Keep inliers only.
        let mut inlier_prev = Vec::new();
        let mut inlier_curr = Vec::new();
        let mut inlier_ids = Vec::new();
        let mut inlier_ages = Vec::new();
        for (i, keep) in rel.inlier_mask.iter().enumerate() {
            if !keep {
                continue;
            }
            inlier_prev.push(self.prev_points[i]);
            inlier_curr.push(self.curr_points[i]);
            if i < self.point_ids.len() {
                inlier_ids.push(self.point_ids[i]);
                inlier_ages.push(self.point_ages[i]);
            }
        }
        self.prev_points = inlier_prev;
        self.curr_points = inlier_curr;
        self.point_ids = inlier_ids;
        self.point_ages = inlier_ages;

        // Accumulate at unit scale; monocular scale stays arbitrary.
        self.t_total += self.scale * (self.r_total * rel.translation);
        self.r_total = rel.rotation * self.r_total;

        self.frame_data.pose = VoPose {
            rotation: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
                self.r_total,
            )),
            translation: self.t_total,
            confidence: rel.inliers as f64 / self.curr_points.len().max(1) as f64,
            valid: true,
        };
        Ok(true)
    }

    /// View matrix `[R^T | -R^T t]`, column-major.
    fn update_view_matrix(&mut self) {
        let r_t = self.r_total.transpose();
        let t_view = -r_t * self.t_total;

        let mut m = [0.0; 16];
        for col in 0..3 {
            for row in 0..3 {
                m[col * 4 + row] = r_t[(row, col)];
            }
        }
        m[12] = t_view.x;
        m[13] = t_view.y;
        m[14] = t_view.z;
        m[15] = 1.0;
        self.frame_data.view_matrix = m;
    }

    /// Flat feature arrays for the rendering side. FAST keypoints carry
    /// no size, so a nominal 7 px size and unit response are published.
    fn publish_features(&mut self) {
        let data = &mut self.frame_data;
        data.feature_positions.clear();
        data.feature_meta.clear();
        data.feature_positions.reserve(self.curr_points.len() * 2);
        data.feature_meta.reserve(self.curr_points.len() * 4);

        for (i, pt) in self.curr_points.iter().enumerate() {
            data.feature_positions.push(pt.x);
            data.feature_positions.push(pt.y);

            data.feature_meta.push(7.0);
            data.feature_meta.push(1.0);
            data.feature_meta
                .push(self.point_ids.get(i).copied().unwrap_or(-1) as f32);
            data.feature_meta
                .push(self.point_ages.get(i).copied().unwrap_or(0) as f32);
        }
        data.feature_count = self.curr_points.len();
    }
}

impl Default for VisualOdometry {
    fn default() -> Self {
        Self::new()
    }
}
