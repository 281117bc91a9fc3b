//! Two-view relative pose from the essential matrix.
//!
//! Wraps OpenCV's `findEssentialMat` + `recoverPose` pair. The returned
//! transform maps points from the first camera's frame into the second:
//! `x2 = R * x1 + t`, with `t` at unit scale (monocular).

use anyhow::Result;
use nalgebra::{Matrix3, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Vector};
use opencv::prelude::*;

use crate::geometry::CameraIntrinsics;

/// Relative pose recovered from an essential matrix.
pub struct RelativePose {
    /// Rotation of camera 2 relative to camera 1.
    pub rotation: Matrix3<f64>,
    /// Translation direction (unit scale).
    pub translation: Vector3<f64>,
    /// Number of correspondences passing the cheirality check.
    pub inliers: usize,
    /// Per-correspondence inlier flags after pose recovery.
    pub inlier_mask: Vec<bool>,
}

/// Estimate the relative pose between two pixel-correspondence sets.
///
/// Returns `Ok(None)` when the essential matrix is degenerate (empty or
/// not 3x3); RANSAC runs with the given confidence and pixel threshold.
pub fn estimate_relative_pose(
    points1: &Vector<Point2f>,
    points2: &Vector<Point2f>,
    camera: &CameraIntrinsics,
    confidence: f64,
    threshold_px: f64,
) -> Result<Option<RelativePose>> {
    if points1.len() < 8 || points2.len() < 8 {
        return Ok(None);
    }

    let k = camera.k_mat()?;
    let mut mask = Mat::default();
    let essential = calib3d::find_essential_mat(
        points1,
        points2,
        &k,
        calib3d::RANSAC,
        confidence,
        threshold_px,
        1000,
        &mut mask,
    )?;

    if essential.empty() || essential.rows() != 3 || essential.cols() != 3 {
        return Ok(None);
    }

    let mut r = Mat::default();
    let mut t = Mat::default();
    let inliers =
        calib3d::recover_pose_estimated(&essential, points1, points2, &k, &mut r, &mut t, &mut mask)?;

    let mut inlier_mask = Vec::with_capacity(points1.len());
    for i in 0..mask.rows() {
        inlier_mask.push(*mask.at::<u8>(i)? != 0);
    }

    Ok(Some(RelativePose {
        rotation: mat3_from_cv(&r)?,
        translation: Vector3::new(*t.at::<f64>(0)?, *t.at::<f64>(1)?, *t.at::<f64>(2)?),
        inliers: inliers.max(0) as usize,
        inlier_mask,
    }))
}

/// Convert an OpenCV 3x3 CV_64F Mat to nalgebra.
pub(crate) fn mat3_from_cv(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut arr = [0.0f64; 9];
    for (i, slot) in arr.iter_mut().enumerate() {
        *slot = *mat.at::<f64>(i as i32)?;
    }
    Ok(Matrix3::from_row_slice(&arr))
}
