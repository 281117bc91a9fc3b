//! Facade implementing the embedding contract.
//!
//! `ArTracker` is the single entry point a host embeds: it accepts RGBA
//! frames, exposes the view and projection matrices for a column-major
//! right-handed GL pipeline, and proxies the target, plane and hit-test
//! queries. All methods are frame-serial; nothing blocks and nothing is
//! shared across instances.

use anyhow::Result;
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use tracing::warn;

use crate::geometry::{mat4, CameraIntrinsics};
use crate::hit_test::{HitResult, HitTester};
use crate::planes::DetectedPlane;
use crate::targets::DetectedTarget;
use crate::tracking::{BundleAdjuster, Tracker};

/// Top-level AR tracking engine.
pub struct ArTracker {
    tracker: Tracker,
    hit_tester: HitTester,
}

impl ArTracker {
    pub fn new() -> Result<Self> {
        Self::with_intrinsics(CameraIntrinsics::default())
    }

    pub fn with_intrinsics(camera: CameraIntrinsics) -> Result<Self> {
        Ok(Self {
            tracker: Tracker::new(camera)?,
            hit_tester: HitTester::new(),
        })
    }

    /// Process one packed-RGBA frame. Returns whether tracking (or an
    /// initialization step) succeeded. A buffer whose length is not
    /// `width * height * 4` fails as a plain boolean, not an error.
    pub fn process_frame(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<bool> {
        if rgba.len() != (width as usize) * (height as usize) * 4 {
            warn!(
                "frame buffer size mismatch: got {}, want {}",
                rgba.len(),
                (width as usize) * (height as usize) * 4
            );
            return Ok(false);
        }

        let gray = rgba_to_gray(width, height, rgba)?;
        self.tracker.process_frame(&gray)
    }

    /// World-to-camera matrix, column-major — the inverse of the
    /// current camera pose.
    pub fn view_matrix(&self) -> [f64; 16] {
        mat4::from_matrix(&self.tracker.current_pose().inverse().to_homogeneous())
    }

    /// Column-major GL projection for the given viewport.
    pub fn projection_matrix(&self, width: u32, height: u32) -> [f64; 16] {
        self.tracker.camera().projection_matrix(width, height)
    }

    pub fn is_initialized(&self) -> bool {
        self.tracker.is_initialized()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker.is_tracking()
    }

    pub fn map_point_count(&self) -> i32 {
        self.tracker.map().num_map_points() as i32
    }

    pub fn keyframe_count(&self) -> i32 {
        self.tracker.map().num_keyframes() as i32
    }

    // ─────────────────────────────────────────────────────────────────
    // Image targets
    // ─────────────────────────────────────────────────────────────────

    /// Register a packed-RGBA image target with its physical width in
    /// meters. Returns the target id, or -1 on failure.
    pub fn add_image_target(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
        name: &str,
        width_m: f64,
    ) -> Result<i32> {
        if rgba.len() != (width as usize) * (height as usize) * 4 {
            warn!("target '{name}': buffer size mismatch");
            return Ok(-1);
        }
        let gray = rgba_to_gray(width, height, rgba)?;
        self.tracker
            .target_tracker_mut()
            .add_target(&gray, name, width_m, None)
    }

    pub fn target_count(&self) -> i32 {
        self.tracker.target_tracker().target_count() as i32
    }

    /// Most recent image-target detections.
    pub fn detected_targets(&self) -> Vec<DetectedTarget> {
        self.tracker.target_tracker().detections().to_vec()
    }

    // ─────────────────────────────────────────────────────────────────
    // Planes
    // ─────────────────────────────────────────────────────────────────

    pub fn detected_planes(&self) -> Vec<DetectedPlane> {
        self.tracker.plane_detector().planes().to_vec()
    }

    // ─────────────────────────────────────────────────────────────────
    // Hit testing
    // ─────────────────────────────────────────────────────────────────

    /// Estimate the ground plane from a flat `[x, y, z, ...]` array.
    pub fn estimate_ground_plane(&mut self, points: &[f64]) -> bool {
        self.hit_tester.estimate_ground_plane(points)
    }

    /// Raycast a screen pixel against the ground plane using the
    /// engine's current view and projection matrices.
    pub fn hit_test(&self, screen_x: f64, screen_y: f64, width: u32, height: u32) -> Option<HitResult> {
        let view = self.view_matrix();
        let projection = self.projection_matrix(width, height);
        self.hit_tester
            .hit_test(screen_x, screen_y, width, height, &view, &projection)
    }

    pub fn hit_tester(&self) -> &HitTester {
        &self.hit_tester
    }

    pub fn hit_tester_mut(&mut self) -> &mut HitTester {
        &mut self.hit_tester
    }

    // ─────────────────────────────────────────────────────────────────
    // Configuration and control
    // ─────────────────────────────────────────────────────────────────

    /// Override the camera intrinsics (defaults assume a 640x480
    /// sensor with f = 500).
    pub fn set_intrinsics(&mut self, fx: f64, fy: f64, cx: f64, cy: f64) {
        self.tracker.set_camera(CameraIntrinsics::new(fx, fy, cx, cy));
    }

    /// Install a local bundle-adjustment hook.
    pub fn set_bundle_adjuster(&mut self, adjuster: Box<dyn BundleAdjuster>) {
        self.tracker.set_bundle_adjuster(adjuster);
    }

    /// Revert all tracking state; registered targets survive, and the
    /// ground plane returns to the default floor.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.hit_tester.set_default_ground_plane();
    }
}

/// Convert a packed-RGBA buffer to a grayscale Mat.
fn rgba_to_gray(width: u32, height: u32, rgba: &[u8]) -> Result<Mat> {
    let flat = Mat::from_slice(rgba)?;
    let rgba_mat = flat.reshape(4, height as i32)?;
    debug_assert_eq!(rgba_mat.cols(), width as i32);

    let mut gray = Mat::default();
    imgproc::cvt_color_def(&rgba_mat, &mut gray, imgproc::COLOR_RGBA2GRAY)?;
    Ok(gray)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gray_rgba(width: u32, height: u32, value: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            buf.extend_from_slice(&[value, value, value, 255]);
        }
        buf
    }

    #[test]
    fn test_buffer_size_mismatch_fails_as_boolean() {
        let mut tracker = ArTracker::new().unwrap();
        let short = vec![0u8; 100];
        assert!(!tracker.process_frame(640, 480, &short).unwrap());
        assert!(!tracker.is_initialized());
    }

    #[test]
    fn test_featureless_stream_stays_uninitialized() {
        let mut tracker = ArTracker::new().unwrap();
        let frame = gray_rgba(640, 480, 128);

        for _ in 0..10 {
            assert!(!tracker.process_frame(640, 480, &frame).unwrap());
        }

        assert!(!tracker.is_initialized());
        assert!(!tracker.is_tracking());
        assert_eq!(tracker.map_point_count(), 0);
        assert_eq!(tracker.keyframe_count(), 0);
    }

    #[test]
    fn test_initial_view_matrix_is_identity() {
        let tracker = ArTracker::new().unwrap();
        assert_eq!(tracker.view_matrix(), mat4::identity());
    }

    #[test]
    fn test_projection_matrix_shape() {
        let tracker = ArTracker::new().unwrap();
        let p = tracker.projection_matrix(640, 480);

        assert_relative_eq!(p[0], 2.0 * 500.0 / 640.0, epsilon = 1e-12);
        assert_relative_eq!(p[5], 2.0 * 500.0 / 480.0, epsilon = 1e-12);
        assert_eq!(p[11], -1.0);
        assert_eq!(p[15], 0.0);
    }

    #[test]
    fn test_hit_test_from_startup_pose_misses_floor() {
        // Identity pose looks along -z, parallel to the default floor.
        let tracker = ArTracker::new().unwrap();
        let hit = tracker.hit_test(320.0, 240.0, 640, 480);
        assert!(hit.is_none());
    }

    #[test]
    fn test_add_target_rejects_featureless_image() {
        let mut tracker = ArTracker::new().unwrap();
        let blank = gray_rgba(200, 200, 255);

        let id = tracker
            .add_image_target(200, 200, &blank, "blank", 0.2)
            .unwrap();
        assert_eq!(id, -1);
        assert_eq!(tracker.target_count(), 0);
        assert!(tracker.detected_targets().is_empty());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut tracker = ArTracker::new().unwrap();
        let frame = gray_rgba(640, 480, 60);
        tracker.process_frame(640, 480, &frame).unwrap();

        tracker.reset();

        assert!(!tracker.is_initialized());
        assert_eq!(tracker.map_point_count(), 0);
        assert_eq!(tracker.view_matrix(), mat4::identity());
        let plane = tracker.hit_tester().ground_plane();
        assert_eq!(plane.normal.y, 1.0);
        assert_eq!(plane.d, 0.0);
    }
}
