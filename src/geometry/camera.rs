//! Pinhole camera intrinsics and the renderer-facing projection matrix.

use anyhow::Result;
use opencv::core::Mat;
use opencv::prelude::*;

/// Near clip distance of the rendering projection (meters).
pub const PROJECTION_NEAR: f64 = 0.01;

/// Far clip distance of the rendering projection (meters).
pub const PROJECTION_FAR: f64 = 1000.0;

/// Pinhole intrinsics (no distortion model; frames are assumed
/// undistorted by the host).
///
/// The defaults bake in a 640x480 mobile sensor; hosts with calibrated
/// cameras should override them via [`CameraIntrinsics::new`] or the
/// facade's `set_intrinsics`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        }
    }
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// 3x3 camera matrix K as an OpenCV Mat (CV_64F).
    pub fn k_mat(&self) -> Result<Mat> {
        let k = Mat::from_slice_2d(&[
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ])?
        .try_clone()?;
        Ok(k)
    }

    /// Zero distortion coefficients (4x1, CV_64F).
    pub fn zero_distortion() -> Result<Mat> {
        Ok(Mat::zeros(4, 1, opencv::core::CV_64F)?.to_mat()?)
    }

    /// OpenGL-style perspective projection built from pixel intrinsics,
    /// as a column-major `[f64; 16]` array.
    ///
    /// Uses the fixed clip range [`PROJECTION_NEAR`, `PROJECTION_FAR`].
    /// With the principal point at the viewport centre, unprojecting the
    /// centre pixel yields the ray (0, 0, -1) in view space.
    pub fn projection_matrix(&self, width: u32, height: u32) -> [f64; 16] {
        let (w, h) = (width as f64, height as f64);
        let (near, far) = (PROJECTION_NEAR, PROJECTION_FAR);

        let mut m = [0.0; 16];
        // Column-major: flat index = col * 4 + row.
        m[0] = 2.0 * self.fx / w;
        m[5] = 2.0 * self.fy / h;
        m[8] = 1.0 - 2.0 * self.cx / w;
        m[9] = 2.0 * self.cy / h - 1.0;
        m[10] = -(far + near) / (far - near);
        m[11] = -1.0;
        m[14] = -2.0 * far * near / (far - near);
        m
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` when the point is at or behind the camera plane.
    pub fn project(&self, p_cam: &nalgebra::Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let u = self.fx * p_cam.x / p_cam.z + self.cx;
        let v = self.fy * p_cam.y / p_cam.z + self.cy;
        Some((u, v))
    }
}
