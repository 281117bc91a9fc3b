//! PnP (Perspective-n-Point) solver using OpenCV.

use anyhow::Result;
use nalgebra::Vector3;
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Point3d};
use opencv::prelude::*;

use crate::geometry::two_view::mat3_from_cv;
use crate::geometry::{CameraIntrinsics, SE3};

/// RANSAC iteration budget.
const PNP_ITERATIONS: i32 = 100;

/// Reprojection threshold in pixels.
const PNP_REPROJECTION_PX: f32 = 8.0;

/// RANSAC confidence.
const PNP_CONFIDENCE: f64 = 0.99;

/// Solve PnP with RANSAC given 3D-2D correspondences.
///
/// Returns the camera-from-object transform (OpenCV's native output):
/// `x_cam = pose.transform_point(&x_obj)`. When the object points are
/// expressed in the world frame, invert the result to obtain the
/// world-from-camera pose. Returns `Ok(None)` when the solver reports
/// failure or fewer than 6 correspondences are supplied.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Point2f],
    camera: &CameraIntrinsics,
) -> Result<Option<SE3>> {
    if points3d.len() < 6 || points3d.len() != points2d.len() {
        return Ok(None);
    }

    let pts3d: Vec<Point3d> = points3d
        .iter()
        .map(|p| Point3d::new(p.x, p.y, p.z))
        .collect();
    let obj_points = Mat::from_slice(&pts3d)?.try_clone()?;
    let img_points = Mat::from_slice(points2d)?.try_clone()?;

    let camera_matrix = camera.k_mat()?;
    let dist_coeffs = CameraIntrinsics::zero_distortion()?;

    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let mut inliers = Mat::default();

    let ok = calib3d::solve_pnp_ransac(
        &obj_points,
        &img_points,
        &camera_matrix,
        &dist_coeffs,
        &mut rvec,
        &mut tvec,
        false,
        PNP_ITERATIONS,
        PNP_REPROJECTION_PX,
        PNP_CONFIDENCE,
        &mut inliers,
        calib3d::SOLVEPNP_ITERATIVE,
    )?;

    if !ok {
        return Ok(None);
    }

    let mut rot_mat = Mat::default();
    calib3d::rodrigues(&rvec, &mut rot_mat, &mut opencv::core::no_array())?;
    let rotation = mat3_from_cv(&rot_mat)?;
    let translation = Vector3::new(
        *tvec.at::<f64>(0)?,
        *tvec.at::<f64>(1)?,
        *tvec.at::<f64>(2)?,
    );

    Ok(Some(SE3::from_rt(rotation, translation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    /// Generate image points from a known camera-from-world pose and
    /// check the solver recovers it.
    #[test]
    fn test_recovers_known_pose() {
        let camera = CameraIntrinsics::default();
        let truth = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.04, 0.01),
            translation: Vector3::new(0.1, -0.05, 0.2),
        };

        let mut world = Vec::new();
        let mut image = Vec::new();
        for i in 0..40 {
            let p = Vector3::new(
                ((i % 5) as f64 - 2.0) * 0.4,
                ((i / 5) as f64 - 3.5) * 0.3,
                3.0 + ((i * 3) % 7) as f64 * 0.2,
            );
            let p_cam = truth.transform_point(&p);
            let (u, v) = camera.project(&p_cam).unwrap();
            world.push(p);
            image.push(Point2f::new(u as f32, v as f32));
        }

        let pose = solve_pnp_ransac(&world, &image, &camera)
            .unwrap()
            .expect("solver should succeed on clean correspondences");

        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-3);
        let angle = pose.rotation.angle_to(&truth.rotation);
        assert!(angle < 1e-3, "rotation error {angle} too large");
    }

    #[test]
    fn test_too_few_points_fails() {
        let camera = CameraIntrinsics::default();
        let world = vec![Vector3::new(0.0, 0.0, 1.0); 4];
        let image = vec![Point2f::new(320.0, 240.0); 4];
        assert!(solve_pnp_ransac(&world, &image, &camera).unwrap().is_none());
    }
}
