//! Triangulation of new map points between keyframe pairs.
//!
//! For every cross-checked descriptor match between two keyframes whose
//! left keypoint is not yet linked to a map point, a 3D point is solved
//! by DLT from the two pixel projections and validated by depth in the
//! creating keyframe's camera frame.

use anyhow::Result;
use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3};
use opencv::prelude::*;
use tracing::debug;

use crate::features::HammingMatcher;
use crate::geometry::{CameraIntrinsics, SE3};
use crate::map::{KeyFrameId, MapStore};

/// Maximum descriptor distance for a triangulation match.
const MAX_TRIANGULATION_DISTANCE: f32 = 50.0;

/// Homogeneous scale below which a solution is degenerate.
const MIN_HOMOGENEOUS_W: f64 = 1e-6;

/// Match two keyframes and create map points for validated
/// triangulations. Returns the number of points created.
pub fn triangulate_new_points(
    map: &mut MapStore,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    camera: &CameraIntrinsics,
    matcher: &HammingMatcher,
) -> Result<usize> {
    // Snapshot the pieces we need so the store can be mutated below.
    let (kf1_pose, kf1_keypoints, kf1_descriptors, kf1_links) = match map.keyframe(kf1_id) {
        Some(kf) => (
            kf.pose.clone(),
            kf.keypoints.clone(),
            kf.descriptors.try_clone()?,
            kf.map_point_ids.clone(),
        ),
        None => return Ok(0),
    };
    let (kf2_pose, kf2_keypoints, kf2_descriptors) = match map.keyframe(kf2_id) {
        Some(kf) => (
            kf.pose.clone(),
            kf.keypoints.clone(),
            kf.descriptors.try_clone()?,
        ),
        None => return Ok(0),
    };

    let matches = matcher.match_cross_checked(&kf1_descriptors, &kf2_descriptors)?;

    let p1 = pixel_projection(camera, &kf1_pose);
    let p2 = pixel_projection(camera, &kf2_pose);
    let kf1_from_world = kf1_pose.inverse();

    let mut created = 0usize;
    for m in matches.iter() {
        if m.distance > MAX_TRIANGULATION_DISTANCE {
            continue;
        }

        let idx1 = m.query_idx as usize;
        let idx2 = m.train_idx as usize;

        // Already linked from an earlier triangulation pass.
        if kf1_links.get(idx1).copied().flatten().is_some() {
            continue;
        }

        let (Ok(kp1), Ok(kp2)) = (kf1_keypoints.get(idx1), kf2_keypoints.get(idx2)) else {
            continue;
        };

        let world = match triangulate_pair(
            &p1,
            &p2,
            (kp1.pt().x as f64, kp1.pt().y as f64),
            (kp2.pt().x as f64, kp2.pt().y as f64),
        ) {
            Some(p) => p,
            None => continue,
        };

        // Depth check in the creating keyframe's camera frame.
        if kf1_from_world.transform_point(&world).z <= 0.0 {
            continue;
        }

        let descriptor = kf1_descriptors.row(idx1 as i32)?.try_clone()?;
        let mp_id = map.create_map_point(world, descriptor);
        map.link(kf1_id, idx1, mp_id);
        map.link(kf2_id, idx2, mp_id);
        created += 1;
    }

    if created > 0 {
        debug!(
            "triangulated {created} new points between {kf1_id} and {kf2_id} ({} matches)",
            matches.len()
        );
    }
    Ok(created)
}

/// 3x4 pixel projection matrix `K * T_cw[:3,:]` for a world-from-camera
/// pose.
pub fn pixel_projection(camera: &CameraIntrinsics, pose_wc: &SE3) -> SMatrix<f64, 3, 4> {
    let k = Matrix3::new(
        camera.fx, 0.0, camera.cx,
        0.0, camera.fy, camera.cy,
        0.0, 0.0, 1.0,
    );
    let t_cw = pose_wc.inverse();
    let r = t_cw.rotation_matrix();

    let mut rt = SMatrix::<f64, 3, 4>::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_cw.translation);
    k * rt
}

/// DLT triangulation of one pixel correspondence.
///
/// Returns the dehomogenized world point, or `None` when the homogeneous
/// scale collapses (`|w| < 1e-6`).
pub fn triangulate_pair(
    p1: &SMatrix<f64, 3, 4>,
    p2: &SMatrix<f64, 3, 4>,
    x1: (f64, f64),
    x2: (f64, f64),
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = x1.0 * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = x1.1 * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = x2.0 * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = x2.1 * p2[(2, j)] - p2[(1, j)];
    }

    // Solution is the right singular vector of the smallest singular
    // value.
    let svd = a.svd(true, true);
    let v = svd.v_t?.transpose();
    let h = v.column(3);

    if h[3].abs() < MIN_HOMOGENEOUS_W {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_triangulate_pair_recovers_point() {
        let camera = CameraIntrinsics::default();
        let pose1 = SE3::identity();
        let pose2 = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.2, 0.0, 0.0),
        };

        let world = Vector3::new(0.3, -0.1, 4.0);
        let project = |pose: &SE3| {
            let p_cam = pose.inverse().transform_point(&world);
            camera.project(&p_cam).unwrap()
        };

        let p1 = pixel_projection(&camera, &pose1);
        let p2 = pixel_projection(&camera, &pose2);
        let recovered = triangulate_pair(&p1, &p2, project(&pose1), project(&pose2))
            .expect("triangulation should succeed");

        assert_relative_eq!(recovered, world, epsilon = 1e-6);
    }

    #[test]
    fn test_triangulate_pair_with_rotated_second_view() {
        let camera = CameraIntrinsics::default();
        let pose1 = SE3::identity();
        let pose2 = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, -0.1, 0.0),
            translation: Vector3::new(0.5, 0.05, 0.0),
        };

        let world = Vector3::new(-0.4, 0.2, 3.0);
        let uv1 = camera
            .project(&pose1.inverse().transform_point(&world))
            .unwrap();
        let uv2 = camera
            .project(&pose2.inverse().transform_point(&world))
            .unwrap();

        let p1 = pixel_projection(&camera, &pose1);
        let p2 = pixel_projection(&camera, &pose2);
        let recovered = triangulate_pair(&p1, &p2, uv1, uv2).unwrap();

        assert_relative_eq!(recovered, world, epsilon = 1e-6);
    }

    #[test]
    fn test_projection_matrix_projects_like_camera() {
        let camera = CameraIntrinsics::default();
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, 0.2, -0.05),
            translation: Vector3::new(0.3, -0.2, 0.1),
        };
        let world = Vector3::new(0.5, 0.5, 5.0);

        let p = pixel_projection(&camera, &pose);
        let homog = p * nalgebra::Vector4::new(world.x, world.y, world.z, 1.0);
        let (u, v) = (homog[0] / homog[2], homog[1] / homog[2]);

        let expected = camera
            .project(&pose.inverse().transform_point(&world))
            .unwrap();
        assert_relative_eq!(u, expected.0, epsilon = 1e-9);
        assert_relative_eq!(v, expected.1, epsilon = 1e-9);
    }
}
