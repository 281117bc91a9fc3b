//! SE(3) rigid-body transform used for all camera and marker poses.
//!
//! Poses are stored as rotation + translation rather than a raw 4x4
//! matrix; the homogeneous form is only materialized at the embedding
//! boundary. Throughout the crate a pose is world-from-camera (T_wc):
//! `p_world = pose.transform_point(&p_cam)`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// Rigid-body transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and translation vector.
    ///
    /// The matrix must be a proper rotation (det ≈ +1); it is not
    /// re-orthogonalized here.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Inverse transform: if `self` maps camera to world, the result
    /// maps world to camera.
    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Compose two transforms: `self` then applied after `rhs`,
    /// i.e. `(a * b).transform_point(p) == a.transform_point(&b.transform_point(p))`.
    pub fn compose(&self, rhs: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4x4 form (rotation top-left, translation last column).
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Rebuild from a homogeneous 4x4 matrix. The bottom row is ignored.
    pub fn from_homogeneous(m: &Matrix4<f64>) -> Self {
        let rotation: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into();
        let translation: Vector3<f64> = m.fixed_view::<3, 1>(0, 3).into();
        Self::from_rt(rotation, translation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_transform() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert_eq!(SE3::identity().transform_point(&p), p);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.3, -0.2, 0.7),
            translation: Vector3::new(0.5, 1.0, -2.0),
        };
        let p = Vector3::new(2.0, 0.1, 4.0);

        let q = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(q, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, FRAC_PI_2, 0.0),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0),
            translation: Vector3::new(0.0, 2.0, 0.0),
        };
        let p = Vector3::new(0.3, -0.4, 0.5);

        let composed = (&a * &b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }

    #[test]
    fn test_homogeneous_roundtrip() {
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(-0.4, 0.9, 0.2),
            translation: Vector3::new(-1.0, 0.25, 3.0),
        };
        let back = SE3::from_homogeneous(&pose.to_homogeneous());

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(
            back.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_homogeneous_bottom_row() {
        let m = SE3::identity().to_homogeneous();
        assert_eq!(m.row(3).into_owned(), nalgebra::RowVector4::new(0.0, 0.0, 0.0, 1.0));
    }
}
