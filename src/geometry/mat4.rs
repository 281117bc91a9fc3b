//! Column-major 4x4 matrix helpers for the embedding boundary.
//!
//! View and projection matrices cross the host boundary as flat
//! `[f64; 16]` arrays in column-major (OpenGL) layout. nalgebra stores
//! matrices column-major, so the conversions are plain copies.

use nalgebra::Matrix4;

/// Determinant magnitude below which a matrix is treated as singular.
const SINGULAR_DET_EPS: f64 = 1e-10;

/// Flatten a matrix to column-major array form.
pub fn from_matrix(m: &Matrix4<f64>) -> [f64; 16] {
    let mut out = [0.0; 16];
    out.copy_from_slice(m.as_slice());
    out
}

/// Rebuild a matrix from a column-major array.
pub fn to_matrix(a: &[f64; 16]) -> Matrix4<f64> {
    Matrix4::from_column_slice(a)
}

/// Invert a column-major 4x4 matrix.
///
/// Returns `None` when `|det| < 1e-10`.
pub fn invert(a: &[f64; 16]) -> Option<[f64; 16]> {
    let m = to_matrix(a);
    if m.determinant().abs() < SINGULAR_DET_EPS {
        return None;
    }
    m.try_inverse().map(|inv| from_matrix(&inv))
}

/// Multiply a column-major matrix by a 4-vector.
pub fn mul_vec4(a: &[f64; 16], v: [f64; 4]) -> [f64; 4] {
    let mut out = [0.0; 4];
    for (row, slot) in out.iter_mut().enumerate() {
        *slot = a[row] * v[0] + a[row + 4] * v[1] + a[row + 8] * v[2] + a[row + 12] * v[3];
    }
    out
}

/// Column-major identity.
pub fn identity() -> [f64; 16] {
    from_matrix(&Matrix4::identity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_roundtrip() {
        let id = identity();
        assert_eq!(id[0], 1.0);
        assert_eq!(id[5], 1.0);
        assert_eq!(id[1], 0.0);
        assert_eq!(to_matrix(&id), Matrix4::identity());
    }

    #[test]
    fn test_invert_identity() {
        let inv = invert(&identity()).unwrap();
        assert_eq!(inv, identity());
    }

    #[test]
    fn test_invert_singular_fails() {
        let zero = [0.0; 16];
        assert!(invert(&zero).is_none());
    }

    #[test]
    fn test_invert_roundtrip() {
        // Translation by (1, 2, 3) plus a scale on x.
        let m = Matrix4::new(
            2.0, 0.0, 0.0, 1.0,
            0.0, 1.0, 0.0, 2.0,
            0.0, 0.0, 1.0, 3.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let a = from_matrix(&m);
        let inv = invert(&a).unwrap();
        let product = to_matrix(&a) * to_matrix(&inv);
        assert_relative_eq!(product, Matrix4::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_mul_vec4_translation() {
        let m = Matrix4::new(
            1.0, 0.0, 0.0, 5.0,
            0.0, 1.0, 0.0, -1.0,
            0.0, 0.0, 1.0, 2.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let out = mul_vec4(&from_matrix(&m), [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(out, [6.0, 0.0, 3.0, 1.0]);
    }

    #[test]
    fn test_column_major_layout() {
        // Element (row 3, col 2) of the projection-style -1 entry sits at
        // flat index col*4 + row = 11.
        let mut m = Matrix4::<f64>::zeros();
        m[(3, 2)] = -1.0;
        let a = from_matrix(&m);
        assert_eq!(a[11], -1.0);
    }
}
