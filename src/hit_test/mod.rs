//! Screen-to-world hit testing against a ground plane.
//!
//! A hit test unprojects a screen pixel through the inverse projection
//! and view matrices into a world-space ray and intersects it with the
//! current ground plane. The plane is either the default `y = 0` floor
//! or one estimated by RANSAC from a point cloud.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::geometry::mat4;

/// Plane id reported for the default (or estimated) ground plane.
const GROUND_PLANE_ID: i32 = -1;

/// An infinite plane `normal . p + d = 0` with a unit normal.
#[derive(Debug, Clone, Copy)]
pub struct GroundPlane {
    pub normal: Vector3<f64>,
    pub d: f64,
}

impl GroundPlane {
    /// The default floor: `y = 0` with an upward normal.
    pub fn default_ground() -> Self {
        Self {
            normal: Vector3::new(0.0, 1.0, 0.0),
            d: 0.0,
        }
    }

    /// Signed distance of a point from the plane.
    pub fn signed_distance(&self, p: &Vector3<f64>) -> f64 {
        self.normal.dot(p) + self.d
    }
}

/// A world-space ray with a unit direction.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vector3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    pub fn point_at(&self, t: f64) -> Vector3<f64> {
        self.origin + self.direction * t
    }
}

/// A successful hit.
#[derive(Debug, Clone, Copy)]
pub struct HitResult {
    /// Intersection point in the world frame.
    pub point: Vector3<f64>,
    /// Ray parameter at the intersection (distance from the origin).
    pub distance: f64,
    pub plane_id: i32,
}

/// Ground-estimation tuning knobs.
#[derive(Debug, Clone)]
pub struct HitTesterConfig {
    pub ransac_iterations: usize,
    /// Inlier distance threshold in meters.
    pub ransac_threshold: f64,
    pub min_inliers: usize,
    /// `|normal.y|` above which a fitted plane counts as horizontal
    /// (cos of roughly 32 degrees).
    pub horizontal_threshold: f64,
}

impl Default for HitTesterConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 100,
            ransac_threshold: 0.03,
            min_inliers: 20,
            horizontal_threshold: 0.85,
        }
    }
}

/// Ground-plane estimation plus screen-ray casting.
pub struct HitTester {
    config: HitTesterConfig,
    plane: GroundPlane,
    rng: StdRng,
}

impl HitTester {
    pub fn new() -> Self {
        Self::with_config(HitTesterConfig::default())
    }

    pub fn with_config(config: HitTesterConfig) -> Self {
        Self {
            config,
            plane: GroundPlane::default_ground(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic tester for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            config: HitTesterConfig::default(),
            plane: GroundPlane::default_ground(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reinstall the default `y = 0` floor.
    pub fn set_default_ground_plane(&mut self) {
        self.plane = GroundPlane::default_ground();
    }

    pub fn ground_plane(&self) -> GroundPlane {
        self.plane
    }

    /// Estimate a horizontal ground plane from a flat `[x, y, z, ...]`
    /// point array. Keeps the previous plane and returns false when the
    /// fit fails or the best plane is not horizontal.
    pub fn estimate_ground_plane(&mut self, points: &[f64]) -> bool {
        let pts: Vec<Vector3<f64>> = points
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        if pts.len() < self.config.min_inliers {
            return false;
        }

        let Some(mut candidate) = self.fit_plane_ransac(&pts) else {
            return false;
        };

        if candidate.normal.y.abs() <= self.config.horizontal_threshold {
            debug!("ground estimate rejected: plane not horizontal");
            return false;
        }

        // Force the normal upward.
        if candidate.normal.y < 0.0 {
            candidate.normal = -candidate.normal;
            candidate.d = -candidate.d;
        }

        self.plane = candidate;
        true
    }

    fn fit_plane_ransac(&mut self, points: &[Vector3<f64>]) -> Option<GroundPlane> {
        if points.len() < 3 {
            return None;
        }

        let mut best: Option<GroundPlane> = None;
        let mut best_inliers = 0usize;

        for _ in 0..self.config.ransac_iterations {
            let (i1, i2, i3) = self.distinct_triple(points.len());

            let v1 = points[i2] - points[i1];
            let v2 = points[i3] - points[i1];
            let mut normal = v1.cross(&v2);
            let norm = normal.norm();
            if norm < 1e-6 {
                continue;
            }
            normal /= norm;
            let d = -normal.dot(&points[i1]);
            let plane = GroundPlane { normal, d };

            let inliers = points
                .iter()
                .filter(|p| plane.signed_distance(p).abs() < self.config.ransac_threshold)
                .count();

            if inliers > best_inliers {
                best_inliers = inliers;
                best = Some(plane);
            }
        }

        if best_inliers < self.config.min_inliers {
            return None;
        }
        best
    }

    fn distinct_triple(&mut self, len: usize) -> (usize, usize, usize) {
        let i1 = self.rng.gen_range(0..len);
        let mut i2 = self.rng.gen_range(0..len);
        while i2 == i1 {
            i2 = self.rng.gen_range(0..len);
        }
        let mut i3 = self.rng.gen_range(0..len);
        while i3 == i1 || i3 == i2 {
            i3 = self.rng.gen_range(0..len);
        }
        (i1, i2, i3)
    }

    /// Unproject a screen pixel into a world-space ray.
    ///
    /// Both matrices are column-major. When either matrix fails to
    /// invert, a degenerate forward ray from the origin is returned.
    pub fn screen_to_ray(
        &self,
        screen_x: f64,
        screen_y: f64,
        screen_width: u32,
        screen_height: u32,
        view: &[f64; 16],
        projection: &[f64; 16],
    ) -> Ray {
        let fallback = Ray {
            origin: Vector3::zeros(),
            direction: Vector3::new(0.0, 0.0, -1.0),
        };

        let ndc_x = 2.0 * screen_x / screen_width as f64 - 1.0;
        let ndc_y = 1.0 - 2.0 * screen_y / screen_height as f64;

        let Some(inv_proj) = mat4::invert(projection) else {
            return fallback;
        };
        let Some(inv_view) = mat4::invert(view) else {
            return fallback;
        };

        // Clip-space points on the near (z = -1) and far (z = 1) planes.
        let near_clip = [ndc_x, ndc_y, -1.0, 1.0];
        let far_clip = [ndc_x, ndc_y, 1.0, 1.0];

        let near_view = perspective_divide(mat4::mul_vec4(&inv_proj, near_clip));
        let far_view = perspective_divide(mat4::mul_vec4(&inv_proj, far_clip));

        let near_world = mat4::mul_vec4(&inv_view, [near_view[0], near_view[1], near_view[2], 1.0]);
        let far_world = mat4::mul_vec4(&inv_view, [far_view[0], far_view[1], far_view[2], 1.0]);

        let origin = Vector3::new(near_world[0], near_world[1], near_world[2]);
        let span = Vector3::new(
            far_world[0] - near_world[0],
            far_world[1] - near_world[1],
            far_world[2] - near_world[2],
        );

        let len = span.norm();
        if len < 1e-6 {
            return fallback;
        }
        Ray {
            origin,
            direction: span / len,
        }
    }

    /// Intersect a ray with a plane.
    ///
    /// `None` when the ray is parallel to the plane or the intersection
    /// lies behind the ray origin.
    pub fn ray_plane_intersect(&self, ray: &Ray, plane: &GroundPlane) -> Option<HitResult> {
        let n_dot_d = plane.normal.dot(&ray.direction);
        if n_dot_d.abs() < 1e-6 {
            return None;
        }

        let t = -(plane.normal.dot(&ray.origin) + plane.d) / n_dot_d;
        if t < 0.0 {
            return None;
        }

        Some(HitResult {
            point: ray.point_at(t),
            distance: t,
            plane_id: GROUND_PLANE_ID,
        })
    }

    /// Full hit test: screen pixel to ground-plane intersection.
    pub fn hit_test(
        &self,
        screen_x: f64,
        screen_y: f64,
        screen_width: u32,
        screen_height: u32,
        view: &[f64; 16],
        projection: &[f64; 16],
    ) -> Option<HitResult> {
        let ray = self.screen_to_ray(
            screen_x,
            screen_y,
            screen_width,
            screen_height,
            view,
            projection,
        );
        self.ray_plane_intersect(&ray, &self.plane)
    }
}

impl Default for HitTester {
    fn default() -> Self {
        Self::new()
    }
}

fn perspective_divide(v: [f64; 4]) -> [f64; 4] {
    if v[3].abs() > 1e-6 {
        [v[0] / v[3], v[1] / v[3], v[2] / v[3], 1.0]
    } else {
        v
    }
}
