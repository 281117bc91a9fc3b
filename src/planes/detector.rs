//! RANSAC extraction of dominant planar surfaces from the sparse map.
//!
//! Each invocation peels up to three planes off the supplied point
//! cloud. Detected planes persist across invocations and newly found
//! planes merge into close, similarly oriented existing ones instead of
//! duplicating them.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// A bounded planar surface in the world frame.
#[derive(Debug, Clone)]
pub struct DetectedPlane {
    pub id: i32,
    /// Centroid of the inlier points.
    pub center: Vector3<f64>,
    /// Unit normal with `normal.y >= 0`.
    pub normal: Vector3<f64>,
    pub width: f64,
    pub height: f64,
    /// Corners in plane-local order (min/min, max/min, max/max, min/max).
    pub corners: [Vector3<f64>; 4],
    pub is_horizontal: bool,
    /// Fraction of the candidate cloud supporting the plane, in [0, 1].
    pub confidence: f64,
}

/// Plane-detector tuning knobs.
#[derive(Debug, Clone)]
pub struct PlaneDetectorConfig {
    pub ransac_iterations: usize,
    /// Inlier distance threshold (meters, monocular scale).
    pub ransac_threshold: f64,
    /// Minimum inliers for a plane to be kept.
    pub min_plane_points: usize,
    /// `|normal . up|` above which a plane counts as horizontal.
    pub horizontal_threshold: f64,
    /// Centre distance under which planes merge.
    pub merge_distance: f64,
    /// Planes peeled per invocation.
    pub max_planes_per_pass: usize,
}

impl Default for PlaneDetectorConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 100,
            ransac_threshold: 0.02,
            min_plane_points: 50,
            horizontal_threshold: 0.9,
            merge_distance: 0.1,
            max_planes_per_pass: 3,
        }
    }
}

/// Detector state: accumulated planes plus the RANSAC rng.
pub struct PlaneDetector {
    config: PlaneDetectorConfig,
    planes: Vec<DetectedPlane>,
    next_plane_id: i32,
    rng: StdRng,
}

impl PlaneDetector {
    pub fn new() -> Self {
        Self::with_config(PlaneDetectorConfig::default())
    }

    pub fn with_config(config: PlaneDetectorConfig) -> Self {
        Self {
            config,
            planes: Vec::new(),
            next_plane_id: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic detector for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            config: PlaneDetectorConfig::default(),
            planes: Vec::new(),
            next_plane_id: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Run plane extraction over a point cloud. Returns whether any
    /// plane is known after the pass.
    pub fn detect(&mut self, points: &[Vector3<f64>]) -> bool {
        if points.len() < self.config.min_plane_points {
            return !self.planes.is_empty();
        }

        let mut remaining: Vec<Vector3<f64>> = points.to_vec();

        for _ in 0..self.config.max_planes_per_pass {
            if remaining.len() < self.config.min_plane_points {
                break;
            }

            let Some((normal, _d, inliers)) = self.fit_plane_ransac(&remaining) else {
                break;
            };
            if inliers.len() < self.config.min_plane_points {
                break;
            }

            let inlier_points: Vec<Vector3<f64>> =
                inliers.iter().map(|&i| remaining[i]).collect();

            let is_horizontal = normal.y.abs() > self.config.horizontal_threshold;
            let confidence = inliers.len() as f64 / points.len() as f64;
            let (center, width, height, corners) = plane_bounds(&inlier_points, &normal);

            let candidate = DetectedPlane {
                id: -1,
                center,
                normal,
                width,
                height,
                corners,
                is_horizontal,
                confidence,
            };

            match self.find_mergeable(&candidate) {
                Some(idx) => self.merge(idx, &candidate),
                None => {
                    let mut plane = candidate;
                    plane.id = self.next_plane_id;
                    self.next_plane_id += 1;
                    info!(
                        "plane {} detected ({}; {} inliers; {:.2}x{:.2})",
                        plane.id,
                        if plane.is_horizontal { "horizontal" } else { "vertical" },
                        inliers.len(),
                        plane.width,
                        plane.height
                    );
                    self.planes.push(plane);
                }
            }

            // Peel the consumed inliers off the candidate set.
            let inlier_set: std::collections::HashSet<usize> = inliers.into_iter().collect();
            remaining = remaining
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !inlier_set.contains(i))
                .map(|(_, p)| p)
                .collect();
        }

        !self.planes.is_empty()
    }

    /// Best plane through the cloud by repeated three-point hypotheses.
    ///
    /// Returns the unit normal (flipped so `normal.y >= 0`), the plane
    /// offset `d` and the inlier indices of the best hypothesis.
    fn fit_plane_ransac(
        &mut self,
        points: &[Vector3<f64>],
    ) -> Option<(Vector3<f64>, f64, Vec<usize>)> {
        if points.len() < 3 {
            return None;
        }

        let mut best_inliers: Vec<usize> = Vec::new();
        let mut best_normal = Vector3::zeros();
        let mut best_d = 0.0;

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

            let inliers: Vec<usize> = points
                .iter()
                .enumerate()
                .filter(|(_, p)| (normal.dot(p) + d).abs() < self.config.ransac_threshold)
                .map(|(i, _)| i)
                .collect();

            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
                best_normal = normal;
                best_d = d;
            }
        }

        if best_inliers.len() < self.config.min_plane_points {
            return None;
        }

        if best_normal.y < 0.0 {
            best_normal = -best_normal;
            best_d = -best_d;
        }

        Some((best_normal, best_d, best_inliers))
    }

    /// Draw three distinct indices, re-rolling duplicates.
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

    /// Index of an existing plane the candidate should merge into.
    fn find_mergeable(&self, candidate: &DetectedPlane) -> Option<usize> {
        self.planes.iter().position(|existing| {
            existing.is_horizontal == candidate.is_horizontal
                && existing.normal.dot(&candidate.normal).abs() >= 0.95
                && (existing.center - candidate.center).norm() < self.config.merge_distance
        })
    }

    fn merge(&mut self, idx: usize, new: &DetectedPlane) {
        let existing = &mut self.planes[idx];
        existing.center = (existing.center + new.center) * 0.5;
        existing.width = existing.width.max(new.width);
        existing.height = existing.height.max(new.height);
        existing.confidence = (existing.confidence + 0.5 * new.confidence).min(1.0);
        debug!("plane {} merged", existing.id);
    }

    pub fn planes(&self) -> &[DetectedPlane] {
        &self.planes
    }

    pub fn clear(&mut self) {
        self.planes.clear();
        self.next_plane_id = 0;
    }
}

impl Default for PlaneDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Centroid, extents and corners of the inlier cloud in a plane-local
/// basis: `right = up x normal` (falling back to +x when the normal is
/// vertical within tolerance), `forward = normal x right`.
fn plane_bounds(
    inlier_points: &[Vector3<f64>],
    normal: &Vector3<f64>,
) -> (Vector3<f64>, f64, f64, [Vector3<f64>; 4]) {
    let mut center = Vector3::zeros();
    for p in inlier_points {
        center += p;
    }
    center /= inlier_points.len() as f64;

    let up = Vector3::new(0.0, 1.0, 0.0);
    let mut right = up.cross(normal);
    if right.norm() < 0.1 {
        // Near-vertical normal: fall back to the x axis projected onto
        // the plane so the corners stay exactly on it.
        right = Vector3::new(1.0, 0.0, 0.0) - normal * normal.x;
    }
    right /= right.norm();
    let mut forward = normal.cross(&right);
    forward /= forward.norm();

    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_z = f64::MAX;
    let mut max_z = f64::MIN;
    for p in inlier_points {
        let local = p - center;
        let x = local.dot(&right);
        let z = local.dot(&forward);
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_z = min_z.min(z);
        max_z = max_z.max(z);
    }

    let corners = [
        center + right * min_x + forward * min_z,
        center + right * max_x + forward * min_z,
        center + right * max_x + forward * max_z,
        center + right * min_x + forward * max_z,
    ];

    (center, max_x - min_x, max_z - min_z, corners)
}
