//! Main tracker: two-view initialization, frame-to-map tracking,
//! keyframe insertion and the periodic geometry services.
//!
//! The pipeline is strictly single-threaded and frame-serial: one call
//! to [`Tracker::process_frame`] consumes one grayscale frame, commits
//! all state transitions and returns whether tracking succeeded. The
//! tracker exclusively owns the map store; the plane detector and the
//! image-target tracker it drives only read map snapshots.

use anyhow::Result;
use opencv::core::{Mat, Point2f, Vector};
use opencv::prelude::*;
use tracing::{debug, info};

use crate::features::{
    filter_good_matches, FeatureExtractor, FeatureSet, HammingMatcher, TRACKER_MAX_FEATURES,
};
use crate::geometry::{estimate_relative_pose, solve_pnp_ransac, CameraIntrinsics, SE3};
use crate::map::{MapPointId, MapStore};
use crate::planes::PlaneDetector;
use crate::targets::ImageTargetTracker;

use super::loop_closure::{detect_loop, BundleAdjuster, NoopBundleAdjuster};
use super::state::TrackingState;
use super::triangulation::triangulate_new_points;

/// Essential-matrix RANSAC confidence.
const ESSENTIAL_CONFIDENCE: f64 = 0.999;

/// Essential-matrix RANSAC threshold in pixels.
const ESSENTIAL_THRESHOLD_PX: f64 = 1.0;

/// Minimum recover-pose inliers for two-view initialization.
const MIN_INIT_INLIERS: usize = 30;

/// Hamming distance cutoff for frame-to-map matches.
const MAP_MATCH_DISTANCE: f32 = 50.0;

/// Keyframe count above which loop detection runs.
const LOOP_DETECTION_MIN_KEYFRAMES: usize = 10;

/// Frame cadence of plane detection.
const PLANE_DETECTION_INTERVAL: u64 = 30;

/// Map size required before plane detection runs.
const PLANE_DETECTION_MIN_POINTS: usize = 50;

/// Frame cadence of image-target detection.
const TARGET_DETECTION_INTERVAL: u64 = 5;

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct SlamConfig {
    /// Minimum features / raw matches required for two-view init.
    pub min_init_matches: usize,
    /// Minimum matches for PnP and for the frame-to-frame fallback.
    pub min_tracking_matches: usize,
    /// Frame interval that throttles keyframe proposals.
    pub keyframe_interval: u64,
    /// Translation gate for keyframe insertion (monocular scale units).
    pub keyframe_translation: f64,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            min_init_matches: 100,
            min_tracking_matches: 20,
            keyframe_interval: 15,
            keyframe_translation: 0.1,
        }
    }
}

/// Cached copy of the previous frame, used for initialization pairing
/// and the frame-to-frame fallback.
struct CachedFrame {
    image: Mat,
    features: FeatureSet,
}

/// The tracking-and-mapping engine.
pub struct Tracker {
    camera: CameraIntrinsics,
    config: SlamConfig,

    extractor: FeatureExtractor,
    matcher: HammingMatcher,

    map: MapStore,
    plane_detector: PlaneDetector,
    target_tracker: ImageTargetTracker,
    bundle_adjuster: Box<dyn BundleAdjuster>,

    state: TrackingState,

    /// Current world-from-camera pose.
    current_pose: SE3,

    frame_count: u64,
    prev: Option<CachedFrame>,
}

impl Tracker {
    pub fn new(camera: CameraIntrinsics) -> Result<Self> {
        Self::with_config(camera, SlamConfig::default())
    }

    pub fn with_config(camera: CameraIntrinsics, config: SlamConfig) -> Result<Self> {
        Ok(Self {
            camera,
            config,
            extractor: FeatureExtractor::new(TRACKER_MAX_FEATURES)?,
            matcher: HammingMatcher::new()?,
            map: MapStore::new(),
            plane_detector: PlaneDetector::new(),
            target_tracker: ImageTargetTracker::new()?,
            bundle_adjuster: Box::new(NoopBundleAdjuster),
            state: TrackingState::Uninitialized,
            current_pose: SE3::identity(),
            frame_count: 0,
            prev: None,
        })
    }

    /// Process one grayscale frame. Returns whether tracking (or an
    /// initialization step) succeeded this frame.
    pub fn process_frame(&mut self, gray: &Mat) -> Result<bool> {
        self.frame_count += 1;

        match self.state {
            TrackingState::Uninitialized | TrackingState::WaitingSecondView => {
                self.initialize(gray)
            }
            TrackingState::Tracking | TrackingState::Lost => self.track(gray),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────

    /// Two-view initialization. Every failure past the first frame
    /// re-caches the new frame and keeps waiting for a better pair.
    fn initialize(&mut self, gray: &Mat) -> Result<bool> {
        let features = self.extractor.detect(gray)?;

        if features.len() < self.config.min_init_matches {
            debug!("init: not enough features ({})", features.len());
            return Ok(false);
        }

        let Some(prev) = self.prev.as_ref() else {
            self.cache_frame(gray, features)?;
            self.state = TrackingState::WaitingSecondView;
            info!("init: first frame cached");
            return Ok(true);
        };

        let matches = self
            .matcher
            .match_cross_checked(&prev.features.descriptors, &features.descriptors)?;
        if matches.len() < self.config.min_init_matches {
            debug!("init: not enough matches ({})", matches.len());
            self.cache_frame(gray, features)?;
            return Ok(false);
        }

        let good = filter_good_matches(&matches);
        if good.len() < self.config.min_init_matches / 2 {
            debug!("init: not enough good matches ({})", good.len());
            self.cache_frame(gray, features)?;
            return Ok(false);
        }

        let mut pts1 = Vector::<Point2f>::new();
        let mut pts2 = Vector::<Point2f>::new();
        for m in good.iter() {
            let kp1 = prev.features.keypoints.get(m.query_idx as usize)?;
            let kp2 = features.keypoints.get(m.train_idx as usize)?;
            pts1.push(kp1.pt());
            pts2.push(kp2.pt());
        }

        let rel = estimate_relative_pose(
            &pts1,
            &pts2,
            &self.camera,
            ESSENTIAL_CONFIDENCE,
            ESSENTIAL_THRESHOLD_PX,
        )?;
        let Some(rel) = rel else {
            debug!("init: essential matrix degenerate");
            self.cache_frame(gray, features)?;
            return Ok(false);
        };
        if rel.inliers < MIN_INIT_INLIERS {
            debug!("init: not enough pose inliers ({})", rel.inliers);
            self.cache_frame(gray, features)?;
            return Ok(false);
        }

        // First keyframe at the origin, second at the inverse of the
        // recovered camera2-from-camera1 delta. Translation scale is
        // unity; monocular scale stays arbitrary but consistent.
        let prev = self.prev.take().expect("cached frame checked above");
        let kf1_id = self.map.create_keyframe(
            prev.image,
            SE3::identity(),
            prev.features.keypoints,
            prev.features.descriptors,
        );
        let pose2 = SE3::from_rt(rel.rotation, rel.translation).inverse();
        let kf2_id = self.map.create_keyframe(
            gray.try_clone()?,
            pose2.clone(),
            features.keypoints.clone(),
            features.descriptors.try_clone()?,
        );

        triangulate_new_points(&mut self.map, kf1_id, kf2_id, &self.camera, &self.matcher)?;

        self.current_pose = pose2;
        self.cache_frame(gray, features)?;
        self.state = TrackingState::Tracking;

        info!(
            "init: map bootstrapped ({} points, {} keyframes, {} inliers)",
            self.map.num_map_points(),
            self.map.num_keyframes(),
            rel.inliers
        );
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────

    fn track(&mut self, gray: &Mat) -> Result<bool> {
        let features = self.extractor.detect(gray)?;

        if features.len() < self.config.min_tracking_matches {
            debug!("track: not enough features ({})", features.len());
            self.state = TrackingState::Lost;
            return Ok(false);
        }

        // Carry the previous outcome so a degenerate fallback attempt is
        // dropped without flipping the state.
        let mut tracked = self.state.is_tracking();

        let map_matches = self.match_with_map(&features)?;
        if map_matches.len() >= self.config.min_tracking_matches {
            tracked = self.track_with_map(&map_matches, &features)?;
        } else {
            match self.track_frame_to_frame(&features)? {
                FallbackOutcome::Tracked => tracked = true,
                FallbackOutcome::TooFewMatches => {
                    debug!("track: fallback match count too low");
                    self.state = TrackingState::Lost;
                    return Ok(false);
                }
                FallbackOutcome::Degenerate => {
                    debug!("track: fallback essential matrix degenerate, attempt dropped");
                }
            }
        }

        self.state = if tracked {
            TrackingState::Tracking
        } else {
            TrackingState::Lost
        };

        if tracked && self.need_new_keyframe() {
            self.insert_keyframe(gray, &features)?;
        }

        self.run_periodic_services(gray)?;
        self.cache_frame(gray, features)?;

        Ok(tracked)
    }

    /// Cross-check the map's descriptor batch against the frame and keep
    /// close matches as (map point, keypoint index) pairs.
    fn match_with_map(&self, features: &FeatureSet) -> Result<Vec<(MapPointId, usize)>> {
        let (batch, ids) = self.map.descriptor_batch()?;
        let matches = self
            .matcher
            .match_cross_checked(&batch, &features.descriptors)?;

        let mut out = Vec::new();
        for m in matches.iter() {
            if m.distance >= MAP_MATCH_DISTANCE {
                continue;
            }
            if let Some(&mp_id) = ids.get(m.query_idx as usize) {
                out.push((mp_id, m.train_idx as usize));
            }
        }
        Ok(out)
    }

    /// PnP against matched map points. Updates the pose on success.
    fn track_with_map(
        &mut self,
        map_matches: &[(MapPointId, usize)],
        features: &FeatureSet,
    ) -> Result<bool> {
        let mut world_points = Vec::new();
        let mut image_points = Vec::new();
        for &(mp_id, kp_idx) in map_matches {
            let Some(mp) = self.map.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            let kp = features.keypoints.get(kp_idx)?;
            world_points.push(mp.world_pos);
            image_points.push(kp.pt());
        }

        match solve_pnp_ransac(&world_points, &image_points, &self.camera)? {
            Some(cam_from_world) => {
                self.current_pose = cam_from_world.inverse();
                Ok(true)
            }
            None => {
                debug!("track: PnP failed on {} correspondences", world_points.len());
                Ok(false)
            }
        }
    }

    /// Relative-pose recovery against the previous frame. This path does
    /// not touch the map; it only carries the pose across a map-matching
    /// dropout.
    fn track_frame_to_frame(&mut self, features: &FeatureSet) -> Result<FallbackOutcome> {
        let Some(prev) = self.prev.as_ref() else {
            return Ok(FallbackOutcome::TooFewMatches);
        };

        let matches = self
            .matcher
            .match_cross_checked(&prev.features.descriptors, &features.descriptors)?;
        if matches.len() < self.config.min_tracking_matches {
            return Ok(FallbackOutcome::TooFewMatches);
        }

        let mut pts1 = Vector::<Point2f>::new();
        let mut pts2 = Vector::<Point2f>::new();
        for m in matches.iter() {
            pts1.push(prev.features.keypoints.get(m.query_idx as usize)?.pt());
            pts2.push(features.keypoints.get(m.train_idx as usize)?.pt());
        }

        let rel = estimate_relative_pose(
            &pts1,
            &pts2,
            &self.camera,
            ESSENTIAL_CONFIDENCE,
            ESSENTIAL_THRESHOLD_PX,
        )?;
        match rel {
            Some(rel) => {
                // The recovered delta is camera2-from-camera1; invert to
                // a world-frame step and post-multiply.
                let delta_wc = SE3::from_rt(rel.rotation, rel.translation).inverse();
                let next = &self.current_pose * &delta_wc;
                self.current_pose = next;
                Ok(FallbackOutcome::Tracked)
            }
            None => Ok(FallbackOutcome::Degenerate),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Keyframes and periodic services
    // ─────────────────────────────────────────────────────────────────

    fn need_new_keyframe(&self) -> bool {
        let Some(last) = self.map.last_keyframe() else {
            return true;
        };
        if self.frame_count % self.config.keyframe_interval != 0 {
            return false;
        }
        let travelled = (self.current_pose.translation - last.pose.translation).norm();
        travelled > self.config.keyframe_translation
    }

    fn insert_keyframe(&mut self, gray: &Mat, features: &FeatureSet) -> Result<()> {
        let prev_kf_id = self.map.last_keyframe().map(|kf| kf.id);

        let kf_id = self.map.create_keyframe(
            gray.try_clone()?,
            self.current_pose.clone(),
            features.keypoints.clone(),
            features.descriptors.try_clone()?,
        );

        if let Some(prev_id) = prev_kf_id {
            triangulate_new_points(&mut self.map, prev_id, kf_id, &self.camera, &self.matcher)?;
        }

        if self.map.num_keyframes() > LOOP_DETECTION_MIN_KEYFRAMES {
            if let Some(candidate) = detect_loop(&self.map, kf_id, &self.matcher)? {
                self.bundle_adjuster.adjust(&mut self.map, kf_id, candidate);
            }
        }

        info!(
            "keyframe {kf_id} inserted ({} map points)",
            self.map.num_map_points()
        );
        Ok(())
    }

    fn run_periodic_services(&mut self, gray: &Mat) -> Result<()> {
        if self.map.num_map_points() >= PLANE_DETECTION_MIN_POINTS
            && self.frame_count % PLANE_DETECTION_INTERVAL == 0
        {
            self.plane_detector.detect(&self.map.world_positions());
        }

        if self.target_tracker.target_count() > 0
            && self.frame_count % TARGET_DETECTION_INTERVAL == 0
        {
            self.target_tracker
                .detect(gray, &self.camera, &self.current_pose)?;
        }
        Ok(())
    }

    fn cache_frame(&mut self, gray: &Mat, features: FeatureSet) -> Result<()> {
        self.prev = Some(CachedFrame {
            image: gray.try_clone()?,
            features,
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Queries and control
    // ─────────────────────────────────────────────────────────────────

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_initialized()
    }

    pub fn is_tracking(&self) -> bool {
        self.state.is_tracking()
    }

    /// Current world-from-camera pose.
    pub fn current_pose(&self) -> &SE3 {
        &self.current_pose
    }

    pub fn camera(&self) -> &CameraIntrinsics {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: CameraIntrinsics) {
        self.camera = camera;
    }

    pub fn map(&self) -> &MapStore {
        &self.map
    }

    pub fn plane_detector(&self) -> &PlaneDetector {
        &self.plane_detector
    }

    pub fn target_tracker(&self) -> &ImageTargetTracker {
        &self.target_tracker
    }

    pub fn target_tracker_mut(&mut self) -> &mut ImageTargetTracker {
        &mut self.target_tracker
    }

    /// Install a bundle-adjustment hook replacing the no-op default.
    pub fn set_bundle_adjuster(&mut self, adjuster: Box<dyn BundleAdjuster>) {
        self.bundle_adjuster = adjuster;
    }

    /// Revert all tracking and mapping state. Registered image targets
    /// survive (they are configuration, not map state); their current
    /// detections are dropped.
    pub fn reset(&mut self) {
        self.map.clear();
        self.plane_detector.clear();
        self.target_tracker.clear_detections();
        self.state = TrackingState::Uninitialized;
        self.current_pose = SE3::identity();
        self.frame_count = 0;
        self.prev = None;
    }
}

/// Outcome of the frame-to-frame fallback.
enum FallbackOutcome {
    Tracked,
    TooFewMatches,
    /// Degenerate geometry: the attempt is dropped without a state
    /// transition.
    Degenerate,
}
