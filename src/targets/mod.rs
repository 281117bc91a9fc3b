//! Image-target recognition and pose estimation.

pub mod tracker;

pub use tracker::{DetectedTarget, ImageTarget, ImageTargetTracker, TargetConfig};
