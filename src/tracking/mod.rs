//! Tracking pipeline: state machine, triangulation, loop closure.

pub mod loop_closure;
pub mod state;
pub mod tracker;
pub mod triangulation;

pub use loop_closure::{BundleAdjuster, NoopBundleAdjuster};
pub use state::TrackingState;
pub use tracker::{SlamConfig, Tracker};
