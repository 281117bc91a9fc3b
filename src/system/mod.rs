//! Embedding facade.

pub mod ar_tracker;

pub use ar_tracker::ArTracker;
