//! Feature extraction and descriptor matching.

pub mod extractor;
pub mod matcher;

pub use extractor::{FeatureExtractor, FeatureSet, TARGET_MAX_FEATURES, TRACKER_MAX_FEATURES};
pub use matcher::{filter_good_matches, HammingMatcher, GOOD_MATCH_RATIO};
