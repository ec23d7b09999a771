//! ROI detection: movie conditioning, sparse iterative
//! extraction, and overlap resolution.

pub mod correlation_map;
pub mod merge;
pub mod sparsery;

pub use correlation_map::DetectionMovie;
pub use sparsery::{detect_rois, DetectionOutcome, RoiQuality};
