//! Data types shared across the pipeline stages: frame
//! dimensions, ROI footprints, and trace matrices.

pub mod dimensions;
pub mod roi;
pub mod trace;

pub use dimensions::{Dimensions, DimensionsError};
pub use roi::{RoiMask, RoiSet};
pub use trace::TraceMatrices;
