mod parallelize_op;

pub (crate) use parallelize_op::parallelize_op as parallelize_op;

use crate::data::dimensions::DimensionsError;

/// Errors that can occur during pipeline processing,
/// either from inconsistent array shapes (the
/// `Dimensions` variant) or from a configuration that
/// is rejected before any processing starts.
///
/// Per-frame and per-component failures (weak
/// correlation peaks, candidates outside quality bounds,
/// iteration caps hit without convergence) are NOT
/// errors -- they are recorded in the run's diagnostics
/// and never abort a batch.
#[derive(Debug)]
pub enum CorrosuiteError {
    Dimensions(DimensionsError),
    Configuration(String),
}

impl From<DimensionsError> for CorrosuiteError {
    fn from(err : DimensionsError) -> Self {
        CorrosuiteError::Dimensions(err)
    }
}

impl std::error::Error for CorrosuiteError {}

impl std::fmt::Display for CorrosuiteError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CorrosuiteError::Dimensions(err) => {
                write!(f, "DimensionsError: {}", err)
            },
            CorrosuiteError::Configuration(err) => {
                write!(f, "ConfigurationError: {}", err)
            }
        }
    }
}
