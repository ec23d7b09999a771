//! Run-level reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag, cheaply cloneable and shared
/// across worker threads. Pipeline stages poll it between
/// frames (or between iterations) and stop early without
/// discarding work already done.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag : Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken { flag : Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-frame registration report, flattened for consumers that
/// want one record per frame rather than the internal
/// estimate/registration split.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDiagnostics {
    pub frame : usize,
    pub applied_dy : i32,
    pub applied_dx : i32,
    pub subpixel_dy : f32,
    pub subpixel_dx : f32,
    pub peak_ratio : f32,
    pub low_confidence : bool,
    pub used_fallback : bool,
    /// Low-confidence block count from the non-rigid pass, if
    /// one ran
    pub nonrigid_low_confidence_blocks : usize,
    pub processed : bool,
}

/// Counters accumulated over one full pipeline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub n_frames : usize,
    pub n_low_confidence : usize,
    pub n_fallback : usize,
    pub n_unprocessed : usize,
    pub reference_iterations : usize,
    pub reference_converged : bool,
    pub candidates_extracted : usize,
    pub candidates_accepted : usize,
    pub rejected_size : usize,
    pub rejected_compactness : usize,
    pub rejected_skew : usize,
    pub merged_pairs : usize,
    pub dropped_overlap : usize,
    pub cancelled : bool,
    /// Set when the input was empty or constant and the run
    /// returned trivially
    pub degenerate_input : bool,
}
