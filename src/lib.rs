//! # corrosuite
//!
//! A processing pipeline for calcium-imaging movies: builds a
//! reference image, registers every frame to it (rigid
//! whole-frame translation, optionally refined block-by-block),
//! detects cellular ROIs by sparse iterative peel-off from an
//! activity correlation map, and extracts per-ROI fluorescence
//! and neuropil traces.
//!
//! Movies are `ndarray` stacks shaped `(frames, y, x)` of
//! `f32`, one imaging plane per stack. Registration rewrites
//! the stack in place. The stages are exposed individually
//! (`registration`, `detection`, `extraction`) and chained by
//! [`run_pipeline`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ndarray::Array3;
//! use corrosuite::{run_pipeline, PipelineConfig};
//!
//! let mut movie = Array3::<f32>::zeros((500, 256, 256));
//! let mut config = PipelineConfig::default();
//! config.nonrigid = None;
//!
//! let output = run_pipeline(&mut movie, &config, None).unwrap();
//! println!(
//!     "{} ROIs, {} frames registered",
//!     output.rois.len(),
//!     output.summary.n_frames,
//! );
//! ```

pub mod config;
pub mod data;
pub mod detection;
pub mod diagnostics;
pub mod extraction;
pub mod fourier;
pub mod registration;
mod utils;

use std::time::Instant;

use ndarray::prelude::*;

pub use config::PipelineConfig;
pub use data::{Dimensions, RoiMask, RoiSet, TraceMatrices};
pub use detection::{DetectionOutcome, RoiQuality};
pub use diagnostics::{CancelToken, FrameDiagnostics, RunSummary};
pub use utils::CorrosuiteError;

use registration::reference::compute_reference;
use registration::{nonrigid, rigid};

/// Everything one pipeline run produces.
pub struct PipelineOutput {
    /// The reference image the movie was registered to
    pub reference : Array2<f32>,
    /// One record per frame of the input stack
    pub frames : Vec<FrameDiagnostics>,
    pub rois : RoiSet,
    pub traces : TraceMatrices,
    /// Quality scores, index-aligned with `rois`
    pub quality : Vec<RoiQuality>,
    /// The correlation map detection seeded from
    pub correlation_map : Array2<f32>,
    pub summary : RunSummary,
}

/// Runs the full pipeline on one plane's movie, registering the
/// stack in place.
///
/// A `CancelToken` may be supplied to stop the run early;
/// stages poll it between frames and the partial output remains
/// internally consistent (unreached frames are unregistered and
/// flagged, the ROI set only reflects candidates examined so
/// far). An empty stack is not an error: the run returns a
/// trivial output with `degenerate_input` set.
pub fn run_pipeline(
    stack : &mut Array3<f32>,
    config : &PipelineConfig,
    cancel : Option<&CancelToken>,
) -> Result<PipelineOutput, CorrosuiteError> {
    let n_frames = stack.shape()[0];
    let owned_token = CancelToken::new();
    let cancel = cancel.unwrap_or(&owned_token);

    if n_frames == 0 {
        log::warn!("Empty stack, nothing to process");
        let dims = Dimensions::from_shape(stack.shape());
        return Ok(PipelineOutput {
            reference : Array2::zeros(dims.to_tuple()),
            frames : vec![],
            rois : RoiSet::default(),
            traces : TraceMatrices {
                f : Array2::zeros((0, 0)),
                f_neu : Array2::zeros((0, 0)),
                empty_neuropil : vec![],
            },
            quality : vec![],
            correlation_map : Array2::zeros(dims.to_tuple()),
            summary : RunSummary {
                degenerate_input : true,
                ..RunSummary::default()
            },
        });
    }

    let dims = Dimensions::from_shape(stack.shape());
    config.validate(&dims, n_frames)?;

    let engine = fourier::FftEngine::new(dims, &config.correlation);

    let timer = Instant::now();
    let (reference, ref_diag) = compute_reference(
        stack.view(), &engine, &config.reference, &config.rigid, cancel)?;
    log::info!(
        "Reference built in {:.2?}: {} iterations, converged: {}, mean shift {:.3} px",
        timer.elapsed(), ref_diag.iterations, ref_diag.converged,
        ref_diag.final_mean_shift,
    );

    let timer = Instant::now();
    let registrations = rigid::register_stack(
        stack, reference.view(), &engine, &config.rigid,
        config.batch_size, cancel)?;
    log::info!(
        "Rigid registration of {} frames in {:.2?}",
        n_frames, timer.elapsed(),
    );

    let nonrigid_diags = match &config.nonrigid {
        Some(nonrigid_cfg) => {
            let timer = Instant::now();
            let diags = nonrigid::register_stack(
                stack, reference.view(), nonrigid_cfg, &config.correlation,
                config.rigid.edge_fill, config.batch_size, cancel)?;
            log::info!("Non-rigid registration in {:.2?}", timer.elapsed());
            Some(diags)
        },
        None => None,
    };

    let timer = Instant::now();
    let outcome = detection::detect_rois(stack.view(), &config.detection, cancel)?;
    log::info!(
        "Detection in {:.2?}: {} candidates, {} ROIs kept",
        timer.elapsed(), outcome.candidates_extracted, outcome.rois.len(),
    );

    let timer = Instant::now();
    let traces = extraction::extract_traces(
        stack.view(), &outcome.rois, &config.extraction)?;
    log::info!("Trace extraction in {:.2?}", timer.elapsed());
    if !traces.empty_neuropil.is_empty() {
        log::warn!(
            "{} ROIs have no valid neuropil pixels", traces.empty_neuropil.len());
    }

    let frames = frame_diagnostics(&registrations, nonrigid_diags.as_deref());

    let degenerate_input = outcome.correlation_map.iter().all(|&v| v <= 0.0);
    let summary = RunSummary {
        n_frames,
        n_low_confidence : frames.iter().filter(|f| f.low_confidence).count(),
        n_fallback : frames.iter().filter(|f| f.used_fallback).count(),
        n_unprocessed : frames.iter().filter(|f| !f.processed).count(),
        reference_iterations : ref_diag.iterations,
        reference_converged : ref_diag.converged,
        candidates_extracted : outcome.candidates_extracted,
        candidates_accepted : outcome.candidates_accepted,
        rejected_size : outcome.rejected_size,
        rejected_compactness : outcome.rejected_compactness,
        rejected_skew : outcome.rejected_skew,
        merged_pairs : outcome.merged_pairs,
        dropped_overlap : outcome.dropped_overlap,
        cancelled : ref_diag.cancelled || outcome.cancelled || cancel.is_cancelled(),
        degenerate_input,
    };

    Ok(PipelineOutput {
        reference,
        frames,
        rois : outcome.rois,
        traces,
        quality : outcome.quality,
        correlation_map : outcome.correlation_map,
        summary,
    })
}

/// Flattens the rigid registrations (and non-rigid block
/// diagnostics, when that pass ran) into one record per frame.
fn frame_diagnostics(
    registrations : &[registration::FrameRegistration],
    nonrigid_diags : Option<&[nonrigid::NonrigidFrameDiag]>,
) -> Vec<FrameDiagnostics> {
    registrations.iter().enumerate()
        .map(|(frame, reg)| {
            let nonrigid_blocks = nonrigid_diags
                .map(|diags| diags[frame].n_low_confidence_blocks)
                .unwrap_or(0);
            FrameDiagnostics {
                frame,
                applied_dy : reg.applied_dy,
                applied_dx : reg.applied_dx,
                subpixel_dy : reg.estimate.subpixel_dy,
                subpixel_dx : reg.estimate.subpixel_dx,
                peak_ratio : reg.estimate.peak_ratio,
                low_confidence : reg.estimate.low_confidence,
                used_fallback : reg.used_fallback,
                nonrigid_low_confidence_blocks : nonrigid_blocks,
                processed : reg.processed,
            }
        })
        .collect()
}
