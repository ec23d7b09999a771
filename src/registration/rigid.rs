//! Whole-frame translational registration by phase correlation.
//!
//! The reference is conditioned and transformed ONCE into a
//! conjugated spectrum (`RigidContext`); every frame then costs
//! one forward FFT, one spectrum product, and one inverse FFT.
//! Frames are embarrassingly parallel -- the context is shared
//! read-only across the worker chunks.

use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::config::RigidConfig;
use crate::data::dimensions::Dimensions;
use crate::diagnostics::CancelToken;
use crate::fourier::FftEngine;
use crate::utils::parallelize_op;
use crate::CorrosuiteError;

use super::{
    apply_shift, parabolic_peak_offset,
    FallbackShift, FrameRegistration, ShiftEstimate,
};

/// Precomputed per-run state for rigid registration: the
/// reference's conjugated spectrum and the resolved search
/// bounds.
pub struct RigidContext {
    ref_conj : Array2<Complex<f32>>,
    max_shift : usize,
    min_peak_ratio : f32,
}

impl RigidContext {
    pub fn new(
        engine : &FftEngine,
        reference : ArrayView2<f32>,
        cfg : &RigidConfig,
    ) -> Result<Self, CorrosuiteError> {
        engine.dims().check_matches(&Dimensions::from_shape(reference.shape()))?;

        Ok(RigidContext {
            ref_conj : engine.conj_spectrum(reference),
            max_shift : resolve_max_shift(cfg.max_shift_frac, engine.dims()),
            min_peak_ratio : cfg.min_peak_ratio,
        })
    }

    pub fn max_shift(&self) -> usize {
        self.max_shift
    }
}

/// Maximum shift in pixels for a frame of these dimensions --
/// a fraction of the smaller side, never more than half of it.
pub (crate) fn resolve_max_shift(frac : f32, dims : &Dimensions) -> usize {
    let smaller = dims.ydim.min(dims.xdim);
    let px = (smaller as f32 * frac).round() as usize;
    px.clamp(1, (smaller / 2).saturating_sub(1).max(1))
}

/// Estimates the shift of one frame against the context's
/// reference.
pub fn phasecorr(
    engine : &FftEngine,
    ctx : &RigidContext,
    frame : ArrayView2<f32>,
) -> ShiftEstimate {
    let spectrum = engine.spectrum(frame);
    let surface = engine.correlate_spectra(&spectrum, &ctx.ref_conj);
    estimate_from_surface(&surface, ctx.max_shift, ctx.min_peak_ratio)
}

/// Reads the correlation surface: integer peak within
/// `±max_shift` of zero (wrap-around indexing), parabolic
/// subpixel refinement, and a peak-to-noise confidence score.
///
/// The returned `dy`/`dx` are already negated into the
/// shift-to-apply convention.
pub (crate) fn estimate_from_surface(
    surface : &Array2<f32>,
    max_shift : usize,
    min_peak_ratio : f32,
) -> ShiftEstimate {
    let (ydim, xdim) = surface.dim();
    let m = max_shift as i64;

    let at = |sy : i64, sx : i64| -> f32 {
        surface[[sy.rem_euclid(ydim as i64) as usize,
                 sx.rem_euclid(xdim as i64) as usize]]
    };

    let mut peak = (0i64, 0i64);
    let mut peak_val = f32::NEG_INFINITY;
    for sy in -m..=m {
        for sx in -m..=m {
            let v = at(sy, sx);
            if v > peak_val {
                peak_val = v;
                peak = (sy, sx);
            }
        }
    }

    // Noise floor: mean absolute correlation over the search
    // window, excluding a box around the peak itself. The box
    // shrinks with the window so tight windows still leave
    // noise samples to average.
    let exclude = (m - 1).min(2);
    let mut noise = 0.0f32;
    let mut n_noise = 0u32;
    for sy in -m..=m {
        for sx in -m..=m {
            if (sy - peak.0).abs() <= exclude && (sx - peak.1).abs() <= exclude {
                continue;
            }
            noise += at(sy, sx).abs();
            n_noise += 1;
        }
    }
    let noise = if n_noise > 0 { noise / n_noise as f32 } else { 0.0 };
    let peak_ratio = peak_val / (noise + 1e-9);
    let low_confidence = peak_val <= 0.0 || peak_ratio < min_peak_ratio;

    let frac_y = parabolic_peak_offset(
        at(peak.0 - 1, peak.1), peak_val, at(peak.0 + 1, peak.1));
    let frac_x = parabolic_peak_offset(
        at(peak.0, peak.1 - 1), peak_val, at(peak.0, peak.1 + 1));

    ShiftEstimate {
        dy : -(peak.0 as i32),
        dx : -(peak.1 as i32),
        subpixel_dy : -frac_y,
        subpixel_dx : -frac_x,
        peak_ratio,
        low_confidence,
        valid : true,
    }
}

/// Rigidly registers every frame of the stack in place.
///
/// Three passes: a parallel estimation pass (read-only), a
/// sequential fallback-resolution pass so `FallbackShift::Previous`
/// sees true frame order, and a parallel apply pass in which each
/// frame is rewritten by exactly one worker.
///
/// Cancellation is checked between frames during estimation; a
/// cancelled run leaves unreached frames untouched and unmarked
/// (`processed == false`) in the returned registrations.
pub fn register_stack(
    stack : &mut Array3<f32>,
    reference : ArrayView2<f32>,
    engine : &FftEngine,
    cfg : &RigidConfig,
    batch_size : usize,
    cancel : &CancelToken,
) -> Result<Vec<FrameRegistration>, CorrosuiteError> {
    let n_frames = stack.shape()[0];
    engine.dims().check_matches(&Dimensions::from_shape(stack.shape()))?;

    let ctx = RigidContext::new(engine, reference, cfg)?;

    let mut estimates = vec![ShiftEstimate::default(); n_frames];

    parallelize_op!(
        stack,
        batch_size,
        estimates,
        |range : std::ops::Range<usize>, chunk : &ArrayView3<f32>, out : &mut [ShiftEstimate]|
            -> Result<(), CorrosuiteError> {
            for (local, _frame_idx) in range.enumerate() {
                if cancel.is_cancelled() {
                    break;
                }
                out[local] = phasecorr(engine, &ctx, chunk.index_axis(Axis(0), local));
            }
            Ok(())
        }
    );

    let mut registrations = resolve_fallbacks(&estimates, cfg.fallback);

    let edge = cfg.edge_fill;
    parallelize_op!(
        mut stack,
        batch_size,
        registrations,
        |range : std::ops::Range<usize>, chunk : &mut ArrayViewMut3<f32>, regs : &mut [FrameRegistration]|
            -> Result<(), CorrosuiteError> {
            for (local, _frame_idx) in range.enumerate() {
                let reg = &regs[local];
                if reg.processed {
                    apply_shift(
                        &mut chunk.index_axis_mut(Axis(0), local),
                        reg.applied_dy,
                        reg.applied_dx,
                        edge,
                    );
                }
            }
            Ok(())
        }
    );

    Ok(registrations)
}

/// Turns raw estimates into applied shifts. Low-confidence
/// frames take the fallback shift; unvisited frames (cancelled
/// before estimation) apply nothing.
fn resolve_fallbacks(
    estimates : &[ShiftEstimate],
    fallback : FallbackShift,
) -> Vec<FrameRegistration> {
    let mut registrations = Vec::with_capacity(estimates.len());
    let mut previous = (0i32, 0i32);

    for &estimate in estimates.iter() {
        let reg = if !estimate.valid {
            FrameRegistration {
                estimate,
                applied_dy : 0,
                applied_dx : 0,
                used_fallback : false,
                processed : false,
            }
        } else if estimate.low_confidence {
            let (dy, dx) = match fallback {
                FallbackShift::Zero => (0, 0),
                FallbackShift::Previous => previous,
            };
            FrameRegistration {
                estimate,
                applied_dy : dy,
                applied_dx : dx,
                used_fallback : true,
                processed : true,
            }
        } else {
            previous = (estimate.dy, estimate.dx);
            FrameRegistration {
                estimate,
                applied_dy : estimate.dy,
                applied_dx : estimate.dx,
                used_fallback : false,
                processed : true,
            }
        };
        registrations.push(reg);
    }
    registrations
}
