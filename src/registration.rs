//! Motion registration: rigid (whole-frame) and non-rigid
//! (block-wise) alignment against a reference image, plus the
//! iterative reference builder itself.
//!
//! The shift convention throughout: a positive `dy` shifts frame
//! content DOWN, a positive `dx` shifts it RIGHT. The estimate
//! returned for a frame is the shift to APPLY to that frame to
//! align it to the reference (already negated from the raw
//! correlation peak position).

pub mod rigid;
pub mod nonrigid;
pub mod reference;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// What to put in the pixels that a shift drags in from beyond
/// the original frame bounds.
///
/// `Replicate` keeps downstream correlation-map and trace
/// computations supplied with plausible data everywhere and is
/// the default. `Wrap` rolls the frame torus-style. `Value`
/// fills with a constant for masked analyses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EdgeFill {
    Replicate,
    Wrap,
    Value(f32),
}

/// Policy for frames whose correlation peak is too weak to
/// trust: inherit the previous frame's applied shift, or apply
/// no shift at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FallbackShift {
    Zero,
    Previous,
}

/// One frame's (or block's) estimated translation.
///
/// The full estimated shift along y is `dy as f32 + subpixel_dy`
/// with `subpixel_dy` in `(-0.5, 0.5)`, and likewise for x.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShiftEstimate {
    pub dy : i32,
    pub dx : i32,
    pub subpixel_dy : f32,
    pub subpixel_dx : f32,
    /// Correlation peak height relative to the surrounding
    /// noise floor of the search window
    pub peak_ratio : f32,
    pub low_confidence : bool,
    /// False when the frame was never reached (cancellation)
    pub valid : bool,
}

impl ShiftEstimate {
    /// Magnitude of the full (integer + subpixel) shift.
    pub fn magnitude(&self) -> f32 {
        let fy = self.dy as f32 + self.subpixel_dy;
        let fx = self.dx as f32 + self.subpixel_dx;
        (fy * fy + fx * fx).sqrt()
    }
}

/// The estimate plus what was actually applied to the frame
/// after the fallback policy had its say.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRegistration {
    pub estimate : ShiftEstimate,
    pub applied_dy : i32,
    pub applied_dx : i32,
    pub used_fallback : bool,
    pub processed : bool,
}

/// Shifts a frame in place by an integer translation,
/// filling dragged-in edges per `edge`.
pub fn apply_shift(
    frame : &mut ArrayViewMut2<f32>,
    dy : i32,
    dx : i32,
    edge : EdgeFill,
) {
    if dy == 0 && dx == 0 {
        return;
    }
    let src = frame.to_owned();
    fill_shifted(&src, frame, dy, dx, edge);
}

/// Like `apply_shift` but leaves the source untouched and
/// returns a new array.
pub fn shifted(frame : ArrayView2<f32>, dy : i32, dx : i32, edge : EdgeFill) -> Array2<f32> {
    let mut out = Array2::zeros(frame.raw_dim());
    let src = frame.to_owned();
    fill_shifted(&src, &mut out.view_mut(), dy, dx, edge);
    out
}

fn fill_shifted(
    src : &Array2<f32>,
    dst : &mut ArrayViewMut2<f32>,
    dy : i32,
    dx : i32,
    edge : EdgeFill,
) {
    let (ydim, xdim) = src.dim();
    for y in 0..ydim {
        let sy = y as i64 - dy as i64;
        for x in 0..xdim {
            let sx = x as i64 - dx as i64;
            dst[[y, x]] = match edge {
                EdgeFill::Wrap => {
                    src[[sy.rem_euclid(ydim as i64) as usize,
                         sx.rem_euclid(xdim as i64) as usize]]
                },
                EdgeFill::Replicate => {
                    src[[sy.clamp(0, ydim as i64 - 1) as usize,
                         sx.clamp(0, xdim as i64 - 1) as usize]]
                },
                EdgeFill::Value(v) => {
                    if sy >= 0 && sx >= 0 && (sy as usize) < ydim && (sx as usize) < xdim {
                        src[[sy as usize, sx as usize]]
                    } else {
                        v
                    }
                }
            };
        }
    }
}

/// Bilinear sample of `src` at a fractional coordinate, with
/// out-of-bounds neighbors resolved by the edge policy.
pub (crate) fn bilinear_sample(
    src : &ArrayView2<f32>,
    y : f32,
    x : f32,
    edge : EdgeFill,
) -> f32 {
    let (ydim, xdim) = src.dim();
    let y0 = y.floor();
    let x0 = x.floor();
    let ty = y - y0;
    let tx = x - x0;

    let pick = |iy : i64, ix : i64| -> f32 {
        match edge {
            EdgeFill::Wrap => {
                src[[iy.rem_euclid(ydim as i64) as usize,
                     ix.rem_euclid(xdim as i64) as usize]]
            },
            EdgeFill::Replicate => {
                src[[iy.clamp(0, ydim as i64 - 1) as usize,
                     ix.clamp(0, xdim as i64 - 1) as usize]]
            },
            EdgeFill::Value(v) => {
                if iy >= 0 && ix >= 0 && (iy as usize) < ydim && (ix as usize) < xdim {
                    src[[iy as usize, ix as usize]]
                } else {
                    v
                }
            }
        }
    };

    let y0i = y0 as i64;
    let x0i = x0 as i64;
    let top = pick(y0i, x0i) * (1.0 - tx) + pick(y0i, x0i + 1) * tx;
    let bottom = pick(y0i + 1, x0i) * (1.0 - tx) + pick(y0i + 1, x0i + 1) * tx;
    top * (1.0 - ty) + bottom * ty
}

/// Fits a parabola to the correlation peak and its two
/// neighbors along one axis; returns the fractional offset of
/// the true maximum, clamped to (-0.5, 0.5).
pub (crate) fn parabolic_peak_offset(before : f32, peak : f32, after : f32) -> f32 {
    let denom = before - 2.0 * peak + after;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (before - after) / denom).clamp(-0.5, 0.5)
}
