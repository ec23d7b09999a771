//! Block-wise non-rigid registration.
//!
//! Each (rigidly pre-aligned) frame is partitioned into
//! overlapping blocks; every block runs the same phase
//! correlation primitive as rigid registration against the
//! matching crop of the reference. The sparse block-shift grid
//! is cleaned (low-confidence blocks inherit from their
//! neighbors), smoothed, bilinearly upsampled to a per-pixel
//! displacement field, and applied by resampling the frame.

use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::config::NonrigidConfig;
use crate::data::dimensions::Dimensions;
use crate::diagnostics::CancelToken;
use crate::fourier::{CorrelationOptions, FftEngine};
use crate::utils::parallelize_op;
use crate::CorrosuiteError;

use super::rigid::estimate_from_surface;
use super::{bilinear_sample, EdgeFill};

/// Overlapping block geometry over one frame shape. Starts are
/// evenly spaced so the first block touches the top/left border
/// and the last touches the bottom/right border.
#[derive(Debug, Clone)]
pub struct BlockGrid {
    pub block_ydim : usize,
    pub block_xdim : usize,
    pub y_starts : Vec<usize>,
    pub x_starts : Vec<usize>,
}

impl BlockGrid {
    pub fn new(
        dims : &Dimensions,
        block_size : usize,
        overlap_frac : f32,
    ) -> Result<Self, CorrosuiteError> {
        if block_size > dims.ydim || block_size > dims.xdim {
            return Err(CorrosuiteError::Configuration(format!(
                "Block size {} exceeds frame dimensions ({}, {})",
                block_size, dims.ydim, dims.xdim,
            )));
        }
        if !(0.0..1.0).contains(&overlap_frac) {
            return Err(CorrosuiteError::Configuration(format!(
                "Block overlap fraction {} outside [0, 1)", overlap_frac,
            )));
        }

        Ok(BlockGrid {
            block_ydim : block_size,
            block_xdim : block_size,
            y_starts : block_starts(dims.ydim, block_size, overlap_frac),
            x_starts : block_starts(dims.xdim, block_size, overlap_frac),
        })
    }

    /// (blocks along y, blocks along x)
    pub fn n_blocks(&self) -> (usize, usize) {
        (self.y_starts.len(), self.x_starts.len())
    }

    /// Block centers along y, in pixel coordinates.
    pub fn y_centers(&self) -> Vec<f32> {
        self.y_starts.iter()
            .map(|&s| s as f32 + (self.block_ydim as f32 - 1.0) / 2.0)
            .collect()
    }

    /// Block centers along x, in pixel coordinates.
    pub fn x_centers(&self) -> Vec<f32> {
        self.x_starts.iter()
            .map(|&s| s as f32 + (self.block_xdim as f32 - 1.0) / 2.0)
            .collect()
    }
}

/// Evenly spaced block starts covering `[0, extent - block]`,
/// with spacing at most `block * (1 - overlap)`.
fn block_starts(extent : usize, block : usize, overlap_frac : f32) -> Vec<usize> {
    if block >= extent {
        return vec![0];
    }
    let span = extent - block;
    let stride = (block as f32 * (1.0 - overlap_frac)).max(1.0);
    let n = (span as f32 / stride).ceil() as usize + 1;
    (0..n)
        .map(|i| (span as f32 * i as f32 / (n - 1) as f32).round() as usize)
        .collect()
}

/// Per-frame block shift field: full (integer + subpixel)
/// shifts per block and which blocks produced a trustworthy
/// peak.
#[derive(Debug, Clone)]
pub struct BlockShiftField {
    pub dy : Array2<f32>,
    pub dx : Array2<f32>,
    pub valid : Array2<bool>,
}

impl BlockShiftField {
    pub fn n_invalid(&self) -> usize {
        self.valid.iter().filter(|&&v| !v).count()
    }

    /// Largest shift magnitude in the field.
    pub fn max_magnitude(&self) -> f32 {
        self.dy.iter().zip(self.dx.iter())
            .map(|(&dy, &dx)| (dy * dy + dx * dx).sqrt())
            .fold(0.0, f32::max)
    }
}

/// Per-frame non-rigid diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonrigidFrameDiag {
    pub n_low_confidence_blocks : usize,
    pub max_block_shift : f32,
    pub processed : bool,
}

/// Precomputed per-run state: block geometry, a block-shaped
/// FFT engine, and the conjugated spectrum of every reference
/// crop. Shared read-only across worker threads.
pub struct NonrigidContext {
    grid : BlockGrid,
    block_engine : FftEngine,
    block_conj : Vec<Array2<Complex<f32>>>,
    max_shift : usize,
    min_peak_ratio : f32,
}

impl NonrigidContext {
    pub fn new(
        reference : ArrayView2<f32>,
        dims : &Dimensions,
        cfg : &NonrigidConfig,
        corr_opts : &CorrelationOptions,
    ) -> Result<Self, CorrosuiteError> {
        dims.check_matches(&Dimensions::from_shape(reference.shape()))?;
        let grid = BlockGrid::new(dims, cfg.block_size, cfg.overlap_frac)?;

        let block_dims = Dimensions::new(grid.block_xdim, grid.block_ydim);
        let block_engine = FftEngine::new(block_dims, corr_opts);

        let mut block_conj = Vec::with_capacity(
            grid.y_starts.len() * grid.x_starts.len());
        for &ys in grid.y_starts.iter() {
            for &xs in grid.x_starts.iter() {
                let crop = reference.slice(
                    s![ys..ys + grid.block_ydim, xs..xs + grid.block_xdim]);
                block_conj.push(block_engine.conj_spectrum(crop));
            }
        }

        let max_shift = cfg.max_shift_block
            .clamp(1, (cfg.block_size / 2).saturating_sub(1).max(1));

        Ok(NonrigidContext {
            grid,
            block_engine,
            block_conj,
            max_shift,
            min_peak_ratio : cfg.min_peak_ratio_block,
        })
    }

    pub fn grid(&self) -> &BlockGrid {
        &self.grid
    }

    /// Runs the rigid primitive on every block of one frame.
    pub fn estimate_block_shifts(&self, frame : ArrayView2<f32>) -> BlockShiftField {
        let (ny, nx) = self.grid.n_blocks();
        let mut dy = Array2::<f32>::zeros((ny, nx));
        let mut dx = Array2::<f32>::zeros((ny, nx));
        let mut valid = Array2::<bool>::from_elem((ny, nx), false);

        for (iy, &ys) in self.grid.y_starts.iter().enumerate() {
            for (ix, &xs) in self.grid.x_starts.iter().enumerate() {
                let crop = frame.slice(
                    s![ys..ys + self.grid.block_ydim, xs..xs + self.grid.block_xdim]);
                let spectrum = self.block_engine.spectrum(crop);
                let surface = self.block_engine.correlate_spectra(
                    &spectrum, &self.block_conj[iy * nx + ix]);
                let estimate = estimate_from_surface(
                    &surface, self.max_shift, self.min_peak_ratio);

                dy[[iy, ix]] = estimate.dy as f32 + estimate.subpixel_dy;
                dx[[iy, ix]] = estimate.dx as f32 + estimate.subpixel_dx;
                valid[[iy, ix]] = !estimate.low_confidence;
            }
        }

        BlockShiftField { dy, dx, valid }
    }

    /// Estimate, clean, smooth, upsample, and apply the
    /// displacement field for one frame in place. Returns the
    /// frame's diagnostics.
    pub fn register_frame(
        &self,
        frame : &mut ArrayViewMut2<f32>,
        edge : EdgeFill,
    ) -> NonrigidFrameDiag {
        let mut field = self.estimate_block_shifts(frame.view());
        let n_low_confidence = field.n_invalid();

        fill_invalid_blocks(&mut field);
        let dy_grid = smooth_grid(&field.dy);
        let dx_grid = smooth_grid(&field.dx);

        let dims = Dimensions::new(frame.shape()[1], frame.shape()[0]);
        let (dy_field, dx_field) = upsample_field(&self.grid, &dims, &dy_grid, &dx_grid);
        warp_frame(frame, &dy_field, &dx_field, edge);

        NonrigidFrameDiag {
            n_low_confidence_blocks : n_low_confidence,
            max_block_shift : field.max_magnitude(),
            processed : true,
        }
    }
}

/// Low-confidence blocks inherit an inverse-distance-weighted
/// average of the valid blocks' shifts instead of their own
/// unreliable estimate. A field with no valid block at all
/// falls back to zero everywhere.
pub fn fill_invalid_blocks(field : &mut BlockShiftField) {
    let (ny, nx) = field.dy.dim();
    let any_valid = field.valid.iter().any(|&v| v);
    if !any_valid {
        field.dy.fill(0.0);
        field.dx.fill(0.0);
        return;
    }

    let valid_entries : Vec<(usize, usize, f32, f32)> = field.valid.indexed_iter()
        .filter(|(_, &v)| v)
        .map(|((iy, ix), _)| (iy, ix, field.dy[[iy, ix]], field.dx[[iy, ix]]))
        .collect();

    for iy in 0..ny {
        for ix in 0..nx {
            if field.valid[[iy, ix]] {
                continue;
            }
            let mut weight_sum = 0.0f32;
            let mut dy_sum = 0.0f32;
            let mut dx_sum = 0.0f32;
            for &(vy, vx, dy, dx) in valid_entries.iter() {
                let d2 = (vy as f32 - iy as f32).powi(2)
                    + (vx as f32 - ix as f32).powi(2);
                let w = 1.0 / d2.max(1e-6);
                weight_sum += w;
                dy_sum += w * dy;
                dx_sum += w * dx;
            }
            field.dy[[iy, ix]] = dy_sum / weight_sum;
            field.dx[[iy, ix]] = dx_sum / weight_sum;
        }
    }
}

/// 3x3 normalized box smoothing of the block grid, clamping at
/// the grid borders. Keeps block-boundary discontinuities out
/// of the upsampled field.
pub fn smooth_grid(grid : &Array2<f32>) -> Array2<f32> {
    let (ny, nx) = grid.dim();
    Array2::from_shape_fn((ny, nx), |(iy, ix)| {
        let mut sum = 0.0f32;
        let mut count = 0u32;
        for oy in -1i64..=1 {
            for ox in -1i64..=1 {
                let y = iy as i64 + oy;
                let x = ix as i64 + ox;
                if y >= 0 && x >= 0 && (y as usize) < ny && (x as usize) < nx {
                    sum += grid[[y as usize, x as usize]];
                    count += 1;
                }
            }
        }
        sum / count as f32
    })
}

/// Bilinear interpolation table along one axis: for every pixel
/// coordinate, the bracketing block indices and the fractional
/// position between their centers. Pixels outside the span of
/// centers clamp to the nearest block (constant extrapolation).
fn axis_interp(centers : &[f32], extent : usize) -> Vec<(usize, usize, f32)> {
    let mut table = Vec::with_capacity(extent);
    let mut hi = 0usize;
    for p in 0..extent {
        let pos = p as f32;
        while hi + 1 < centers.len() && centers[hi] < pos {
            hi += 1;
        }
        if hi == 0 || pos <= centers[0] {
            table.push((0, 0, 0.0));
        } else if pos >= centers[centers.len() - 1] {
            let last = centers.len() - 1;
            table.push((last, last, 0.0));
        } else {
            let lo = hi - 1;
            let t = (pos - centers[lo]) / (centers[hi] - centers[lo]);
            table.push((lo, hi, t));
        }
    }
    table
}

/// Upsamples the smoothed block grids to per-pixel displacement
/// fields by bilinear interpolation between block centers.
pub fn upsample_field(
    grid : &BlockGrid,
    dims : &Dimensions,
    dy_grid : &Array2<f32>,
    dx_grid : &Array2<f32>,
) -> (Array2<f32>, Array2<f32>) {
    let y_table = axis_interp(&grid.y_centers(), dims.ydim);
    let x_table = axis_interp(&grid.x_centers(), dims.xdim);

    let interp = |g : &Array2<f32>, y : usize, x : usize| -> f32 {
        let (y0, y1, ty) = y_table[y];
        let (x0, x1, tx) = x_table[x];
        let top = g[[y0, x0]] * (1.0 - tx) + g[[y0, x1]] * tx;
        let bottom = g[[y1, x0]] * (1.0 - tx) + g[[y1, x1]] * tx;
        top * (1.0 - ty) + bottom * ty
    };

    let dy_field = Array2::from_shape_fn(dims.to_tuple(), |(y, x)| interp(dy_grid, y, x));
    let dx_field = Array2::from_shape_fn(dims.to_tuple(), |(y, x)| interp(dx_grid, y, x));
    (dy_field, dx_field)
}

/// Resamples the frame through the per-pixel displacement
/// field: the output at (y, x) is read from
/// `(y - dy, x - dx)` with bilinear interpolation.
pub fn warp_frame(
    frame : &mut ArrayViewMut2<f32>,
    dy_field : &Array2<f32>,
    dx_field : &Array2<f32>,
    edge : EdgeFill,
) {
    let src = frame.to_owned();
    let src_view = src.view();
    let (ydim, xdim) = src.dim();
    for y in 0..ydim {
        for x in 0..xdim {
            frame[[y, x]] = bilinear_sample(
                &src_view,
                y as f32 - dy_field[[y, x]],
                x as f32 - dx_field[[y, x]],
                edge,
            );
        }
    }
}

/// Non-rigidly registers every frame of the (rigidly
/// pre-aligned) stack in place. Frames are independent; the
/// context is shared read-only. Cancellation is checked between
/// frames; unreached frames are left untouched with
/// `processed == false`.
pub fn register_stack(
    stack : &mut Array3<f32>,
    reference : ArrayView2<f32>,
    cfg : &NonrigidConfig,
    corr_opts : &CorrelationOptions,
    edge : EdgeFill,
    batch_size : usize,
    cancel : &CancelToken,
) -> Result<Vec<NonrigidFrameDiag>, CorrosuiteError> {
    let n_frames = stack.shape()[0];
    let dims = Dimensions::from_shape(stack.shape());
    let ctx = NonrigidContext::new(reference, &dims, cfg, corr_opts)?;

    let mut diags = vec![NonrigidFrameDiag::default(); n_frames];

    parallelize_op!(
        mut stack,
        batch_size,
        diags,
        |range : std::ops::Range<usize>, chunk : &mut ArrayViewMut3<f32>, out : &mut [NonrigidFrameDiag]|
            -> Result<(), CorrosuiteError> {
            for (local, _frame_idx) in range.enumerate() {
                if cancel.is_cancelled() {
                    break;
                }
                out[local] = ctx.register_frame(
                    &mut chunk.index_axis_mut(Axis(0), local), edge);
            }
            Ok(())
        }
    );

    Ok(diags)
}
