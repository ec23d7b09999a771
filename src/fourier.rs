//! 2d FFT primitives and phase correlation.
//!
//! All registration stages and the correlation-map construction go
//! through this module. Plans are cached inside an `FftEngine` that
//! is created once per frame shape and shared read-only across
//! worker threads -- `rustfft` plan objects are `Send + Sync` and
//! every call uses its own scratch buffers, so concurrent
//! correlation of independent frame pairs is safe.

use std::sync::Arc;

use ndarray::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::data::dimensions::Dimensions;

/// Options controlling how images are conditioned before
/// correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationOptions {
    /// Taper both images with a separable raised-cosine (Hann)
    /// window to suppress edge artifacts
    pub apodize : bool,
    /// Gaussian low-pass applied to the cross-power spectrum,
    /// in pixels of spatial sigma. `None` disables masking.
    pub smooth_sigma : Option<f32>,
    /// Floor for the cross-power magnitude when normalizing --
    /// guards the division for near-zero frequency bins.
    pub eps : f32,
}

impl Default for CorrelationOptions {
    fn default() -> Self {
        CorrelationOptions {
            apodize : true,
            smooth_sigma : Some(1.15),
            eps : 1e-8,
        }
    }
}

/// Cached FFT plans plus the precomputed window and frequency
/// mask for one frame shape.
pub struct FftEngine {
    dims : Dimensions,
    row_fwd : Arc<dyn Fft<f32>>,
    row_inv : Arc<dyn Fft<f32>>,
    col_fwd : Arc<dyn Fft<f32>>,
    col_inv : Arc<dyn Fft<f32>>,
    window : Option<Array2<f32>>,
    freq_mask : Option<Array2<f32>>,
    eps : f32,
}

impl FftEngine {
    /// Plans forward and inverse transforms for rows and columns
    /// of a `dims`-shaped frame and precomputes the apodization
    /// window and frequency mask requested by `opts`.
    pub fn new(dims : Dimensions, opts : &CorrelationOptions) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let row_fwd = planner.plan_fft_forward(dims.xdim);
        let row_inv = planner.plan_fft_inverse(dims.xdim);
        let col_fwd = planner.plan_fft_forward(dims.ydim);
        let col_inv = planner.plan_fft_inverse(dims.ydim);

        let window = opts.apodize.then(|| hann_window(dims));
        let freq_mask = opts.smooth_sigma.map(|sigma| gaussian_freq_mask(dims, sigma));

        FftEngine {
            dims,
            row_fwd,
            row_inv,
            col_fwd,
            col_inv,
            window,
            freq_mask,
            eps : opts.eps,
        }
    }

    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    /// Forward 2d transform in place: row FFTs, then column FFTs.
    pub fn fft2(&self, array : &mut Array2<Complex<f32>>) {
        self.transform(array, &self.row_fwd, &self.col_fwd);
    }

    /// Inverse 2d transform in place, normalized by `1 / (ydim * xdim)`.
    pub fn ifft2(&self, array : &mut Array2<Complex<f32>>) {
        self.transform(array, &self.row_inv, &self.col_inv);
        let norm = 1.0 / (self.dims.n_pixels() as f32);
        array.iter_mut().for_each(|v| *v *= norm);
    }

    fn transform(
        &self,
        array : &mut Array2<Complex<f32>>,
        row_plan : &Arc<dyn Fft<f32>>,
        col_plan : &Arc<dyn Fft<f32>>,
    ) {
        let (ydim, xdim) = self.dims.to_tuple();

        let mut buf = vec![Complex::new(0.0f32, 0.0); xdim.max(ydim)];

        for y in 0..ydim {
            for x in 0..xdim {
                buf[x] = array[[y, x]];
            }
            row_plan.process(&mut buf[..xdim]);
            for x in 0..xdim {
                array[[y, x]] = buf[x];
            }
        }

        for x in 0..xdim {
            for y in 0..ydim {
                buf[y] = array[[y, x]];
            }
            col_plan.process(&mut buf[..ydim]);
            for y in 0..ydim {
                array[[y, x]] = buf[y];
            }
        }
    }

    /// Conditions an image (subtract mean, apodize if configured)
    /// and returns its frequency-domain representation.
    pub fn spectrum(&self, image : ArrayView2<f32>) -> Array2<Complex<f32>> {
        let mean = image.mean().unwrap_or(0.0);
        let mut complex = match &self.window {
            Some(window) => {
                Array2::from_shape_fn(self.dims.to_tuple(), |(y, x)| {
                    Complex::new((image[[y, x]] - mean) * window[[y, x]], 0.0)
                })
            },
            None => {
                Array2::from_shape_fn(self.dims.to_tuple(), |(y, x)| {
                    Complex::new(image[[y, x]] - mean, 0.0)
                })
            }
        };
        self.fft2(&mut complex);
        complex
    }

    /// Conditioned, transformed, and conjugated -- the form in
    /// which a reference image is held for repeated correlation
    /// against many frames.
    pub fn conj_spectrum(&self, image : ArrayView2<f32>) -> Array2<Complex<f32>> {
        let mut spectrum = self.spectrum(image);
        spectrum.iter_mut().for_each(|v| *v = v.conj());
        spectrum
    }

    /// Phase correlation of a moving spectrum against a
    /// (conjugated) reference spectrum. Returns the real-valued
    /// correlation surface; the zero-shift response sits at
    /// `[0, 0]` with wrap-around for negative shifts.
    pub fn correlate_spectra(
        &self,
        moving : &Array2<Complex<f32>>,
        reference_conj : &Array2<Complex<f32>>,
    ) -> Array2<f32> {
        let mut cross = Array2::from_shape_fn(self.dims.to_tuple(), |(y, x)| {
            let product = moving[[y, x]] * reference_conj[[y, x]];
            // normalized cross-power spectrum with an epsilon floor
            product / product.norm().max(self.eps)
        });

        if let Some(mask) = &self.freq_mask {
            cross.iter_mut().zip(mask.iter()).for_each(|(v, &m)| *v *= m);
        }

        self.ifft2(&mut cross);
        cross.mapv(|v| v.re)
    }

    /// One-shot phase correlation of two equal-shaped images.
    pub fn phase_correlate(
        &self,
        moving : ArrayView2<f32>,
        reference : ArrayView2<f32>,
    ) -> Array2<f32> {
        let moving_spectrum = self.spectrum(moving);
        let reference_conj = self.conj_spectrum(reference);
        self.correlate_spectra(&moving_spectrum, &reference_conj)
    }
}

/// Separable Hann taper over the frame.
fn hann_window(dims : Dimensions) -> Array2<f32> {
    let hann_1d = |n : usize| -> Vec<f32> {
        (0..n).map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
            0.5 * (1.0 - phase.cos())
        }).collect()
    };
    let wy = hann_1d(dims.ydim);
    let wx = hann_1d(dims.xdim);
    Array2::from_shape_fn(dims.to_tuple(), |(y, x)| wy[y] * wx[x])
}

/// Gaussian low-pass multiplier for the cross-power spectrum.
/// `sigma` is the spatial-domain smoothing sigma in pixels; the
/// frequency response is the (separable) Fourier transform of
/// that Gaussian.
fn gaussian_freq_mask(dims : Dimensions, sigma : f32) -> Array2<f32> {
    let gauss_1d = |n : usize| -> Vec<f32> {
        (0..n).map(|k| {
            // signed frequency index, DC at 0
            let freq = if k <= n / 2 { k as f32 } else { k as f32 - n as f32 };
            let arg = std::f32::consts::PI * sigma * freq / n as f32;
            (-2.0 * arg * arg).exp()
        }).collect()
    };
    let gy = gauss_1d(dims.ydim);
    let gx = gauss_1d(dims.xdim);
    Array2::from_shape_fn(dims.to_tuple(), |(y, x)| gy[y] * gx[x])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(ydim : usize, xdim : usize) -> FftEngine {
        // no windowing or masking so the peaks are exact
        let opts = CorrelationOptions {
            apodize : false,
            smooth_sigma : None,
            eps : 1e-8,
        };
        FftEngine::new(Dimensions::new(xdim, ydim), &opts)
    }

    fn argmax(surface : &Array2<f32>) -> (usize, usize) {
        let mut best = (0, 0);
        let mut best_val = f32::NEG_INFINITY;
        for ((y, x), &v) in surface.indexed_iter() {
            if v > best_val {
                best_val = v;
                best = (y, x);
            }
        }
        best
    }

    #[test]
    fn test_roundtrip_fft2() {
        let engine = test_engine(16, 32);
        let original = Array2::from_shape_fn((16, 32), |(y, x)| {
            Complex::new((y * 3 + x) as f32, 0.0)
        });
        let mut array = original.clone();
        engine.fft2(&mut array);
        engine.ifft2(&mut array);
        original.iter().zip(array.iter()).for_each(|(a, b)| {
            assert!((a.re - b.re).abs() < 1e-3);
            assert!(b.im.abs() < 1e-3);
        });
    }

    #[test]
    fn test_self_correlation_peaks_at_zero() {
        let engine = test_engine(32, 32);
        let image = Array2::from_shape_fn((32, 32), |(y, x)| {
            ((y as f32 - 12.0).powi(2) + (x as f32 - 20.0).powi(2)).sqrt().sin()
        });
        let surface = engine.phase_correlate(image.view(), image.view());
        assert_eq!(argmax(&surface), (0, 0));
    }

    #[test]
    fn test_translation_peak_position() {
        let engine = test_engine(32, 32);
        let reference = Array2::from_shape_fn((32, 32), |(y, x)| {
            (-(((y as f32 - 16.0).powi(2) + (x as f32 - 16.0).powi(2)) / 8.0)).exp()
        });
        // shift down 3, right 2 with wraparound
        let moving = Array2::from_shape_fn((32, 32), |(y, x)| {
            reference[[(y + 32 - 3) % 32, (x + 32 - 2) % 32]]
        });
        let surface = engine.phase_correlate(moving.view(), reference.view());
        assert_eq!(argmax(&surface), (3, 2));
    }

    #[test]
    fn test_gaussian_mask_is_unit_at_dc() {
        let mask = gaussian_freq_mask(Dimensions::new(16, 16), 1.15);
        assert!((mask[[0, 0]] - 1.0).abs() < 1e-6);
        // monotone falloff away from DC along an axis up to nyquist
        assert!(mask[[0, 1]] > mask[[0, 2]]);
        assert!(mask[[0, 2]] > mask[[0, 7]]);
        // symmetric in positive and negative frequencies
        assert!((mask[[0, 1]] - mask[[0, 15]]).abs() < 1e-6);
    }
}
