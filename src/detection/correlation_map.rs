//! Movie conditioning and the activity correlation map.
//!
//! Detection does not run on the raw registered movie. The
//! movie is temporally binned, each pixel's time series is
//! centered and variance-normalized, and (optionally) each
//! frame is spatially smoothed. After smoothing, the temporal
//! standard deviation of a pixel measures how strongly it
//! co-fluctuates with its neighborhood -- isolated noise
//! averages away while coherent cellular activity survives.
//! That per-pixel standard deviation is the correlation map
//! that seeds ROI extraction.

use ndarray::prelude::*;
use rayon::prelude::*;

use crate::config::DetectionConfig;
use crate::data::dimensions::{Dimensions, DimensionsError};
use crate::CorrosuiteError;

/// Variance floor so constant pixels normalize to zero instead
/// of blowing up.
const SD_FLOOR : f32 = 1e-6;

/// The conditioned movie plus its correlation map. Extraction
/// peels accepted components out of `data` and refreshes `map`
/// over the affected pixels, so both evolve as detection runs.
pub struct DetectionMovie {
    pub data : Array3<f32>,
    pub map : Array2<f32>,
    /// Median of the full map at construction time; the
    /// stopping threshold is a multiple of this.
    pub noise_floor : f32,
}

impl DetectionMovie {
    pub fn new(
        stack : ArrayView3<f32>,
        cfg : &DetectionConfig,
    ) -> Result<Self, CorrosuiteError> {
        let n_frames = stack.shape()[0];
        if n_frames == 0 {
            return Err(DimensionsError::EmptyStack.into());
        }
        let n_bins = n_frames / cfg.bin_factor;
        if n_bins == 0 {
            return Err(CorrosuiteError::Configuration(format!(
                "bin_factor {} leaves no frames from a stack of {}",
                cfg.bin_factor, n_frames)));
        }

        let dims = Dimensions::from_shape(stack.shape());
        let (ydim, xdim) = dims.to_tuple();

        let mut data = bin_temporal(&stack, cfg.bin_factor, n_bins);
        normalize_pixels(&mut data);

        if cfg.smooth_spatial {
            let frames : Vec<_> = data.axis_iter_mut(Axis(0)).collect();
            frames.into_par_iter().for_each(|mut frame| {
                let smoothed = smooth_frame(&frame.view());
                frame.assign(&smoothed);
            });
        }

        let map = Array2::from_shape_fn((ydim, xdim), |(y, x)| {
            temporal_sd(&data, y, x)
        });
        let noise_floor = map_median(&map);

        Ok(DetectionMovie { data, map, noise_floor })
    }

    pub fn dims(&self) -> Dimensions {
        let shape = self.data.shape();
        Dimensions::new(shape[2], shape[1])
    }

    pub fn n_bins(&self) -> usize {
        self.data.shape()[0]
    }

    /// True when the map has nothing to seed from: no positive
    /// variation anywhere.
    pub fn is_flat(&self) -> bool {
        self.map.iter().all(|&v| v <= 0.0)
    }

    /// Refreshes the map at the given pixels after their time
    /// series changed.
    pub fn recompute_map_at(&mut self, pixels : &[(usize, usize)]) {
        for &(y, x) in pixels.iter() {
            self.map[[y, x]] = temporal_sd(&self.data, y, x);
        }
    }

    /// Subtracts a weighted component from the movie: each
    /// pixel of the region loses `weight * trace` from its time
    /// series. The map over the region is refreshed afterwards.
    pub fn peel(
        &mut self,
        pixels : &[(usize, usize)],
        weights : &[f32],
        trace : &[f32],
    ) {
        for (&(y, x), &w) in pixels.iter().zip(weights.iter()) {
            for (t, &value) in trace.iter().enumerate() {
                self.data[[t, y, x]] -= w * value;
            }
        }
        self.recompute_map_at(pixels);
    }

    /// Weighted temporal trace of a region: the inner product
    /// of the unit weight vector with each binned frame.
    pub fn project(
        &self,
        pixels : &[(usize, usize)],
        weights : &[f32],
    ) -> Vec<f32> {
        (0..self.n_bins())
            .map(|t| {
                pixels.iter().zip(weights.iter())
                    .map(|(&(y, x), &w)| w * self.data[[t, y, x]])
                    .sum()
            })
            .collect()
    }
}

/// Mean of each group of `bin_factor` consecutive frames.
/// Trailing frames that do not fill a bin are dropped.
fn bin_temporal(
    stack : &ArrayView3<f32>,
    bin_factor : usize,
    n_bins : usize,
) -> Array3<f32> {
    let (ydim, xdim) = (stack.shape()[1], stack.shape()[2]);
    if bin_factor == 1 {
        return stack.slice(s![..n_bins, .., ..]).to_owned();
    }

    let mut binned = Array3::<f32>::zeros((n_bins, ydim, xdim));
    for b in 0..n_bins {
        let group = stack.slice(s![b * bin_factor..(b + 1) * bin_factor, .., ..]);
        let mut target = binned.index_axis_mut(Axis(0), b);
        for frame in group.axis_iter(Axis(0)) {
            target += &frame;
        }
        target /= bin_factor as f32;
    }
    binned
}

/// Centers and variance-normalizes every pixel's time series in
/// place.
fn normalize_pixels(data : &mut Array3<f32>) {
    let n_bins = data.shape()[0] as f32;
    let (ydim, xdim) = (data.shape()[1], data.shape()[2]);

    for y in 0..ydim {
        for x in 0..xdim {
            let mut series = data.slice_mut(s![.., y, x]);
            let mean = series.iter().sum::<f32>() / n_bins;
            let var = series.iter()
                .map(|&v| (v - mean).powi(2))
                .sum::<f32>() / n_bins;
            let scale = 1.0 / (var.sqrt() + SD_FLOOR);
            series.iter_mut().for_each(|v| *v = (*v - mean) * scale);
        }
    }
}

/// 3x3 normalized box smoothing of one frame, clamping at the
/// borders.
fn smooth_frame(frame : &ArrayView2<f32>) -> Array2<f32> {
    let (ydim, xdim) = frame.dim();
    Array2::from_shape_fn((ydim, xdim), |(y, x)| {
        let mut sum = 0.0f32;
        let mut count = 0u32;
        for oy in -1i64..=1 {
            for ox in -1i64..=1 {
                let ny = y as i64 + oy;
                let nx = x as i64 + ox;
                if ny >= 0 && nx >= 0 && (ny as usize) < ydim && (nx as usize) < xdim {
                    sum += frame[[ny as usize, nx as usize]];
                    count += 1;
                }
            }
        }
        sum / count as f32
    })
}

fn temporal_sd(data : &Array3<f32>, y : usize, x : usize) -> f32 {
    let n = data.shape()[0] as f32;
    let series = data.slice(s![.., y, x]);
    let mean = series.iter().sum::<f32>() / n;
    let var = series.iter().map(|&v| (v - mean).powi(2)).sum::<f32>() / n;
    var.sqrt()
}

/// Median over the whole map. Active pixels are a sparse
/// minority of the frame, so the median reflects the background
/// even when every positive value belongs to signal.
fn map_median(map : &Array2<f32>) -> f32 {
    let mut values : Vec<f32> = map.iter().copied().collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}
