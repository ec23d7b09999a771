//! Iterative reference image construction.
//!
//! A subset of frames seeds the reference with the average of
//! the most mutually correlated frames, then the reference is
//! refined by alternating registration of the subset against it
//! with re-averaging of the best-aligned half, until the
//! subset's shifts stop changing between iterations.

use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::{ReferenceConfig, RigidConfig, SubsetSelection};
use crate::data::dimensions::{Dimensions, DimensionsError};
use crate::diagnostics::CancelToken;
use crate::fourier::FftEngine;
use crate::CorrosuiteError;

use super::rigid::{phasecorr, RigidContext};
use super::{apply_shift, shifted, EdgeFill, ShiftEstimate};

/// How the reference build went.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceDiagnostics {
    pub iterations : usize,
    /// Set once the subset's shifts stop changing between
    /// iterations
    pub converged : bool,
    /// Mean subset shift magnitude at the last iteration, in
    /// pixels
    pub final_mean_shift : f32,
    pub cancelled : bool,
}

/// Builds a reference image from the stack.
///
/// A cancelled run returns the best reference produced so far
/// with `cancelled` set rather than an error.
pub fn compute_reference(
    stack : ArrayView3<f32>,
    engine : &FftEngine,
    cfg : &ReferenceConfig,
    rigid_cfg : &RigidConfig,
    cancel : &CancelToken,
) -> Result<(Array2<f32>, ReferenceDiagnostics), CorrosuiteError> {
    let n_frames = stack.shape()[0];
    if n_frames == 0 {
        return Err(DimensionsError::EmptyStack.into());
    }
    engine.dims().check_matches(&Dimensions::from_shape(stack.shape()))?;

    let subset = subset_indices(n_frames, cfg.subset_size, cfg.selection);
    let mut reference = seed_reference(&stack, &subset, cfg.seed_fraction);

    let mut diag = ReferenceDiagnostics::default();
    let mut previous_shifts : Option<Vec<(f32, f32)>> = None;

    for iteration in 0..cfg.max_iterations {
        if cancel.is_cancelled() {
            diag.cancelled = true;
            break;
        }
        diag.iterations = iteration + 1;

        let ctx = RigidContext::new(engine, reference.view(), rigid_cfg)?;
        let estimates : Vec<ShiftEstimate> = subset.par_iter()
            .map(|&idx| phasecorr(engine, &ctx, stack.index_axis(Axis(0), idx)))
            .collect();

        reference = aligned_mean(&stack, &subset, &estimates);

        let shifts : Vec<(f32, f32)> = estimates.iter()
            .map(|e| (e.dy as f32 + e.subpixel_dy, e.dx as f32 + e.subpixel_dx))
            .collect();
        diag.final_mean_shift = estimates.iter()
            .map(|e| e.magnitude())
            .sum::<f32>() / estimates.len() as f32;

        // keep the reference from drifting: undo the subset's
        // mean displacement
        let mean_dy = shifts.iter().map(|s| s.0).sum::<f32>()
            / shifts.len() as f32;
        let mean_dx = shifts.iter().map(|s| s.1).sum::<f32>()
            / shifts.len() as f32;
        let recentre = (-mean_dy.round() as i32, -mean_dx.round() as i32);
        if recentre != (0, 0) {
            apply_shift(
                &mut reference.view_mut(),
                recentre.0,
                recentre.1,
                EdgeFill::Replicate,
            );
        }

        // frame shifts reflect the frames' own jitter and never
        // shrink; the build has settled once they stop changing
        // between iterations. Recentring is covered too: it
        // offsets the next round's estimates uniformly.
        if let Some(prev) = &previous_shifts {
            let change = shifts.iter().zip(prev.iter())
                .map(|(s, p)| {
                    ((s.0 - p.0).powi(2) + (s.1 - p.1).powi(2)).sqrt()
                })
                .sum::<f32>() / shifts.len() as f32;
            if change < cfg.convergence_px {
                diag.converged = true;
                break;
            }
        }
        previous_shifts = Some(shifts);
    }

    Ok((reference, diag))
}

/// Indices of the frames used to build the reference: evenly
/// spaced across the recording, or a seeded random draw.
pub (crate) fn subset_indices(
    n_frames : usize,
    subset_size : usize,
    selection : SubsetSelection,
) -> Vec<usize> {
    let size = subset_size.clamp(1, n_frames);
    match selection {
        SubsetSelection::Evenly => {
            (0..size)
                .map(|i| i * n_frames / size + n_frames / (2 * size))
                .collect()
        },
        SubsetSelection::Random { seed } => {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut indices : Vec<usize> = (0..n_frames).collect();
            indices.shuffle(&mut rng);
            indices.truncate(size);
            indices.sort_unstable();
            indices
        }
    }
}

/// Seed reference: the average of the subset frames most
/// correlated with the rest of the subset. Correlations are
/// computed on 4x-downsampled frames, which is plenty to rank
/// frames and much cheaper.
fn seed_reference(
    stack : &ArrayView3<f32>,
    subset : &[usize],
    seed_fraction : f32,
) -> Array2<f32> {
    let thumbs : Vec<Vec<f32>> = subset.iter()
        .map(|&idx| downsample(stack.index_axis(Axis(0), idx), 4))
        .collect();

    let n = subset.len();
    let mut mean_corr = vec![0.0f32; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let c = pearson(&thumbs[i], &thumbs[j]);
            mean_corr[i] += c;
            mean_corr[j] += c;
        }
    }

    let mut order : Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        mean_corr[b].partial_cmp(&mean_corr[a]).unwrap_or(std::cmp::Ordering::Equal)
    });
    let n_seed = ((n as f32 * seed_fraction).round() as usize).clamp(1, n);

    let (ydim, xdim) = (stack.shape()[1], stack.shape()[2]);
    let mut seed = Array2::<f32>::zeros((ydim, xdim));
    for &rank in order[..n_seed].iter() {
        seed += &stack.index_axis(Axis(0), subset[rank]);
    }
    seed /= n_seed as f32;
    seed
}

/// Average of the best-correlating half of the subset, each
/// frame shifted into alignment first.
fn aligned_mean(
    stack : &ArrayView3<f32>,
    subset : &[usize],
    estimates : &[ShiftEstimate],
) -> Array2<f32> {
    let mut order : Vec<usize> = (0..subset.len()).collect();
    order.sort_by(|&a, &b| {
        estimates[b].peak_ratio
            .partial_cmp(&estimates[a].peak_ratio)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let n_keep = (subset.len() / 2).max(1);

    let (ydim, xdim) = (stack.shape()[1], stack.shape()[2]);
    let mut mean = Array2::<f32>::zeros((ydim, xdim));
    for &rank in order[..n_keep].iter() {
        mean += &shifted(
            stack.index_axis(Axis(0), subset[rank]),
            estimates[rank].dy,
            estimates[rank].dx,
            EdgeFill::Replicate,
        );
    }
    mean /= n_keep as f32;
    mean
}

/// Block-mean downsample, flattened. Trailing rows and columns
/// that do not fill a block are dropped.
fn downsample(frame : ArrayView2<f32>, factor : usize) -> Vec<f32> {
    let (ydim, xdim) = frame.dim();
    let oy = (ydim / factor).max(1);
    let ox = (xdim / factor).max(1);
    let fy = ydim / oy;
    let fx = xdim / ox;

    let mut out = Vec::with_capacity(oy * ox);
    for by in 0..oy {
        for bx in 0..ox {
            let mut sum = 0.0f32;
            for y in 0..fy {
                for x in 0..fx {
                    sum += frame[[by * fy + y, bx * fx + x]];
                }
            }
            out.push(sum / (fy * fx) as f32);
        }
    }
    out
}

fn pearson(a : &[f32], b : &[f32]) -> f32 {
    let n = a.len() as f32;
    let mean_a = a.iter().sum::<f32>() / n;
    let mean_b = b.iter().sum::<f32>() / n;
    let mut cov = 0.0f32;
    let mut var_a = 0.0f32;
    let mut var_b = 0.0f32;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    cov / (var_a.sqrt() * var_b.sqrt() + 1e-12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourier::CorrelationOptions;

    fn blob_frame(ydim : usize, xdim : usize, cy : f32, cx : f32) -> Array2<f32> {
        Array2::from_shape_fn((ydim, xdim), |(y, x)| {
            let dy = y as f32 - cy;
            let dx = x as f32 - cx;
            (-(dy * dy + dx * dx) / 18.0).exp()
        })
    }

    fn exact_engine(ydim : usize, xdim : usize) -> FftEngine {
        let opts = CorrelationOptions {
            apodize : false,
            smooth_sigma : None,
            eps : 1e-8,
        };
        FftEngine::new(Dimensions::new(xdim, ydim), &opts)
    }

    #[test]
    fn test_subset_indices_evenly() {
        let indices = subset_indices(100, 4, SubsetSelection::Evenly);
        assert_eq!(indices.len(), 4);
        assert!(indices.windows(2).all(|w| w[1] > w[0]));
        assert!(*indices.last().unwrap() < 100);
    }

    #[test]
    fn test_subset_indices_random_is_reproducible() {
        let a = subset_indices(100, 10, SubsetSelection::Random { seed : 3 });
        let b = subset_indices(100, 10, SubsetSelection::Random { seed : 3 });
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_subset_larger_than_stack_is_clamped() {
        let indices = subset_indices(5, 100, SubsetSelection::Evenly);
        assert_eq!(indices.len(), 5);
    }

    #[test]
    fn test_seed_excludes_uncorrelated_frame() {
        // four near-identical frames plus one uncorrelated one
        let mut stack = Array3::<f32>::zeros((5, 32, 32));
        for i in 0..4 {
            stack.index_axis_mut(Axis(0), i)
                .assign(&blob_frame(32, 32, 16.0, 16.0));
        }
        stack.index_axis_mut(Axis(0), 4)
            .assign(&Array2::from_shape_fn((32, 32), |(y, x)| {
                ((y * 7 + x * 13) % 5) as f32
            }));

        let subset : Vec<usize> = (0..5).collect();
        let seed = seed_reference(&stack.view(), &subset, 0.5);

        // the seed is an average of blob frames only
        let blob = blob_frame(32, 32, 16.0, 16.0);
        let err : f32 = seed.iter().zip(blob.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);
        assert!(err < 1e-5);
    }

    #[test]
    fn test_reference_converges_on_jittered_movie() {
        let truth = blob_frame(48, 48, 24.0, 24.0);
        let jitter = [(0i32, 0i32), (2, -1), (-1, 2), (1, 1), (-2, 0), (0, 2)];
        let mut stack = Array3::<f32>::zeros((jitter.len(), 48, 48));
        for (i, &(dy, dx)) in jitter.iter().enumerate() {
            stack.index_axis_mut(Axis(0), i)
                .assign(&shifted(truth.view(), dy, dx, EdgeFill::Wrap));
        }

        let engine = exact_engine(48, 48);
        let cfg = ReferenceConfig {
            subset_size : jitter.len(),
            max_iterations : 8,
            convergence_px : 0.5,
            seed_fraction : 0.4,
            selection : SubsetSelection::Evenly,
        };
        let rigid_cfg = RigidConfig::default();
        let cancel = CancelToken::new();

        let (reference, diag) = compute_reference(
            stack.view(), &engine, &cfg, &rigid_cfg, &cancel,
        ).unwrap();

        assert!(diag.converged, "mean shift {}", diag.final_mean_shift);
        assert!(!diag.cancelled);

        // every frame registers against the result with a small,
        // consistent shift
        let ctx = RigidContext::new(&engine, reference.view(), &rigid_cfg).unwrap();
        for i in 0..jitter.len() {
            let estimate = phasecorr(&engine, &ctx, stack.index_axis(Axis(0), i));
            let expected = ((-jitter[i].0) as f32, (-jitter[i].1) as f32);
            assert!((estimate.dy as f32 - expected.0).abs() <= 1.0);
            assert!((estimate.dx as f32 - expected.1).abs() <= 1.0);
        }
    }

    #[test]
    fn test_cancelled_build_returns_seed() {
        let truth = blob_frame(32, 32, 16.0, 16.0);
        let mut stack = Array3::<f32>::zeros((4, 32, 32));
        for i in 0..4 {
            stack.index_axis_mut(Axis(0), i).assign(&truth);
        }

        let engine = exact_engine(32, 32);
        let cfg = ReferenceConfig::default();
        let rigid_cfg = RigidConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let (reference, diag) = compute_reference(
            stack.view(), &engine, &cfg, &rigid_cfg, &cancel,
        ).unwrap();
        assert!(diag.cancelled);
        assert_eq!(diag.iterations, 0);
        assert_eq!(reference.dim(), (32, 32));
    }

    #[test]
    fn test_empty_stack_is_an_error() {
        let stack = Array3::<f32>::zeros((0, 32, 32));
        let engine = exact_engine(32, 32);
        let cancel = CancelToken::new();
        assert!(compute_reference(
            stack.view(), &engine,
            &ReferenceConfig::default(), &RigidConfig::default(), &cancel,
        ).is_err());
    }
}
