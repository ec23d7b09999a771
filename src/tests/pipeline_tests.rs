//! End-to-end pipeline tests on synthetic movies with planted
//! cells and known motion.

use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use corrosuite::config::{DetectionConfig, PipelineConfig, ReferenceConfig, SubsetSelection};
use corrosuite::registration::{shifted, EdgeFill};
use corrosuite::{run_pipeline, CancelToken};

const YDIM : usize = 64;
const XDIM : usize = 64;

/// Static textured background so phase correlation has
/// structure to lock onto.
fn background(seed : u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut image = Array2::<f32>::zeros((YDIM, XDIM));
    for _ in 0..40 {
        let cy = rng.gen_range(0.0..YDIM as f32);
        let cx = rng.gen_range(0.0..XDIM as f32);
        let amp = rng.gen_range(1.0..3.0);
        for y in 0..YDIM {
            for x in 0..XDIM {
                let d2 = (y as f32 - cy).powi(2) + (x as f32 - cx).powi(2);
                image[[y, x]] += amp * (-d2 / 8.0).exp();
            }
        }
    }
    image
}

/// Adds a Gaussian-blob cell with the given brightness to one
/// frame.
fn add_cell(frame : &mut Array2<f32>, cy : usize, cx : usize, brightness : f32) {
    for y in cy.saturating_sub(4)..(cy + 5).min(YDIM) {
        for x in cx.saturating_sub(4)..(cx + 5).min(XDIM) {
            let d2 = (y as f32 - cy as f32).powi(2) + (x as f32 - cx as f32).powi(2);
            frame[[y, x]] += brightness * (-d2 / 4.5).exp();
        }
    }
}

/// Movie with blinking cells over a static background, each
/// frame displaced by a known integer jitter.
fn synthetic_movie(
    n_frames : usize,
    cells : &[(usize, usize)],
    jitter : &[(i32, i32)],
) -> Array3<f32> {
    let base = background(11);
    let mut stack = Array3::<f32>::zeros((n_frames, YDIM, XDIM));
    for t in 0..n_frames {
        let mut frame = base.clone();
        for (c, &(cy, cx)) in cells.iter().enumerate() {
            let period = 3 + c;
            let brightness = if t % period == 0 { 8.0 } else { 0.5 };
            add_cell(&mut frame, cy, cx, brightness);
        }
        let (dy, dx) = jitter[t % jitter.len()];
        stack.index_axis_mut(Axis(0), t)
            .assign(&shifted(frame.view(), dy, dx, EdgeFill::Wrap));
    }
    stack
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        batch_size : 8,
        nonrigid : None,
        reference : ReferenceConfig {
            subset_size : 12,
            selection : SubsetSelection::Evenly,
            ..ReferenceConfig::default()
        },
        detection : DetectionConfig {
            min_npix : 4,
            max_compactness : 3.0,
            ..DetectionConfig::default()
        },
        ..PipelineConfig::default()
    }
}

#[test]
fn test_full_run_finds_planted_cells() {
    let cells = [(14usize, 14usize), (14, 48), (48, 30)];
    let jitter = [(0, 0), (2, -1), (-2, 1), (1, 2), (-1, -2), (0, 1)];
    let mut stack = synthetic_movie(60, &cells, &jitter);

    let output = run_pipeline(&mut stack, &test_config(), None).unwrap();

    assert_eq!(output.summary.n_frames, 60);
    assert!(!output.summary.cancelled);
    assert_eq!(output.summary.n_unprocessed, 0);

    // jitter undone frame by frame
    for diag in output.frames.iter() {
        let (dy, dx) = jitter[diag.frame % jitter.len()];
        if !diag.used_fallback {
            assert!(
                (diag.applied_dy + dy).abs() <= 1 && (diag.applied_dx + dx).abs() <= 1,
                "frame {}: applied ({}, {}) against jitter ({}, {})",
                diag.frame, diag.applied_dy, diag.applied_dx, dy, dx,
            );
        }
    }

    // every planted cell recovered, centered on it, and nothing
    // else: flat background components fail the skew gate
    assert_eq!(output.rois.len(), cells.len(), "found {} ROIs", output.rois.len());
    for &(cy, cx) in cells.iter() {
        let hit = output.rois.iter().any(|roi| {
            let (ry, rx) = roi.centroid();
            (ry - cy as f32).abs() < 2.5 && (rx - cx as f32).abs() < 2.5
        });
        assert!(hit, "no ROI near ({}, {})", cy, cx);
    }

    // traces line up with the ROI set and show real signal
    assert_eq!(output.traces.n_rois(), output.rois.len());
    assert_eq!(output.traces.n_frames(), 60);
    assert_eq!(output.quality.len(), output.rois.len());
    for i in 0..output.traces.n_rois() {
        let f_range = output.traces.f.row(i).iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        assert!(f_range.1 - f_range.0 > 1.0, "ROI {} trace is flat", i);
    }
}

#[test]
fn test_uniform_movie_yields_no_rois() {
    let mut stack = Array3::<f32>::from_elem((40, YDIM, XDIM), 3.0);
    let output = run_pipeline(&mut stack, &test_config(), None).unwrap();

    assert!(output.rois.is_empty());
    assert_eq!(output.traces.n_rois(), 0);
    assert!(output.summary.degenerate_input);
}

#[test]
fn test_empty_stack_is_degenerate_not_an_error() {
    let mut stack = Array3::<f32>::zeros((0, YDIM, XDIM));
    let output = run_pipeline(&mut stack, &test_config(), None).unwrap();
    assert!(output.summary.degenerate_input);
    assert!(output.frames.is_empty());
    assert!(output.rois.is_empty());
}

#[test]
fn test_no_surviving_pair_overlaps_too_much() {
    // two cells close enough that their grown regions can touch
    let cells = [(30usize, 28usize), (30, 36)];
    let jitter = [(0, 0)];
    let mut stack = synthetic_movie(60, &cells, &jitter);

    let config = test_config();
    let output = run_pipeline(&mut stack, &config, None).unwrap();

    let rois = &output.rois.rois;
    for i in 0..rois.len() {
        for j in (i + 1)..rois.len() {
            assert!(
                rois[i].overlap_fraction(&rois[j]) <= config.detection.max_overlap,
                "ROIs {} and {} overlap {}",
                rois[i].id, rois[j].id, rois[i].overlap_fraction(&rois[j]),
            );
        }
    }
}

#[test]
fn test_empty_neuropil_ids_refer_to_rois() {
    let cells = [(14usize, 14usize), (48, 48)];
    let jitter = [(0, 0), (1, -1)];
    let mut stack = synthetic_movie(48, &cells, &jitter);

    let output = run_pipeline(&mut stack, &test_config(), None).unwrap();
    for &id in output.traces.empty_neuropil.iter() {
        assert!(output.rois.iter().any(|roi| roi.id == id));
    }
}

#[test]
fn test_cancelled_run_returns_consistent_partial_output() {
    let cells = [(20usize, 20usize)];
    let jitter = [(0, 0), (2, -2)];
    let mut stack = synthetic_movie(48, &cells, &jitter);
    let untouched = stack.clone();

    let cancel = CancelToken::new();
    cancel.cancel();
    let output = run_pipeline(&mut stack, &test_config(), Some(&cancel)).unwrap();

    assert!(output.summary.cancelled);
    assert_eq!(output.summary.n_unprocessed, 48);
    assert!(output.rois.is_empty());
    // no frame was rewritten
    assert_eq!(stack, untouched);
}

#[test]
fn test_invalid_config_is_rejected_before_processing() {
    let mut stack = Array3::<f32>::from_elem((10, YDIM, XDIM), 1.0);

    let mut config = test_config();
    config.extraction.inner_radius = 9;
    config.extraction.outer_radius = 3;
    assert!(run_pipeline(&mut stack, &config, None).is_err());

    // default nonrigid blocks are larger than this frame
    let mut config = test_config();
    config.nonrigid = Some(Default::default());
    assert!(run_pipeline(&mut stack, &config, None).is_err());
}

#[test]
fn test_nonrigid_pass_runs_on_large_enough_frames() {
    // frame fits two 48 px blocks per axis
    let base = background(23);
    let mut big = Array2::<f32>::zeros((96, 96));
    big.slice_mut(s![..64, ..64]).assign(&base);
    big.slice_mut(s![32.., 32..]).assign(&base);

    let mut stack = Array3::<f32>::zeros((24, 96, 96));
    for t in 0..24 {
        let dy = if t % 2 == 0 { 1 } else { -1 };
        stack.index_axis_mut(Axis(0), t)
            .assign(&shifted(big.view(), dy, 0, EdgeFill::Wrap));
    }

    let mut config = test_config();
    config.nonrigid = Some(corrosuite::config::NonrigidConfig {
        block_size : 48,
        ..Default::default()
    });

    let output = run_pipeline(&mut stack, &config, None).unwrap();
    assert_eq!(output.summary.n_unprocessed, 0);
    for diag in output.frames.iter() {
        assert!(diag.processed);
    }
}
