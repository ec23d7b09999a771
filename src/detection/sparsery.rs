//! Sparse iterative ROI extraction.
//!
//! Candidates are pulled from the correlation map one at a
//! time: seed at the map's peak, grow a connected region around
//! it, project the region's weighted trace, and peel that
//! component out of the movie so the next peak belongs to a
//! different cell. Each candidate is scored on size, shape, and
//! trace statistics before it joins the accepted set, and the
//! final set has its overlaps resolved.

use std::collections::{HashSet, VecDeque};

use ndarray::prelude::*;

use crate::config::DetectionConfig;
use crate::data::roi::{RoiMask, RoiSet};
use crate::diagnostics::CancelToken;
use crate::CorrosuiteError;

use super::correlation_map::DetectionMovie;
use super::merge;

/// Smallest map value worth seeding from. A noiseless
/// background gives a zero noise floor; without this floor the
/// loop would chase numerical residue left by peeling.
const SEED_FLOOR : f32 = 0.05;

/// Per-ROI quality scores recorded at acceptance time.
#[derive(Debug, Clone, Copy)]
pub struct RoiQuality {
    pub id : u32,
    pub npix : usize,
    /// Mean pixel distance from the centroid relative to a disc
    /// of the same area; 1 is disc-like, larger is straggly
    pub compactness : f32,
    /// Skewness of the component's temporal trace
    pub skew : f32,
    /// Correlation map value at the seed pixel
    pub peak : f32,
}

/// Everything detection produces: the surviving ROIs, their
/// quality scores, the initial correlation map, and counters
/// describing how the candidate stream was filtered.
pub struct DetectionOutcome {
    pub rois : RoiSet,
    pub quality : Vec<RoiQuality>,
    pub correlation_map : Array2<f32>,
    pub candidates_extracted : usize,
    pub candidates_accepted : usize,
    pub rejected_size : usize,
    pub rejected_compactness : usize,
    pub rejected_skew : usize,
    pub merged_pairs : usize,
    pub dropped_overlap : usize,
    pub cancelled : bool,
}

/// One peeled component awaiting scoring.
struct Candidate {
    pixels : Vec<(usize, usize)>,
    weights : Vec<f32>,
    trace : Vec<f32>,
    peak : f32,
}

/// The extraction loop's explicit state. One candidate flows
/// through `ExtractCandidate -> AcceptOrReject` per round;
/// the loop drains into `MergeOverlaps` exactly once.
enum DetectState {
    ExtractCandidate,
    AcceptOrReject(Candidate),
    MergeOverlaps,
    Done,
}

/// Runs detection over a registered movie.
///
/// Cancellation stops candidate extraction between rounds; the
/// candidates accepted so far still go through overlap
/// resolution so the partial result is internally consistent.
pub fn detect_rois(
    stack : ArrayView3<f32>,
    cfg : &DetectionConfig,
    cancel : &CancelToken,
) -> Result<DetectionOutcome, CorrosuiteError> {
    let mut movie = DetectionMovie::new(stack, cfg)?;
    let correlation_map = movie.map.clone();
    let threshold = (cfg.threshold_scale * movie.noise_floor).max(SEED_FLOOR);

    let mut rois : Vec<RoiMask> = Vec::new();
    let mut quality : Vec<RoiQuality> = Vec::new();
    let mut outcome_counts = (0usize, 0usize, 0usize, 0usize); // size, compactness, skew, extracted
    let mut cancelled = false;
    let mut merge_outcome = merge::MergeOutcome::default();

    let mut state = if movie.is_flat() {
        DetectState::MergeOverlaps
    } else {
        DetectState::ExtractCandidate
    };

    loop {
        state = match state {
            DetectState::ExtractCandidate => {
                if cancel.is_cancelled() {
                    cancelled = true;
                    DetectState::MergeOverlaps
                } else if outcome_counts.3 >= cfg.max_components {
                    DetectState::MergeOverlaps
                } else {
                    match extract_candidate(&mut movie, cfg, threshold) {
                        Some(candidate) => {
                            outcome_counts.3 += 1;
                            DetectState::AcceptOrReject(candidate)
                        },
                        None => DetectState::MergeOverlaps,
                    }
                }
            },

            DetectState::AcceptOrReject(candidate) => {
                let npix = candidate.pixels.len();
                if npix < cfg.min_npix || npix > cfg.max_npix {
                    outcome_counts.0 += 1;
                } else {
                    let compactness = compactness_score(
                        &candidate.pixels, &candidate.weights);
                    let skew = skewness(&candidate.trace);
                    if compactness > cfg.max_compactness {
                        outcome_counts.1 += 1;
                    } else if cfg.min_skew > 0.0 && skew < cfg.min_skew {
                        outcome_counts.2 += 1;
                    } else {
                        let id = rois.len() as u32;
                        rois.push(RoiMask {
                            id,
                            pixels : candidate.pixels,
                            weights : candidate.weights,
                        });
                        quality.push(RoiQuality {
                            id,
                            npix,
                            compactness,
                            skew,
                            peak : candidate.peak,
                        });
                    }
                }
                DetectState::ExtractCandidate
            },

            DetectState::MergeOverlaps => {
                merge_outcome = merge::resolve_overlaps(&mut rois, cfg.max_overlap);
                let surviving : HashSet<u32> = rois.iter().map(|r| r.id).collect();
                quality.retain(|q| surviving.contains(&q.id));
                // merged ROIs grew; refresh their recorded size
                for q in quality.iter_mut() {
                    if let Some(roi) = rois.iter().find(|r| r.id == q.id) {
                        q.npix = roi.npix();
                    }
                }
                DetectState::Done
            },

            DetectState::Done => break,
        };
    }

    let candidates_accepted = rois.len() + merge_outcome.merged_pairs
        + merge_outcome.dropped_overlap;

    Ok(DetectionOutcome {
        rois : RoiSet { rois },
        quality,
        correlation_map,
        candidates_extracted : outcome_counts.3,
        candidates_accepted,
        rejected_size : outcome_counts.0,
        rejected_compactness : outcome_counts.1,
        rejected_skew : outcome_counts.2,
        merged_pairs : merge_outcome.merged_pairs,
        dropped_overlap : merge_outcome.dropped_overlap,
        cancelled,
    })
}

/// Seeds at the map peak, grows the region, projects and peels
/// the component. Returns `None` once the peak falls to the
/// stopping threshold.
fn extract_candidate(
    movie : &mut DetectionMovie,
    cfg : &DetectionConfig,
    threshold : f32,
) -> Option<Candidate> {
    let (seed, seed_val) = map_argmax(&movie.map);
    if seed_val <= threshold {
        return None;
    }

    let pixels = grow_region(&movie.map, seed, seed_val, cfg);

    // unit-L2 weights proportional to the map over the region
    let mut weights : Vec<f32> = pixels.iter()
        .map(|&(y, x)| movie.map[[y, x]].max(0.0))
        .collect();
    let norm = weights.iter().map(|w| w * w).sum::<f32>().sqrt();
    if norm > 0.0 {
        weights.iter_mut().for_each(|w| *w /= norm);
    }

    let trace = movie.project(&pixels, &weights);
    movie.peel(&pixels, &weights, &trace);

    Some(Candidate { pixels, weights, trace, peak : seed_val })
}

fn map_argmax(map : &Array2<f32>) -> ((usize, usize), f32) {
    let mut peak = (0, 0);
    let mut peak_val = f32::NEG_INFINITY;
    for ((y, x), &v) in map.indexed_iter() {
        if v > peak_val {
            peak_val = v;
            peak = (y, x);
        }
    }
    (peak, peak_val)
}

/// 4-connected flood from the seed: a neighbor joins while its
/// map value stays above `extend_frac` of the seed value and it
/// sits within `max_radius` (Chebyshev) of the seed. Pixels are
/// returned sorted.
fn grow_region(
    map : &Array2<f32>,
    seed : (usize, usize),
    seed_val : f32,
    cfg : &DetectionConfig,
) -> Vec<(usize, usize)> {
    let (ydim, xdim) = map.dim();
    let floor = cfg.extend_frac * seed_val;
    let radius = cfg.max_radius as i64;

    let mut region = vec![seed];
    let mut visited : HashSet<(usize, usize)> = HashSet::from([seed]);
    let mut frontier = VecDeque::from([seed]);

    while let Some((y, x)) = frontier.pop_front() {
        for (oy, ox) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
            let ny = y as i64 + oy;
            let nx = x as i64 + ox;
            if ny < 0 || nx < 0 || ny as usize >= ydim || nx as usize >= xdim {
                continue;
            }
            let chebyshev = (ny - seed.0 as i64).abs().max((nx - seed.1 as i64).abs());
            if chebyshev > radius {
                continue;
            }
            let next = (ny as usize, nx as usize);
            if visited.contains(&next) || map[[next.0, next.1]] <= floor {
                continue;
            }
            visited.insert(next);
            region.push(next);
            frontier.push_back(next);
        }
    }

    region.sort_unstable();
    region
}

/// Mean weighted distance from the centroid, relative to the
/// mean radius of a disc with the same pixel count.
fn compactness_score(pixels : &[(usize, usize)], weights : &[f32]) -> f32 {
    let total : f32 = weights.iter().sum();
    if total <= 0.0 || pixels.is_empty() {
        return f32::INFINITY;
    }
    let cy : f32 = pixels.iter().zip(weights.iter())
        .map(|(&(y, _), &w)| y as f32 * w)
        .sum::<f32>() / total;
    let cx : f32 = pixels.iter().zip(weights.iter())
        .map(|(&(_, x), &w)| x as f32 * w)
        .sum::<f32>() / total;

    let mean_dist : f32 = pixels.iter().zip(weights.iter())
        .map(|(&(y, x), &w)| {
            w * ((y as f32 - cy).powi(2) + (x as f32 - cx).powi(2)).sqrt()
        })
        .sum::<f32>() / total;

    // disc of area npix has mean radius (2/3) sqrt(npix / pi)
    let disc_mean_radius =
        (2.0 / 3.0) * (pixels.len() as f32 / std::f32::consts::PI).sqrt();
    mean_dist / disc_mean_radius.max(1e-6)
}

/// Third standardized moment of a trace.
fn skewness(trace : &[f32]) -> f32 {
    let n = trace.len() as f32;
    if n < 2.0 {
        return 0.0;
    }
    let mean = trace.iter().sum::<f32>() / n;
    let var = trace.iter().map(|&v| (v - mean).powi(2)).sum::<f32>() / n;
    let sd = var.sqrt();
    if sd < 1e-9 {
        return 0.0;
    }
    let m3 = trace.iter().map(|&v| (v - mean).powi(3)).sum::<f32>() / n;
    m3 / (sd * sd * sd)
}
