//! Fluorescence trace extraction.
//!
//! For every ROI: a weighted-mean fluorescence trace over its
//! pixels, and a plain-mean neuropil trace over a surrounding
//! annulus that excludes every detected ROI's pixels, not just
//! its own. ROIs are independent, so extraction runs in
//! parallel across them.

use std::collections::HashSet;

use ndarray::prelude::*;
use rayon::prelude::*;

use crate::config::ExtractionConfig;
use crate::data::dimensions::Dimensions;
use crate::data::roi::{RoiMask, RoiSet};
use crate::data::trace::TraceMatrices;
use crate::CorrosuiteError;

/// Extracts ROI and neuropil traces from a registered movie.
///
/// An ROI whose annulus has no free pixels (crowded field or
/// frame edge) gets an all-zero neuropil trace and its ID
/// recorded in `empty_neuropil`.
pub fn extract_traces(
    stack : ArrayView3<f32>,
    rois : &RoiSet,
    cfg : &ExtractionConfig,
) -> Result<TraceMatrices, CorrosuiteError> {
    let n_frames = stack.shape()[0];
    let n_rois = rois.rois.len();
    let dims = Dimensions::from_shape(stack.shape());

    for roi in rois.rois.iter() {
        for &(y, x) in roi.pixels.iter() {
            if !dims.contains(y as i64, x as i64) {
                return Err(CorrosuiteError::Configuration(format!(
                    "ROI {} has pixel ({}, {}) outside frame ({}, {})",
                    roi.id, y, x, dims.ydim, dims.xdim)));
            }
        }
    }

    let occupancy = rois.occupancy_mask(&dims);

    let rows : Vec<(Vec<f32>, Vec<f32>, bool)> = rois.rois.par_iter()
        .map(|roi| {
            let annulus = neuropil_annulus(roi, &occupancy, &dims, cfg);

            let weight_sum : f32 = roi.weights.iter().sum();
            let f : Vec<f32> = (0..n_frames)
                .map(|t| {
                    let weighted : f32 = roi.pixels.iter()
                        .zip(roi.weights.iter())
                        .map(|(&(y, x), &w)| w * stack[[t, y, x]])
                        .sum();
                    weighted / weight_sum.max(1e-12)
                })
                .collect();

            let f_neu : Vec<f32> = if annulus.is_empty() {
                vec![0.0; n_frames]
            } else {
                (0..n_frames)
                    .map(|t| {
                        annulus.iter()
                            .map(|&(y, x)| stack[[t, y, x]])
                            .sum::<f32>() / annulus.len() as f32
                    })
                    .collect()
            };

            (f, f_neu, annulus.is_empty())
        })
        .collect();

    let mut f = Array2::<f32>::zeros((n_rois, n_frames));
    let mut f_neu = Array2::<f32>::zeros((n_rois, n_frames));
    let mut empty_neuropil = Vec::new();
    for (i, (roi, (f_row, neu_row, empty))) in
        rois.rois.iter().zip(rows.into_iter()).enumerate()
    {
        f.row_mut(i).assign(&Array1::from_vec(f_row));
        f_neu.row_mut(i).assign(&Array1::from_vec(neu_row));
        if empty {
            empty_neuropil.push(roi.id);
        }
    }

    Ok(TraceMatrices { f, f_neu, empty_neuropil })
}

/// Pixels between `inner_radius` and `outer_radius` rings of
/// 8-connected dilation outward from the ROI, excluding pixels
/// claimed by ANY ROI.
fn neuropil_annulus(
    roi : &RoiMask,
    occupancy : &Array2<bool>,
    dims : &Dimensions,
    cfg : &ExtractionConfig,
) -> Vec<(usize, usize)> {
    let mut visited : HashSet<(usize, usize)> = roi.pixels.iter().copied().collect();
    let mut frontier : Vec<(usize, usize)> = roi.pixels.to_vec();
    let mut annulus = Vec::new();

    for ring in 1..=cfg.outer_radius {
        let mut next = Vec::new();
        for &(y, x) in frontier.iter() {
            for oy in -1i64..=1 {
                for ox in -1i64..=1 {
                    if oy == 0 && ox == 0 {
                        continue;
                    }
                    let ny = y as i64 + oy;
                    let nx = x as i64 + ox;
                    if ny < 0 || nx < 0 {
                        continue;
                    }
                    if !dims.contains(ny, nx) {
                        continue;
                    }
                    let pixel = (ny as usize, nx as usize);
                    if visited.contains(&pixel) {
                        continue;
                    }
                    visited.insert(pixel);
                    next.push(pixel);
                    if ring > cfg.inner_radius && !occupancy[[pixel.0, pixel.1]] {
                        annulus.push(pixel);
                    }
                }
            }
        }
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }

    annulus.sort_unstable();
    annulus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_roi(id : u32, y0 : usize, x0 : usize, side : usize) -> RoiMask {
        let pixels : Vec<(usize, usize)> = (y0..y0 + side)
            .flat_map(|y| (x0..x0 + side).map(move |x| (y, x)))
            .collect();
        let weights = vec![1.0; pixels.len()];
        RoiMask { id, pixels, weights }
    }

    #[test]
    fn test_roi_and_neuropil_means() {
        // cell at 10, background at 2
        let roi = square_roi(0, 10, 10, 3);
        let mut stack = Array3::<f32>::from_elem((5, 32, 32), 2.0);
        for t in 0..5 {
            for &(y, x) in roi.pixels.iter() {
                stack[[t, y, x]] = 10.0;
            }
        }
        let set = RoiSet { rois : vec![roi] };

        let traces = extract_traces(
            stack.view(), &set, &ExtractionConfig::default()).unwrap();
        assert_eq!(traces.n_rois(), 1);
        assert_eq!(traces.n_frames(), 5);
        assert!((traces.f[[0, 0]] - 10.0).abs() < 1e-5);
        assert!((traces.f_neu[[0, 0]] - 2.0).abs() < 1e-5);
        assert!(traces.empty_neuropil.is_empty());
    }

    #[test]
    fn test_annulus_excludes_other_rois() {
        // a bright neighbor sits inside the first ROI's annulus;
        // its pixels must not leak into the neuropil estimate
        let roi = square_roi(0, 10, 10, 3);
        let neighbor = square_roi(1, 10, 16, 3);
        let mut stack = Array3::<f32>::from_elem((3, 32, 32), 1.0);
        for t in 0..3 {
            for &(y, x) in neighbor.pixels.iter() {
                stack[[t, y, x]] = 100.0;
            }
        }
        let set = RoiSet { rois : vec![roi, neighbor] };

        let traces = extract_traces(
            stack.view(), &set, &ExtractionConfig::default()).unwrap();
        assert!((traces.f_neu[[0, 0]] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_inner_radius_gap_respected() {
        let roi = square_roi(0, 12, 12, 3);
        let cfg = ExtractionConfig { inner_radius : 2, outer_radius : 4, neucoeff : 0.7 };
        let dims = Dimensions::new(32, 32);
        let set = RoiSet { rois : vec![roi.clone()] };
        let occupancy = set.occupancy_mask(&dims);

        let annulus = neuropil_annulus(&roi, &occupancy, &dims, &cfg);
        assert!(!annulus.is_empty());
        for &(y, x) in annulus.iter() {
            // no annulus pixel touches the ROI or its first ring
            let too_close = roi.pixels.iter().any(|&(ry, rx)| {
                let d = (y as i64 - ry as i64).abs().max((x as i64 - rx as i64).abs());
                d <= 2
            });
            assert!(!too_close, "pixel ({}, {}) too close", y, x);
            assert!(!occupancy[[y, x]]);
        }
    }

    #[test]
    fn test_full_frame_roi_has_empty_neuropil() {
        let pixels : Vec<(usize, usize)> = (0..8)
            .flat_map(|y| (0..8).map(move |x| (y, x)))
            .collect();
        let weights = vec![1.0; pixels.len()];
        let set = RoiSet { rois : vec![RoiMask { id : 0, pixels, weights }] };
        let stack = Array3::<f32>::from_elem((2, 8, 8), 1.0);

        let traces = extract_traces(
            stack.view(), &set, &ExtractionConfig::default()).unwrap();
        assert_eq!(traces.empty_neuropil, vec![0]);
        assert!(traces.f_neu.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_out_of_bounds_roi_rejected() {
        let set = RoiSet {
            rois : vec![RoiMask {
                id : 0,
                pixels : vec![(40, 2)],
                weights : vec![1.0],
            }],
        };
        let stack = Array3::<f32>::zeros((2, 16, 16));
        assert!(extract_traces(
            stack.view(), &set, &ExtractionConfig::default()).is_err());
    }

    #[test]
    fn test_corrected_traces_subtract_neuropil() {
        let roi = square_roi(0, 10, 10, 3);
        let mut stack = Array3::<f32>::from_elem((2, 32, 32), 2.0);
        for t in 0..2 {
            for &(y, x) in roi.pixels.iter() {
                stack[[t, y, x]] = 10.0;
            }
        }
        let set = RoiSet { rois : vec![roi] };
        let traces = extract_traces(
            stack.view(), &set, &ExtractionConfig::default()).unwrap();

        let corrected = traces.corrected(0.7);
        assert!((corrected[[0, 0]] - (10.0 - 0.7 * 2.0)).abs() < 1e-5);
    }
}
