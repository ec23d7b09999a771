//! Spatial footprints of detected cells.
//!
//! A `RoiMask` is a weighted set of pixel coordinates -- the
//! pixel list plus per-pixel weights of one putative cell. The
//! `RoiSet` is the frozen output of the detection pass and the
//! input to trace extraction.

use std::collections::HashSet;

use ndarray::prelude::*;

use crate::data::dimensions::Dimensions;

/// A single spatial footprint: pixel coordinates with
/// per-pixel weights. Pixel order is arbitrary but `pixels`
/// and `weights` are index-aligned.
#[derive(Debug, Clone)]
pub struct RoiMask {
    pub id : u32,
    /// (y, x) coordinates, each inside the frame extent
    pub pixels : Vec<(usize, usize)>,
    /// Non-negative weight per pixel, same length as `pixels`
    pub weights : Vec<f32>,
}

impl RoiMask {
    pub fn npix(&self) -> usize {
        self.pixels.len()
    }

    /// Summed weight of the footprint -- used as the
    /// deterministic tie-break in overlap resolution.
    pub fn total_weight(&self) -> f32 {
        self.weights.iter().sum()
    }

    /// Weighted centroid, (y, x).
    pub fn centroid(&self) -> (f32, f32) {
        let total = self.total_weight().max(f32::EPSILON);
        let mut cy = 0.0;
        let mut cx = 0.0;
        for (&(y, x), &w) in self.pixels.iter().zip(self.weights.iter()) {
            cy += y as f32 * w;
            cx += x as f32 * w;
        }
        (cy / total, cx / total)
    }

    /// Number of pixels shared with `other`.
    pub fn overlap_count(&self, other : &RoiMask) -> usize {
        let own : HashSet<(usize, usize)> = self.pixels.iter().copied().collect();
        other.pixels.iter().filter(|p| own.contains(p)).count()
    }

    /// Overlap fraction relative to the smaller footprint,
    /// `|A n B| / min(|A|, |B|)`.
    pub fn overlap_fraction(&self, other : &RoiMask) -> f32 {
        let smaller = self.npix().min(other.npix());
        if smaller == 0 { return 0.0; }
        self.overlap_count(other) as f32 / smaller as f32
    }

    /// Renders the footprint into a dense bool mask.
    pub fn to_bool_mask(&self, dims : &Dimensions) -> Array2<bool> {
        let mut mask = Array2::<bool>::from_elem(dims.to_tuple(), false);
        for &(y, x) in self.pixels.iter() {
            mask[[y, x]] = true;
        }
        mask
    }

    /// Rescales weights in place so they sum to 1.
    pub fn normalize_weights(&mut self) {
        let total = self.total_weight();
        if total > 0.0 {
            self.weights.iter_mut().for_each(|w| *w /= total);
        }
    }
}

/// The final accepted footprints, frozen after detection.
/// Ids are unique and ascending.
#[derive(Debug, Clone, Default)]
pub struct RoiSet {
    pub rois : Vec<RoiMask>,
}

impl RoiSet {
    pub fn new(rois : Vec<RoiMask>) -> Self {
        RoiSet { rois }
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<RoiMask> {
        self.rois.iter()
    }

    /// Dense map of which pixels belong to ANY accepted ROI.
    /// The neuropil computation excludes everything marked here.
    pub fn occupancy_mask(&self, dims : &Dimensions) -> Array2<bool> {
        let mut mask = Array2::<bool>::from_elem(dims.to_tuple(), false);
        for roi in self.rois.iter() {
            for &(y, x) in roi.pixels.iter() {
                mask[[y, x]] = true;
            }
        }
        mask
    }
}
