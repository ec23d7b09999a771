//! Per-ROI fluorescence traces, ROI-major and frame-minor.

use ndarray::prelude::*;

/// Fluorescence and paired neuropil traces for every accepted
/// ROI. Row `i` of each array is the trace of `rois.rois[i]`
/// in the `RoiSet` the traces were extracted from.
#[derive(Debug, Clone)]
pub struct TraceMatrices {
    /// Weighted fluorescence, `(n_rois, n_frames)`
    pub f : Array2<f32>,
    /// Surrounding-neuropil fluorescence, `(n_rois, n_frames)`
    pub f_neu : Array2<f32>,
    /// Ids of ROIs whose neuropil annulus clipped to zero valid pixels
    pub empty_neuropil : Vec<u32>,
}

impl TraceMatrices {
    pub fn n_rois(&self) -> usize {
        self.f.shape()[0]
    }

    pub fn n_frames(&self) -> usize {
        self.f.shape()[1]
    }

    /// Neuropil-corrected fluorescence, `F - neucoeff * Fneu`.
    /// Not applied implicitly anywhere -- callers opt in.
    pub fn corrected(&self, neucoeff : f32) -> Array2<f32> {
        &self.f - &(neucoeff * &self.f_neu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrected_trace() {
        let traces = TraceMatrices {
            f : Array2::from_elem((2, 3), 10.0),
            f_neu : Array2::from_elem((2, 3), 4.0),
            empty_neuropil : vec![],
        };
        let corrected = traces.corrected(0.7);
        assert_eq!(traces.n_rois(), 2);
        assert_eq!(traces.n_frames(), 3);
        corrected.iter().for_each(|&v| assert!((v - 7.2).abs() < 1e-6));
    }
}
