//! Pipeline configuration.
//!
//! Every stage reads its parameters from one `PipelineConfig`,
//! which is plain serde-serializable data so runs can be driven
//! from files and reproduced exactly. Defaults are tuned for
//! two-photon calcium movies in the few-hundred-pixel range.

use serde::{Deserialize, Serialize};

use crate::data::dimensions::Dimensions;
use crate::fourier::CorrelationOptions;
use crate::registration::{EdgeFill, FallbackShift};
use crate::CorrosuiteError;

/// How the reference-building subset of frames is drawn from
/// the recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SubsetSelection {
    /// Evenly spaced across the whole recording
    Evenly,
    /// Seeded random draw, reproducible across runs
    Random { seed : u64 },
}

/// Rigid (whole-frame) registration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigidConfig {
    /// Largest allowed shift as a fraction of the smaller frame
    /// side
    pub max_shift_frac : f32,
    /// Peak-to-noise ratio below which an estimate is flagged
    /// low-confidence
    pub min_peak_ratio : f32,
    pub fallback : FallbackShift,
    pub edge_fill : EdgeFill,
}

impl Default for RigidConfig {
    fn default() -> Self {
        RigidConfig {
            max_shift_frac : 0.1,
            min_peak_ratio : 1.5,
            fallback : FallbackShift::Previous,
            edge_fill : EdgeFill::Replicate,
        }
    }
}

/// Reference image construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Number of frames drawn for reference building
    pub subset_size : usize,
    pub max_iterations : usize,
    /// Mean change in the subset's shifts between consecutive
    /// iterations (pixels) below which the build stops
    pub convergence_px : f32,
    /// Fraction of the subset averaged into the initial seed
    pub seed_fraction : f32,
    pub selection : SubsetSelection,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            subset_size : 200,
            max_iterations : 8,
            convergence_px : 0.25,
            seed_fraction : 0.2,
            selection : SubsetSelection::Evenly,
        }
    }
}

/// Non-rigid (block-wise) registration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonrigidConfig {
    /// Side length of the square correlation blocks, pixels
    pub block_size : usize,
    /// Fractional overlap between adjacent blocks
    pub overlap_frac : f32,
    /// Largest per-block shift searched, pixels
    pub max_shift_block : usize,
    pub min_peak_ratio_block : f32,
}

impl Default for NonrigidConfig {
    fn default() -> Self {
        NonrigidConfig {
            block_size : 128,
            overlap_frac : 0.5,
            max_shift_block : 5,
            min_peak_ratio_block : 1.2,
        }
    }
}

/// ROI detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Temporal binning factor applied to the movie before the
    /// correlation map is built
    pub bin_factor : usize,
    /// Stopping threshold as a multiple of the correlation
    /// map's median noise floor
    pub threshold_scale : f32,
    /// Hard cap on extracted candidates
    pub max_components : usize,
    /// A candidate grows while map values exceed this fraction
    /// of its seed value
    pub extend_frac : f32,
    /// Chebyshev radius beyond which a candidate stops growing
    pub max_radius : usize,
    pub min_npix : usize,
    pub max_npix : usize,
    /// Upper bound on the mean-radius compactness score
    pub max_compactness : f32,
    /// Lower bound on trace skewness; zero disables the check
    pub min_skew : f32,
    /// Pairs overlapping more than this (relative to the
    /// smaller ROI) are merged or the weaker one is dropped
    pub max_overlap : f32,
    /// 3x3 spatial smoothing of the normalized movie before the
    /// map is computed
    pub smooth_spatial : bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            bin_factor : 1,
            threshold_scale : 2.5,
            max_components : 500,
            extend_frac : 0.2,
            max_radius : 12,
            min_npix : 6,
            max_npix : 400,
            max_compactness : 1.5,
            min_skew : 0.5,
            max_overlap : 0.6,
            smooth_spatial : true,
        }
    }
}

/// Fluorescence extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Inner radius of the neuropil annulus, pixels outward
    /// from the ROI boundary
    pub inner_radius : usize,
    /// Outer radius of the neuropil annulus
    pub outer_radius : usize,
    /// Neuropil subtraction coefficient for corrected traces
    pub neucoeff : f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            inner_radius : 2,
            outer_radius : 8,
            neucoeff : 0.7,
        }
    }
}

/// Top-level configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames per parallel work chunk
    pub batch_size : usize,
    pub correlation : CorrelationOptions,
    pub reference : ReferenceConfig,
    pub rigid : RigidConfig,
    /// `None` skips the non-rigid pass entirely
    pub nonrigid : Option<NonrigidConfig>,
    pub detection : DetectionConfig,
    pub extraction : ExtractionConfig,
}

impl PipelineConfig {
    /// Checks every parameter against the movie it is about to
    /// process. Returns the first violation found.
    pub fn validate(
        &self,
        dims : &Dimensions,
        n_frames : usize,
    ) -> Result<(), CorrosuiteError> {
        let fail = |msg : String| Err(CorrosuiteError::Configuration(msg));

        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".to_string());
        }
        if self.correlation.eps <= 0.0 {
            return fail(format!(
                "correlation eps must be positive, got {}", self.correlation.eps));
        }
        if let Some(sigma) = self.correlation.smooth_sigma {
            if sigma <= 0.0 {
                return fail(format!(
                    "correlation smooth_sigma must be positive, got {}", sigma));
            }
        }

        if !(0.0..=0.5).contains(&self.rigid.max_shift_frac)
            || self.rigid.max_shift_frac == 0.0
        {
            return fail(format!(
                "rigid max_shift_frac must be in (0, 0.5], got {}",
                self.rigid.max_shift_frac));
        }
        if self.rigid.min_peak_ratio <= 0.0 {
            return fail(format!(
                "rigid min_peak_ratio must be positive, got {}",
                self.rigid.min_peak_ratio));
        }

        if self.reference.subset_size == 0 {
            return fail("reference subset_size must be at least 1".to_string());
        }
        if self.reference.max_iterations == 0 {
            return fail("reference max_iterations must be at least 1".to_string());
        }
        if self.reference.convergence_px <= 0.0 {
            return fail(format!(
                "reference convergence_px must be positive, got {}",
                self.reference.convergence_px));
        }
        if !(0.0..=1.0).contains(&self.reference.seed_fraction)
            || self.reference.seed_fraction == 0.0
        {
            return fail(format!(
                "reference seed_fraction must be in (0, 1], got {}",
                self.reference.seed_fraction));
        }

        if let Some(nonrigid) = &self.nonrigid {
            if nonrigid.block_size > dims.ydim || nonrigid.block_size > dims.xdim {
                return fail(format!(
                    "nonrigid block_size {} exceeds frame dimensions ({}, {})",
                    nonrigid.block_size, dims.ydim, dims.xdim));
            }
            if nonrigid.block_size <= 2 * nonrigid.max_shift_block {
                return fail(format!(
                    "nonrigid block_size {} must exceed twice max_shift_block {}",
                    nonrigid.block_size, nonrigid.max_shift_block));
            }
            if !(0.0..1.0).contains(&nonrigid.overlap_frac) {
                return fail(format!(
                    "nonrigid overlap_frac must be in [0, 1), got {}",
                    nonrigid.overlap_frac));
            }
            if nonrigid.min_peak_ratio_block <= 0.0 {
                return fail(format!(
                    "nonrigid min_peak_ratio_block must be positive, got {}",
                    nonrigid.min_peak_ratio_block));
            }
        }

        if self.detection.bin_factor == 0 {
            return fail("detection bin_factor must be at least 1".to_string());
        }
        if n_frames > 0 && self.detection.bin_factor > n_frames {
            return fail(format!(
                "detection bin_factor {} exceeds frame count {}",
                self.detection.bin_factor, n_frames));
        }
        if self.detection.threshold_scale <= 0.0 {
            return fail(format!(
                "detection threshold_scale must be positive, got {}",
                self.detection.threshold_scale));
        }
        if self.detection.max_components == 0 {
            return fail("detection max_components must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.detection.extend_frac)
            || self.detection.extend_frac == 0.0
        {
            return fail(format!(
                "detection extend_frac must be in (0, 1), got {}",
                self.detection.extend_frac));
        }
        if self.detection.max_radius == 0 {
            return fail("detection max_radius must be at least 1".to_string());
        }
        if self.detection.min_npix == 0 {
            return fail("detection min_npix must be at least 1".to_string());
        }
        if self.detection.max_npix < self.detection.min_npix {
            return fail(format!(
                "detection max_npix {} below min_npix {}",
                self.detection.max_npix, self.detection.min_npix));
        }
        if self.detection.max_compactness <= 0.0 {
            return fail(format!(
                "detection max_compactness must be positive, got {}",
                self.detection.max_compactness));
        }
        if !(0.0..=1.0).contains(&self.detection.max_overlap) {
            return fail(format!(
                "detection max_overlap must be in [0, 1], got {}",
                self.detection.max_overlap));
        }

        if self.extraction.inner_radius == 0 {
            return fail("extraction inner_radius must be at least 1".to_string());
        }
        if self.extraction.outer_radius <= self.extraction.inner_radius {
            return fail(format!(
                "extraction outer_radius {} must exceed inner_radius {}",
                self.extraction.outer_radius, self.extraction.inner_radius));
        }
        if !(0.0..=1.0).contains(&self.extraction.neucoeff) {
            return fail(format!(
                "extraction neucoeff must be in [0, 1], got {}",
                self.extraction.neucoeff));
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_size : 200,
            correlation : CorrelationOptions::default(),
            reference : ReferenceConfig::default(),
            rigid : RigidConfig::default(),
            nonrigid : Some(NonrigidConfig::default()),
            detection : DetectionConfig::default(),
            extraction : ExtractionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = PipelineConfig::default();
        let dims = Dimensions::new(256, 256);
        assert!(config.validate(&dims, 1000).is_ok());
    }

    #[test]
    fn test_block_size_checked_against_frame() {
        let config = PipelineConfig::default();
        // default block_size 128 does not fit a 64x64 frame
        let dims = Dimensions::new(64, 64);
        assert!(config.validate(&dims, 1000).is_err());

        let mut config = config;
        config.nonrigid = None;
        assert!(config.validate(&dims, 1000).is_ok());
    }

    #[test]
    fn test_radius_ordering_rejected() {
        let mut config = PipelineConfig::default();
        config.extraction.inner_radius = 8;
        config.extraction.outer_radius = 4;
        let dims = Dimensions::new(256, 256);
        assert!(config.validate(&dims, 1000).is_err());
    }

    #[test]
    fn test_bin_factor_checked_against_frame_count() {
        let mut config = PipelineConfig::default();
        config.detection.bin_factor = 50;
        let dims = Dimensions::new(256, 256);
        assert!(config.validate(&dims, 20).is_err());
        assert!(config.validate(&dims, 100).is_ok());
    }
}
