use derive_getters::{Dissolve, Getters};
use eyre::Result;

use crate::error::CallError;

pub const PRECISION: f64 = 0.01;
/// Effective (gap-free) size of the human genome
pub const GENOME_SIZE: f64 = 2.9e+9;
/// Expected fraction of the genome affected by copy-number variation
pub const GENOME_CNV_FRACTION: f64 = 0.01;
pub const GENOME_SIZE_NORMAL: f64 = GENOME_SIZE * (1.0 - GENOME_CNV_FRACTION);
pub const GENOME_SIZE_CNV: f64 = GENOME_SIZE * GENOME_CNV_FRACTION;
pub const CUTOFF_REGION: f64 = 0.05;
pub const CUTOFF_TWO_REGIONS: f64 = 0.01;

/// GC bias correction strategy
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Correction {
    None,
    /// Normalize each bin by the mean depth of its GC bucket
    #[default]
    Gc,
    /// Same as `Gc`, but the factor is averaged over the bins covered by a fragment
    GcByFragment { fragment_length: u64 },
}

/// Whether caller-supplied skip flags take part in the exclusion mask
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MaskPolicy {
    /// Statistics are computed over all bins, skip flags are ignored
    Strict,
    /// Skipped bins are always excluded
    #[default]
    SkipAware,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Passes {
    One,
    #[default]
    Two,
}

impl Passes {
    pub fn count(&self) -> usize {
        match self {
            Passes::One => 1,
            Passes::Two => 2,
        }
    }
}

/// Optional per-chromosome diagnostics to keep in the results
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Outputs {
    pub corrected: bool,
    pub level: bool,
    pub mask: bool,
    pub partitions: bool,
}

impl Outputs {
    pub fn all() -> Self {
        Self {
            corrected: true,
            level: true,
            mask: true,
            partitions: true,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Getters, Dissolve)]
pub struct Config {
    bin_size: u64,
    correction: Correction,
    /// Normalize depth by AT content using bins on the normal side of the genotype valley
    at_correction: bool,
    band: usize,
    nsigma: f64,
    mask_policy: MaskPolicy,
    passes: Passes,
    delta: f64,
    region_cutoff: f64,
    two_region_cutoff: f64,
    two_region_scale: f64,
    min_deviation: f64,
    min_gc_entries: f64,
    min_bucket_entries: f64,
    min_fit_entries: f64,
    max_gap_percentage: f64,
    histogram_bins: usize,
    outputs: Outputs,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bin_size: 100,
            correction: Correction::default(),
            at_correction: false,
            band: 8,
            nsigma: 4.0,
            mask_policy: MaskPolicy::default(),
            passes: Passes::default(),
            delta: 0.25,
            region_cutoff: CUTOFF_REGION,
            two_region_cutoff: CUTOFF_TWO_REGIONS,
            two_region_scale: 1.0,
            min_deviation: 0.25,
            min_gc_entries: 1000.0,
            min_bucket_entries: 100.0,
            min_fit_entries: 1000.0,
            max_gap_percentage: 50.0,
            histogram_bins: 1000,
            outputs: Outputs::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> eyre::Report {
    CallError::InvalidConfig(msg.into()).into()
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bin_size(&mut self, bin_size: u64) -> Result<&mut Self> {
        if bin_size == 0 {
            return Err(invalid("Bin size must be greater than 0"));
        }
        self.bin_size = bin_size;
        Ok(self)
    }

    pub fn set_correction(&mut self, correction: Correction) -> Result<&mut Self> {
        if let Correction::GcByFragment { fragment_length } = correction {
            if fragment_length == 0 {
                return Err(invalid("Fragment length must be greater than 0"));
            }
        }
        self.correction = correction;
        Ok(self)
    }

    pub fn set_at_correction(&mut self, enabled: bool) -> &mut Self {
        self.at_correction = enabled;
        self
    }

    pub fn set_band(&mut self, band: usize) -> Result<&mut Self> {
        if band == 0 {
            return Err(invalid("Band radius must be greater than 0"));
        }
        self.band = band;
        Ok(self)
    }

    pub fn set_nsigma(&mut self, nsigma: f64) -> Result<&mut Self> {
        if !(nsigma > 0.0) {
            return Err(invalid("Masking threshold must be positive"));
        }
        self.nsigma = nsigma;
        Ok(self)
    }

    pub fn set_mask_policy(&mut self, policy: MaskPolicy) -> &mut Self {
        self.mask_policy = policy;
        self
    }

    pub fn set_passes(&mut self, passes: Passes) -> &mut Self {
        self.passes = passes;
        self
    }

    pub fn set_delta(&mut self, delta: f64) -> Result<&mut Self> {
        if !(delta >= 0.0) || !delta.is_finite() {
            return Err(invalid("Merge delta must be a finite non-negative number"));
        }
        self.delta = delta;
        Ok(self)
    }

    pub fn set_region_cutoff(&mut self, cutoff: f64) -> Result<&mut Self> {
        if !(cutoff > 0.0) {
            return Err(invalid("Region E-value cutoff must be positive"));
        }
        self.region_cutoff = cutoff;
        Ok(self)
    }

    pub fn set_two_region_cutoff(&mut self, cutoff: f64) -> Result<&mut Self> {
        if !(cutoff > 0.0) {
            return Err(invalid("Two-region cutoff must be positive"));
        }
        self.two_region_cutoff = cutoff;
        Ok(self)
    }

    pub fn set_two_region_scale(&mut self, scale: f64) -> Result<&mut Self> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(invalid("Two-region scale must be a finite positive number"));
        }
        self.two_region_scale = scale;
        Ok(self)
    }

    pub fn set_min_deviation(&mut self, deviation: f64) -> Result<&mut Self> {
        if !(deviation >= 0.0) {
            return Err(invalid("Minimal deviation must be non-negative"));
        }
        self.min_deviation = deviation;
        Ok(self)
    }

    pub fn set_min_gc_entries(&mut self, entries: f64, per_bucket: f64) -> Result<&mut Self> {
        if !(entries >= 0.0) || !(per_bucket >= 0.0) {
            return Err(invalid("Minimal GC histogram entries must be non-negative"));
        }
        self.min_gc_entries = entries;
        self.min_bucket_entries = per_bucket;
        Ok(self)
    }

    /// Minimal number of bins in a depth histogram to fit its modes
    pub fn set_min_fit_entries(&mut self, entries: f64) -> Result<&mut Self> {
        if !(entries >= 0.0) {
            return Err(invalid("Minimal depth histogram entries must be non-negative"));
        }
        self.min_fit_entries = entries;
        Ok(self)
    }

    pub fn set_max_gap_percentage(&mut self, percentage: f64) -> Result<&mut Self> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(invalid("Gap percentage must be within [0, 100]"));
        }
        self.max_gap_percentage = percentage;
        Ok(self)
    }

    pub fn set_histogram_bins(&mut self, bins: usize) -> Result<&mut Self> {
        if bins < 10 {
            return Err(invalid("Depth histograms need at least 10 bins"));
        }
        self.histogram_bins = bins;
        Ok(self)
    }

    pub fn set_outputs(&mut self, outputs: Outputs) -> &mut Self {
        self.outputs = outputs;
        self
    }

    /// Number of neighbouring bins on each side covered by a single fragment
    pub fn fragment_window(&self) -> usize {
        match self.correction {
            Correction::GcByFragment { fragment_length } => {
                fragment_length.div_ceil(2 * self.bin_size) as usize
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(*config.region_cutoff(), CUTOFF_REGION);
        assert_eq!(*config.two_region_cutoff(), CUTOFF_TWO_REGIONS);
        assert_eq!(config.passes().count(), 2);
        assert_eq!(*config.mask_policy(), MaskPolicy::SkipAware);
        assert!(!config.at_correction());
        assert!((GENOME_SIZE_NORMAL + GENOME_SIZE_CNV - GENOME_SIZE).abs() < 1.0);
    }

    #[test]
    fn test_setters_validate() {
        let mut config = Config::new();
        assert!(config.set_bin_size(0).is_err());
        assert!(config.set_band(0).is_err());
        assert!(config.set_delta(-0.1).is_err());
        assert!(config.set_delta(f64::NAN).is_err());
        assert!(config.set_region_cutoff(0.0).is_err());
        assert!(config.set_max_gap_percentage(101.0).is_err());

        let err = config.set_band(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CallError>(),
            Some(CallError::InvalidConfig(_))
        ));

        config.set_band(16).unwrap().set_delta(0.1).unwrap();
        assert_eq!(*config.band(), 16);
        assert_eq!(*config.delta(), 0.1);
    }

    #[test]
    fn test_fragment_window() {
        let mut config = Config::new();
        assert_eq!(config.fragment_window(), 0);

        config
            .set_bin_size(100)
            .unwrap()
            .set_correction(Correction::GcByFragment {
                fragment_length: 350,
            })
            .unwrap();
        assert_eq!(config.fragment_window(), 2);
        assert!(config
            .set_correction(Correction::GcByFragment { fragment_length: 0 })
            .is_err());
    }
}
