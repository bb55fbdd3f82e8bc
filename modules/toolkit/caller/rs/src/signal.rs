use cnvscan_core_rs::loc::{Contig, Interval, IntervalOp};
use derive_getters::{Dissolve, Getters};
use eyre::Result;

use crate::error::{ensure_len, CallError};

/// Chromosomes that are expected to have a ploidy different from autosomes
pub fn is_sex_chromosome(name: &str) -> bool {
    let name = name.strip_prefix("chr").unwrap_or(name);
    matches!(name, "X" | "Y" | "x" | "y")
}

/// Binned read-depth signal of a single chromosome together with its side channels.
/// All arrays share the same bin indexing.
#[derive(Clone, PartialEq, Debug, Getters, Dissolve)]
pub struct ChromosomeSignal<Ctg: Contig> {
    contig: Ctg,
    depth: Vec<f64>,
    /// GC percentage per bin, NaN when unknown
    gc: Vec<f64>,
    at: Option<Vec<f64>>,
    skip: Option<Vec<bool>>,
    sex: bool,
}

impl<Ctg: Contig> ChromosomeSignal<Ctg> {
    pub fn new(contig: Ctg, depth: Vec<f64>, gc: Vec<f64>) -> Self {
        Self {
            contig,
            depth,
            gc,
            at: None,
            skip: None,
            sex: false,
        }
    }

    pub fn with_at(mut self, at: Vec<f64>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn with_skip(mut self, skip: Vec<bool>) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Mark bins overlapping the given base-pair intervals as skipped. Intervals beyond the end of
    /// the chromosome are clipped.
    pub fn with_skip_regions(mut self, mut regions: Vec<Interval<u64>>, bin_size: u64) -> Result<Self> {
        let nbins = self.depth.len();
        let mut skip = self.skip.take().unwrap_or_else(|| vec![false; nbins]);
        ensure_len("Skip flags", nbins, skip.len())?;

        for region in Interval::merge(&mut regions) {
            let bins = region.binned(bin_size)?;
            let start = (bins.start() as usize).min(nbins);
            let end = (bins.end() as usize).min(nbins);
            skip[start..end].fill(true);
        }
        self.skip = Some(skip);
        Ok(self)
    }

    pub fn with_sex_chromosome(mut self, sex: bool) -> Self {
        self.sex = sex;
        self
    }

    pub fn len(&self) -> usize {
        self.depth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth.is_empty()
    }

    /// Ensure that all side channels match the depth array and carry sane values
    pub fn validate(&self) -> Result<()> {
        let nbins = self.depth.len();
        ensure_len("GC", nbins, self.gc.len())?;
        if let Some(at) = &self.at {
            ensure_len("AT", nbins, at.len())?;
        }
        if let Some(skip) = &self.skip {
            ensure_len("Skip flags", nbins, skip.len())?;
        }

        if let Some(index) = self.depth.iter().position(|x| !x.is_finite() || *x < 0.0) {
            return Err(CallError::InvalidValue {
                what: "Depth",
                index,
            }
            .into());
        }
        let percentage = |x: &f64| x.is_nan() || (0.0..=100.0).contains(x);
        if let Some(index) = self.gc.iter().position(|x| !percentage(x)) {
            return Err(CallError::InvalidValue { what: "GC", index }.into());
        }
        if let Some(index) = self.at.iter().flatten().position(|x| !percentage(x)) {
            return Err(CallError::InvalidValue { what: "AT", index }.into());
        }
        Ok(())
    }

    /// Caller-supplied skip flags combined with gap bins, i.e. bins where the N content
    /// `100 - GC - AT` exceeds `max_gap_percentage`.
    pub fn skip_flags(&self, max_gap_percentage: f64) -> Vec<bool> {
        let mut flags = self
            .skip
            .clone()
            .unwrap_or_else(|| vec![false; self.depth.len()]);

        if let Some(at) = &self.at {
            for ((flag, gc), at) in flags.iter_mut().zip(&self.gc).zip(at) {
                let gap = if gc.is_nan() || at.is_nan() {
                    100.0
                } else {
                    100.0 - gc - at
                };
                if gap > max_gap_percentage {
                    *flag = true;
                }
            }
        }
        flags
    }
}

impl<Ctg: Contig + AsRef<str>> ChromosomeSignal<Ctg> {
    /// Flag X/Y chromosomes by their name
    pub fn detect_sex_chromosome(self) -> Self {
        let sex = is_sex_chromosome(self.contig.as_ref());
        self.with_sex_chromosome(sex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_sex_chromosome() {
        for name in ["X", "Y", "chrX", "chrY"] {
            assert!(is_sex_chromosome(name), "{name}");
        }
        for name in ["1", "chr1", "chrM", "XY", "chrX_random", ""] {
            assert!(!is_sex_chromosome(name), "{name}");
        }

        let signal = ChromosomeSignal::new("chrX".to_string(), vec![], vec![]).detect_sex_chromosome();
        assert!(*signal.sex());
    }

    #[test]
    fn test_validate() {
        let signal = ChromosomeSignal::new("1", vec![1.0, 2.0], vec![40.0, f64::NAN]);
        assert!(signal.validate().is_ok());

        let err = ChromosomeSignal::new("1", vec![1.0, 2.0], vec![40.0])
            .validate()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CallError>(),
            Some(&CallError::InputShape {
                what: "GC",
                expected: 2,
                got: 1
            })
        );

        let err = ChromosomeSignal::new("1", vec![1.0, -2.0], vec![40.0, 40.0])
            .validate()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CallError>(),
            Some(&CallError::InvalidValue {
                what: "Depth",
                index: 1
            })
        );

        let signal = ChromosomeSignal::new("1", vec![1.0, 2.0], vec![40.0, 40.0]);
        assert!(signal.clone().with_at(vec![50.0]).validate().is_err());
        assert!(signal.clone().with_at(vec![50.0, 120.0]).validate().is_err());
        assert!(signal.clone().with_skip(vec![true]).validate().is_err());
        assert!(signal.with_skip(vec![true, false]).validate().is_ok());
    }

    #[test]
    fn test_skip_flags() {
        let signal = ChromosomeSignal::new("1", vec![1.0; 4], vec![40.0, 10.0, 0.0, f64::NAN]);
        assert_eq!(signal.skip_flags(50.0), vec![false; 4]);

        let signal = signal
            .with_at(vec![40.0, 10.0, 0.0, 50.0])
            .with_skip(vec![true, false, false, false]);
        assert_eq!(signal.skip_flags(50.0), vec![true, true, true, true]);
        assert_eq!(signal.skip_flags(100.0), vec![true, false, false, false]);
    }

    #[test]
    fn test_skip_regions() {
        let regions = vec![
            Interval::new(250, 260).unwrap(),
            Interval::new(0, 100).unwrap(),
            Interval::new(950, 5000).unwrap(),
        ];
        let signal = ChromosomeSignal::new("1", vec![1.0; 10], vec![40.0; 10])
            .with_skip_regions(regions, 100)
            .unwrap();
        assert_eq!(
            signal.skip().as_deref(),
            Some(&[true, false, true, false, false, false, false, false, false, true][..])
        );

        let signal = ChromosomeSignal::new("1", vec![1.0; 3], vec![40.0; 3])
            .with_skip(vec![false, true, false])
            .with_skip_regions(vec![Interval::new(0, 1).unwrap()], 100)
            .unwrap();
        assert_eq!(signal.skip().as_deref(), Some(&[true, true, false][..]));
    }
}
