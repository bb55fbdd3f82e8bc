use cnvscan_core_rs::loc::{Contig, Interval};
use derive_getters::{Dissolve, Getters};
use derive_more::{Constructor, Display};
use eyre::Result;

use crate::genotype::GenotypeFit;
use crate::merge::Partition;
use crate::stats::Baseline;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum CnvClass {
    #[display("gain")]
    Gain,
    #[display("loss")]
    Loss,
}

#[derive(Clone, PartialEq, Debug, Constructor, Getters, Dissolve)]
pub struct CalledRegion<Ctg: Contig> {
    contig: Ctg,
    /// First and last bin of the region (inclusive)
    start: usize,
    end: usize,
    /// Number of non-excluded bins
    size: usize,
    mean_depth: f64,
    e_value: f64,
    gaussian_e_value: f64,
    class: CnvClass,
    copy_number: f64,
}

impl<Ctg: Contig> CalledRegion<Ctg> {
    pub fn bins(&self) -> usize {
        self.end - self.start + 1
    }

    /// Base-pair interval covered by the region
    pub fn interval(&self, bin_size: u64) -> Result<Interval<u64>> {
        Interval::new(self.start as u64, self.end as u64 + 1)?.unbinned(bin_size)
    }
}

/// Optional per-chromosome diagnostics, only the requested ones are present
#[derive(Clone, PartialEq, Debug, Default, Getters, Dissolve)]
pub struct ChromosomeOutputs {
    corrected: Option<Vec<f64>>,
    level: Option<Vec<f64>>,
    mask: Option<Vec<bool>>,
    merged: Option<Vec<f64>>,
    partitions: Option<Vec<Partition>>,
    /// Number of called regions
    regions: usize,
}

impl ChromosomeOutputs {
    pub(crate) fn new(regions: usize) -> Self {
        Self {
            regions,
            ..Default::default()
        }
    }

    pub(crate) fn with_corrected(mut self, corrected: Vec<f64>) -> Self {
        self.corrected = Some(corrected);
        self
    }

    pub(crate) fn with_level(mut self, level: Vec<f64>) -> Self {
        self.level = Some(level);
        self
    }

    pub(crate) fn with_mask(mut self, mask: Vec<bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub(crate) fn with_partitions(mut self, merged: Vec<f64>, partitions: Vec<Partition>) -> Self {
        self.merged = Some(merged);
        self.partitions = Some(partitions);
        self
    }
}

/// Outcome of a single chromosome. Failed chromosomes carry the error that stopped them and never
/// contribute regions.
#[derive(Debug, Constructor, Getters, Dissolve)]
pub struct ChromosomeReport<Ctg: Contig> {
    contig: Ctg,
    /// Whether GC or AT bias correction was applied
    corrected: bool,
    status: Result<ChromosomeOutputs>,
}

impl<Ctg: Contig> ChromosomeReport<Ctg> {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

#[derive(Debug, Default, Constructor, Getters, Dissolve)]
pub struct Harvest<Ctg: Contig> {
    /// Called regions, grouped by chromosome (in input order) and sorted by position
    regions: Vec<CalledRegion<Ctg>>,
    chromosomes: Vec<ChromosomeReport<Ctg>>,
    autosomal: Option<Baseline>,
    sex: Option<Baseline>,
    genotype: Option<GenotypeFit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_called_region() {
        let region = CalledRegion::new("1", 400, 449, 50, 100.0, 1e-10, 1e-20, CnvClass::Gain, 4.0);
        assert_eq!(region.bins(), 50);
        assert_eq!(
            region.interval(100).unwrap(),
            Interval::new(40_000, 45_000).unwrap()
        );
        assert_eq!(region.class().to_string(), "gain");
        assert_eq!(CnvClass::Loss.to_string(), "loss");
    }

    #[test]
    fn test_outputs() {
        let outputs = ChromosomeOutputs::new(2).with_mask(vec![true, false]);
        assert_eq!(*outputs.regions(), 2);
        assert_eq!(outputs.mask().as_deref(), Some(&[true, false][..]));
        assert!(outputs.level().is_none());
        assert!(outputs.partitions().is_none());
    }
}
