use ahash::HashMap;
use cnvscan_core_rs::loc::Contig;
use derive_getters::Dissolve;
use eyre::Result;
use log::{debug, warn};

use crate::calling::RegionCaller;
use crate::config::Config;
use crate::level::LevelEstimator;
use crate::merge::SegmentMerger;
use crate::numeric::NumericCache;
use crate::result::{CalledRegion, ChromosomeOutputs};
use crate::signal::ChromosomeSignal;
use crate::stats::Baseline;

/// Validated chromosome signal, ready for calling
#[derive(Clone, PartialEq, Debug)]
pub(crate) struct Prepared {
    pub depth: Vec<f64>,
    pub gc: Vec<f64>,
    pub at: Option<Vec<f64>>,
    pub skip: Vec<bool>,
    pub sex: bool,
    pub corrected: bool,
}

impl Prepared {
    pub fn new<Ctg: Contig>(signal: ChromosomeSignal<Ctg>, config: &Config) -> Result<Self> {
        signal.validate()?;
        let skip = signal.skip_flags(*config.max_gap_percentage());
        let (_, depth, gc, at, _, sex) = signal.dissolve();
        Ok(Self {
            depth,
            gc,
            at,
            skip,
            sex,
            corrected: false,
        })
    }

    /// (depth, GC) of bins that are not skipped
    pub fn usable(&self) -> impl Iterator<Item = (&f64, &f64)> {
        self.depth
            .iter()
            .zip(&self.gc)
            .zip(&self.skip)
            .filter(|(_, skip)| !**skip)
            .map(|(x, _)| x)
    }
}

#[derive(Debug, Default, Dissolve)]
pub struct Worker {
    // Chromosome ID -> diagnostics or the error that stopped it
    outcomes: HashMap<usize, Result<ChromosomeOutputs>>,
}

impl Worker {
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.outcomes.shrink_to_fit();
    }

    /// Level, merge and call a single chromosome. Failures are kept for the report and yield no
    /// regions.
    pub(crate) fn process<Ctg: Contig>(
        &mut self,
        ind: usize,
        contig: &Ctg,
        chromosome: &Prepared,
        baseline: &Baseline,
        config: &Config,
        cache: &NumericCache,
    ) -> Vec<CalledRegion<Ctg>> {
        match Self::call(contig, chromosome, baseline, config, cache) {
            Ok((regions, outputs)) => {
                debug!(
                    "Chromosome {contig:?}: {} bins, {} regions called",
                    chromosome.depth.len(),
                    regions.len()
                );
                self.outcomes.insert(ind, Ok(outputs));
                regions
            }
            Err(err) => {
                warn!("Chromosome {contig:?} failed: {err}");
                self.outcomes.insert(ind, Err(err));
                Vec::new()
            }
        }
    }

    fn call<Ctg: Contig>(
        contig: &Ctg,
        chromosome: &Prepared,
        baseline: &Baseline,
        config: &Config,
        cache: &NumericCache,
    ) -> Result<(Vec<CalledRegion<Ctg>>, ChromosomeOutputs)> {
        let depth = &chromosome.depth;

        // 1. Estimate the local level
        let signal = LevelEstimator::new(
            cache,
            *config.band(),
            *config.nsigma(),
            *config.passes(),
            *config.mask_policy(),
        )
        .estimate(depth, &chromosome.skip, baseline)?;

        // 2. Merge bins into partitions
        let merger = SegmentMerger::new(*config.delta());
        let partitions = merger.merge(signal.level(), signal.mask())?;

        // 3. Call regions
        let regions = RegionCaller::new(cache, config).call(
            contig,
            depth,
            signal.mask(),
            &partitions,
            baseline,
        )?;

        // 4. Requested diagnostics
        let requested = config.outputs();
        let mut outputs = ChromosomeOutputs::new(regions.len());
        if requested.corrected {
            outputs = outputs.with_corrected(depth.clone());
        }
        if requested.partitions {
            let merged = merger.flatten(&partitions, signal.mask());
            outputs = outputs.with_partitions(merged, partitions);
        }
        let (level, _, mask) = signal.dissolve();
        if requested.level {
            outputs = outputs.with_level(level);
        }
        if requested.mask {
            outputs = outputs.with_mask(mask);
        }

        Ok((regions, outputs))
    }

    pub fn collapse<'a>(
        workers: impl Iterator<Item = &'a mut Worker>,
    ) -> HashMap<usize, Result<ChromosomeOutputs>> {
        let mut collapsed = HashMap::default();
        for worker in workers {
            collapsed.extend(worker.outcomes.drain());
        }
        collapsed
    }
}
