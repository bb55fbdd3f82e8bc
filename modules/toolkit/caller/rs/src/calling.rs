use cnvscan_core_rs::loc::Contig;
use derive_getters::{Dissolve, Getters};
use eyre::Result;
use log::debug;

use crate::config::{Config, GENOME_SIZE, GENOME_SIZE_NORMAL};
use crate::error::{ensure_len, CallError};
use crate::histogram::normal_cdf;
use crate::merge::Partition;
use crate::numeric::NumericCache;
use crate::result::{CalledRegion, CnvClass};
use crate::stats::{region_stats, Baseline, RunningStats};

/// Result of the boundary refinement. `moved == false` means that no step improved the E-value and
/// the region was kept at its original extent.
#[derive(Clone, Copy, PartialEq, Debug, Getters, Dissolve)]
pub struct Adjustment {
    start: usize,
    end: usize,
    e_value: f64,
    initial_e_value: f64,
    moved: bool,
}

// Candidate region during calling: inclusive bin range and statistics of its non-excluded bins
#[derive(Clone, Copy, Debug)]
struct Candidate {
    start: usize,
    end: usize,
    stats: RunningStats,
}

/// Scores, refines and classifies candidate regions against a baseline
#[derive(Clone, Copy, Debug)]
pub struct RegionCaller<'a> {
    cache: &'a NumericCache,
    bin_size: f64,
    region_cutoff: f64,
    two_region_cutoff: f64,
    two_region_scale: f64,
    min_deviation: f64,
}

impl<'a> RegionCaller<'a> {
    pub fn new(cache: &'a NumericCache, config: &Config) -> Self {
        Self {
            cache,
            bin_size: *config.bin_size() as f64,
            region_cutoff: *config.region_cutoff(),
            two_region_cutoff: *config.two_region_cutoff(),
            two_region_scale: *config.two_region_scale(),
            min_deviation: *config.min_deviation(),
        }
    }

    /// Expected number of regions of this size in a normal genome with a mean at least as extreme.
    /// Regions with less than 2 bins can't be tested and get an infinite E-value.
    pub fn e_value(&self, baseline: &Baseline, stats: &RunningStats) -> f64 {
        let n = stats.n();
        let func = match self.cache.stat_function(n) {
            Some(func) => func,
            None => return f64::INFINITY,
        };

        let mut sigma = stats.variance().sqrt();
        if sigma == 0.0 {
            sigma = 1.0;
        }
        let t = (stats.mean() - baseline.mean()) / sigma * self.cache.sqrt(n);
        func.tail(t) * GENOME_SIZE_NORMAL / self.bin_size * self.cache.inverse(n)
    }

    pub fn get_e_value(
        &self,
        baseline: &Baseline,
        depth: &[f64],
        mask: &[bool],
        start: usize,
        end: usize,
    ) -> Result<f64> {
        let stats = region_stats(depth, mask, start, end)?;
        if stats.n() == 0 {
            return Err(CallError::EmptyPartition { start, end }.into());
        }
        Ok(self.e_value(baseline, &stats))
    }

    /// E-value under the Gaussian null: probability that all bins of the region are at least as
    /// extreme as its least extreme bin.
    pub fn gaussian_e_value(
        &self,
        baseline: &Baseline,
        depth: &[f64],
        mask: &[bool],
        start: usize,
        end: usize,
    ) -> Result<f64> {
        ensure_len("Mask", depth.len(), mask.len())?;
        if start > end || end >= depth.len() {
            return Err(CallError::EmptyPartition { start, end }.into());
        }

        let (mut n, mut sum, mut min, mut max) = (0, 0.0, f64::INFINITY, f64::NEG_INFINITY);
        for (x, excluded) in depth[start..=end].iter().zip(&mask[start..=end]) {
            if !excluded {
                n += 1;
                sum += x;
                min = min.min(*x);
                max = max.max(*x);
            }
        }
        if n == 0 {
            return Err(CallError::EmptyPartition { start, end }.into());
        }

        let sigma = baseline.sigma().max(f64::MIN_POSITIVE);
        let p = if sum / (n as f64) < *baseline.mean() {
            normal_cdf((max - baseline.mean()) / sigma)
        } else {
            normal_cdf((baseline.mean() - min) / sigma)
        };
        Ok(p.powi(n) * GENOME_SIZE / self.bin_size)
    }

    pub fn test_region(
        &self,
        baseline: &Baseline,
        depth: &[f64],
        mask: &[bool],
        start: usize,
        end: usize,
    ) -> Result<bool> {
        Ok(self.get_e_value(baseline, depth, mask, start, end)? < self.region_cutoff)
    }

    /// Scaled one-sided Welch's t-test probability that two regions share the same mean.
    /// Regions with less than 2 bins are never distinguishable.
    pub fn test_two_regions(&self, first: &RunningStats, second: &RunningStats) -> f64 {
        if first.n() < 2 || second.n() < 2 {
            return 1.0;
        }

        let v1 = first.variance() * self.cache.inverse(first.n());
        let v2 = second.variance() * self.cache.inverse(second.n());
        let diff = first.mean() - second.mean();
        if v1 + v2 == 0.0 {
            return if diff == 0.0 { 1.0 } else { 0.0 };
        }

        let t = diff / (v1 + v2).sqrt();
        let dof = (v1 + v2).powi(2)
            / (v1 * v1 * self.cache.inverse(first.n() - 1)
                + v2 * v2 * self.cache.inverse(second.n() - 1));
        // Fractional degrees of freedom are floored to reuse cached functions
        let samples = (dof.floor().max(1.0) as usize).saturating_add(1);
        match self.cache.stat_function(samples) {
            Some(func) => func.tail(t) * self.two_region_scale,
            None => 1.0,
        }
    }

    /// Greedy boundary refinement within `bounds` (inclusive). Each step takes the best of four
    /// moves (shrink or grow on either side) and is accepted only if it strictly improves the
    /// E-value. Excluded bins are stepped over.
    pub fn adjust_to_e_value(
        &self,
        baseline: &Baseline,
        depth: &[f64],
        mask: &[bool],
        start: usize,
        end: usize,
        bounds: (usize, usize),
    ) -> Result<Adjustment> {
        ensure_len("Mask", depth.len(), mask.len())?;
        let (lo, hi) = (bounds.0, bounds.1.min(depth.len().saturating_sub(1)));
        if start > end || end >= depth.len() {
            return Err(CallError::EmptyPartition { start, end }.into());
        }

        let next = |from: usize, to: usize| (from..=to).find(|x| !mask[*x]);
        let prev = |from: usize, to: usize| (to..=from).rev().find(|x| !mask[*x]);

        // Region boundaries always sit on non-excluded bins
        let (mut start, mut end) = match (next(start, end), prev(end, start)) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(CallError::EmptyPartition { start, end }.into()),
        };
        let mut stats = region_stats(depth, mask, start, end)?;
        let initial = self.e_value(baseline, &stats);
        let mut current = initial;
        let mut moved = false;

        loop {
            let mut best: Option<(usize, usize, RunningStats, f64)> = None;
            let mut consider = |s: usize, e: usize, candidate: RunningStats| {
                let e_value = self.e_value(baseline, &candidate);
                if best.map_or(true, |x| e_value < x.3) {
                    best = Some((s, e, candidate, e_value));
                }
            };

            if stats.n() > 2 {
                // Shrink from the left
                if let Some(s) = next(start + 1, end) {
                    let mut candidate = stats;
                    candidate.remove(depth[start]);
                    consider(s, end, candidate);
                }
                // Shrink from the right
                if let Some(e) = end.checked_sub(1).and_then(|x| prev(x, start)) {
                    let mut candidate = stats;
                    candidate.remove(depth[end]);
                    consider(start, e, candidate);
                }
            }
            // Grow to the left
            if start > lo {
                if let Some(s) = prev(start - 1, lo) {
                    let mut candidate = stats;
                    candidate.add(depth[s]);
                    consider(s, end, candidate);
                }
            }
            // Grow to the right
            if end < hi {
                if let Some(e) = next(end + 1, hi) {
                    let mut candidate = stats;
                    candidate.add(depth[e]);
                    consider(start, e, candidate);
                }
            }

            match best {
                Some((s, e, candidate, e_value)) if e_value < current => {
                    start = s;
                    end = e;
                    stats = candidate;
                    current = e_value;
                    moved = true;
                }
                _ => break,
            }
        }

        Ok(Adjustment {
            start,
            end,
            e_value: current,
            initial_e_value: initial,
            moved,
        })
    }

    // Partitions turned into candidates, merging neighbours that can't be told apart
    fn candidates(&self, depth: &[f64], mask: &[bool], partitions: &[Partition]) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = Vec::with_capacity(partitions.len());
        for p in partitions {
            let stats = region_stats(depth, mask, *p.start(), *p.end())?;
            if stats.n() == 0 {
                debug!(
                    "{}",
                    CallError::EmptyPartition {
                        start: *p.start(),
                        end: *p.end()
                    }
                );
                continue;
            }

            if let Some(last) = candidates.last_mut() {
                let distinct = last.stats.n() >= 2
                    && stats.n() >= 2
                    && self.test_two_regions(&last.stats, &stats) <= self.two_region_cutoff;
                if !distinct {
                    last.end = *p.end();
                    last.stats.absorb(&stats);
                    continue;
                }
            }
            candidates.push(Candidate {
                start: *p.start(),
                end: *p.end(),
                stats,
            });
        }
        Ok(candidates)
    }

    /// Call regions deviating from the baseline. Emitted regions are sorted and never overlap.
    pub fn call<Ctg: Contig>(
        &self,
        contig: &Ctg,
        depth: &[f64],
        mask: &[bool],
        partitions: &[Partition],
        baseline: &Baseline,
    ) -> Result<Vec<CalledRegion<Ctg>>> {
        ensure_len("Mask", depth.len(), mask.len())?;
        let candidates = self.candidates(depth, mask, partitions)?;

        let mut called: Vec<CalledRegion<Ctg>> = Vec::new();
        for candidate in candidates {
            let deviation = (candidate.stats.mean() - baseline.mean()).abs();
            if deviation < self.min_deviation * baseline.mean() {
                continue;
            }

            let lo = called.last().map_or(0, |x| *x.end() + 1);
            let start = candidate.start.max(lo);
            if start > candidate.end {
                continue;
            }
            let bounds = (lo, depth.len() - 1);
            let adjustment =
                match self.adjust_to_e_value(baseline, depth, mask, start, candidate.end, bounds) {
                    Ok(adjustment) => adjustment,
                    Err(err) => match err.downcast_ref::<CallError>() {
                        Some(CallError::EmptyPartition { .. }) => {
                            debug!("{err}");
                            continue;
                        }
                        _ => return Err(err),
                    },
                };
            if !adjustment.moved {
                debug!(
                    "Region [{start}, {}] kept at its original extent, E-value {:e}",
                    candidate.end, adjustment.e_value
                );
            }
            if !(adjustment.e_value < self.region_cutoff) {
                continue;
            }

            let stats = region_stats(depth, mask, adjustment.start, adjustment.end)?;
            let mean = stats.mean();
            let class = if mean > *baseline.mean() {
                CnvClass::Gain
            } else {
                CnvClass::Loss
            };
            let gaussian =
                self.gaussian_e_value(baseline, depth, mask, adjustment.start, adjustment.end)?;

            called.push(CalledRegion::new(
                contig.clone(),
                adjustment.start,
                adjustment.end,
                stats.n(),
                mean,
                adjustment.e_value,
                gaussian,
                class,
                copy_number(mean, *baseline.mean()),
            ));
        }
        Ok(called)
    }
}

/// Copy number relative to a diploid normal state
pub fn copy_number(depth: f64, normal_mean: f64) -> f64 {
    if normal_mean > 0.0 {
        2.0 * depth / normal_mean
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(cache: &NumericCache) -> RegionCaller<'_> {
        RegionCaller::new(cache, &Config::default())
    }

    fn noise(n: usize) -> Vec<f64> {
        // Deterministic zero-mean pattern with unit-ish spread
        (0..n)
            .map(|x| [-1.5, 0.5, 1.0, -0.5, 1.5, -1.0][x % 6])
            .collect()
    }

    #[test]
    fn test_e_value() {
        let cache = NumericCache::with_capacity(100, 100, 100);
        let caller = caller(&cache);
        let baseline = Baseline::new(50.0, 5.0);

        let mut stats = RunningStats::new();
        stats.add(100.0);
        assert_eq!(caller.e_value(&baseline, &stats), f64::INFINITY);

        for x in noise(20) {
            stats.add(100.0 + x);
        }
        let high = caller.e_value(&baseline, &stats);
        assert!(high < 1e-10);

        let mut stats = RunningStats::new();
        for x in noise(20) {
            stats.add(50.0 + 5.0 * x);
        }
        assert!(caller.e_value(&baseline, &stats) > 1e3);

        // Zero variance falls back to unit sigma
        let mut flat = RunningStats::new();
        for _ in 0..10 {
            flat.add(50.0);
        }
        let e = caller.e_value(&baseline, &flat);
        assert!((e - 0.5 * GENOME_SIZE_NORMAL / 100.0 / 10.0).abs() / e < 1e-9);
    }

    #[test]
    fn test_regions() {
        let cache = NumericCache::with_capacity(100, 100, 100);
        let caller = caller(&cache);
        let baseline = Baseline::new(50.0, 5.0);

        let mut depth = noise(60).into_iter().map(|x| 50.0 + x).collect::<Vec<_>>();
        for x in &mut depth[20..40] {
            *x += 50.0;
        }
        let mask = vec![false; depth.len()];

        assert!(caller.test_region(&baseline, &depth, &mask, 20, 39).unwrap());
        assert!(!caller.test_region(&baseline, &depth, &mask, 0, 19).unwrap());
        assert!(caller.get_e_value(&baseline, &depth, &mask, 20, 60).is_err());

        let gaussian = caller.gaussian_e_value(&baseline, &depth, &mask, 20, 39).unwrap();
        assert!(gaussian < 1e-100);
        let gaussian = caller.gaussian_e_value(&baseline, &depth, &mask, 0, 19).unwrap();
        assert!(gaussian > 1.0);

        let mut excluded = mask.clone();
        excluded[5..10].fill(true);
        let err = caller
            .get_e_value(&baseline, &depth, &excluded, 5, 9)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CallError>(),
            Some(&CallError::EmptyPartition { start: 5, end: 9 })
        );
    }

    #[test]
    fn test_two_regions() {
        let cache = NumericCache::with_capacity(100, 100, 100);
        let caller = caller(&cache);

        let (mut a, mut b, mut c) = (RunningStats::new(), RunningStats::new(), RunningStats::new());
        for x in noise(30) {
            a.add(50.0 + x);
            b.add(50.5 + x);
            c.add(100.0 + x);
        }
        assert!(caller.test_two_regions(&a, &c) < 1e-10);
        assert!(caller.test_two_regions(&a, &b) > CUTOFF);
        assert_eq!(caller.test_two_regions(&a, &RunningStats::new()), 1.0);

        let (mut flat1, mut flat2) = (RunningStats::new(), RunningStats::new());
        for _ in 0..3 {
            flat1.add(1.0);
            flat2.add(2.0);
        }
        assert_eq!(caller.test_two_regions(&flat1, &flat1), 1.0);
        assert_eq!(caller.test_two_regions(&flat1, &flat2), 0.0);
    }

    const CUTOFF: f64 = crate::config::CUTOFF_TWO_REGIONS;

    #[test]
    fn test_adjust_to_e_value() {
        let cache = NumericCache::with_capacity(100, 100, 100);
        let caller = caller(&cache);
        let baseline = Baseline::new(50.0, 5.0);

        let mut depth = noise(80).into_iter().map(|x| 50.0 + x).collect::<Vec<_>>();
        for x in &mut depth[30..50] {
            *x += 50.0;
        }
        let mut mask = vec![false; depth.len()];
        mask[45] = true;

        // Too wide on the left, too narrow on the right
        let adjustment = caller
            .adjust_to_e_value(&baseline, &depth, &mask, 26, 44, (0, 79))
            .unwrap();
        assert!(adjustment.moved());
        assert!(adjustment.e_value() < adjustment.initial_e_value());
        assert_eq!(*adjustment.start(), 30);
        assert_eq!(*adjustment.end(), 49);

        // Bounds are respected
        let adjustment = caller
            .adjust_to_e_value(&baseline, &depth, &mask, 30, 40, (0, 42))
            .unwrap();
        assert!(*adjustment.end() <= 42);

        // Already optimal
        let adjustment = caller
            .adjust_to_e_value(&baseline, &depth, &mask, 30, 49, (0, 79))
            .unwrap();
        assert!(!adjustment.moved());
        assert_eq!(adjustment.e_value(), adjustment.initial_e_value());
        assert_eq!((*adjustment.start(), *adjustment.end()), (30, 49));
    }

    #[test]
    fn test_call() {
        let cache = NumericCache::with_capacity(100, 100, 100);
        let caller = caller(&cache);
        let baseline = Baseline::new(50.0, 5.0);

        let mut depth = noise(100).into_iter().map(|x| 50.0 + x).collect::<Vec<_>>();
        for x in &mut depth[20..40] {
            *x = 100.0 + (*x - 50.0);
        }
        for x in &mut depth[70..85] {
            *x = 25.0 + (*x - 50.0);
        }
        let mask = vec![false; depth.len()];
        let partitions = vec![
            Partition::new(0, 17, 50.0, 18),
            Partition::new(18, 19, 50.0, 2),
            Partition::new(20, 39, 100.0, 20),
            Partition::new(40, 69, 50.0, 30),
            Partition::new(70, 84, 25.0, 15),
            Partition::new(85, 99, 50.0, 15),
        ];

        let called = caller
            .call(&"chr1", &depth, &mask, &partitions, &baseline)
            .unwrap();
        assert_eq!(called.len(), 2);

        assert_eq!(*called[0].class(), CnvClass::Gain);
        assert_eq!((*called[0].start(), *called[0].end()), (20, 39));
        assert!((called[0].copy_number() - 4.0).abs() < 0.1);
        assert!(*called[0].e_value() < CUTOFF_REGION);

        assert_eq!(*called[1].class(), CnvClass::Loss);
        assert_eq!((*called[1].start(), *called[1].end()), (70, 84));
        assert!((called[1].copy_number() - 1.0).abs() < 0.1);
        assert!(*called[1].gaussian_e_value() < CUTOFF_REGION);
    }

    const CUTOFF_REGION: f64 = crate::config::CUTOFF_REGION;
}
