use derive_getters::{Dissolve, Getters};
use eyre::Result;

use crate::config::{MaskPolicy, Passes, PRECISION};
use crate::error::ensure_len;
use crate::numeric::NumericCache;
use crate::stats::Baseline;

/// Smoothed expectation of the depth for every bin
#[derive(Clone, PartialEq, Debug, Default, Getters, Dissolve)]
pub struct LevelSignal {
    level: Vec<f64>,
    /// Inverse variance expected at each bin given its level
    isig: Vec<f64>,
    /// Bins excluded from statistics after the last pass
    mask: Vec<bool>,
}

impl LevelSignal {
    pub fn len(&self) -> usize {
        self.level.len()
    }

    pub fn is_empty(&self) -> bool {
        self.level.is_empty()
    }
}

/// Banded, inverse-variance weighted average of non-excluded neighbours.
///
/// Depth variance is modelled as growing linearly with the level: `sigma^2 * level / mean`,
/// where `(mean, sigma)` is the genome-wide baseline. Each pass produces a new level and a new
/// exclusion mask, the next pass uses both.
#[derive(Clone, Copy, Debug)]
pub struct LevelEstimator<'a> {
    cache: &'a NumericCache,
    band: usize,
    nsigma: f64,
    passes: Passes,
    policy: MaskPolicy,
}

impl<'a> LevelEstimator<'a> {
    pub fn new(
        cache: &'a NumericCache,
        band: usize,
        nsigma: f64,
        passes: Passes,
        policy: MaskPolicy,
    ) -> Self {
        Self {
            cache,
            band,
            nsigma,
            passes,
            policy,
        }
    }

    /// Triangular kernel, indexed by the distance to the central bin
    pub fn kernel(&self) -> Vec<f64> {
        let norm = self.cache.inverse(self.band + 1);
        (0..=self.band)
            .map(|d| (self.band + 1 - d) as f64 * norm)
            .collect()
    }

    /// Expected inverse variance of a bin with the given level
    pub fn inverse_variance(&self, level: f64, baseline: &Baseline) -> f64 {
        let mean = baseline.mean().max(f64::MIN_POSITIVE);
        let floor = (PRECISION * mean).max(1e-3);
        let variance = if *baseline.sigma() > 0.0 {
            baseline.sigma().powi(2)
        } else {
            mean
        };
        mean / (variance * level.max(floor))
    }

    /// Single smoothing pass. Without a prior level all neighbours are weighted by the kernel only.
    pub fn smooth(
        &self,
        depth: &[f64],
        mask: &[bool],
        prior: Option<&[f64]>,
        baseline: &Baseline,
    ) -> Result<Vec<f64>> {
        ensure_len("Mask", depth.len(), mask.len())?;
        let weights = match prior {
            Some(prior) => {
                ensure_len("Prior level", depth.len(), prior.len())?;
                prior
                    .iter()
                    .map(|x| self.inverse_variance(*x, baseline))
                    .collect()
            }
            None => vec![1.0; depth.len()],
        };

        let kernel = self.kernel();
        let mut level = Vec::with_capacity(depth.len());
        for ind in 0..depth.len() {
            let start = ind.saturating_sub(self.band);
            let end = (ind + self.band + 1).min(depth.len());

            let (mut total, mut norm) = (0.0, 0.0);
            for j in start..end {
                if mask[j] {
                    continue;
                }
                let w = kernel[ind.abs_diff(j)] * weights[j];
                total += w * depth[j];
                norm += w;
            }

            if norm > 0.0 {
                level.push(total / norm);
            } else {
                // Isolated bin, nothing to average with
                level.push(depth[ind]);
            }
        }
        Ok(level)
    }

    /// Exclusion mask for a given level: bins deviating by more than `nsigma` expected sigmas,
    /// plus skipped bins when the policy respects them.
    pub fn mask(
        &self,
        depth: &[f64],
        level: &[f64],
        skip: &[bool],
        baseline: &Baseline,
    ) -> Result<Vec<bool>> {
        ensure_len("Level", depth.len(), level.len())?;
        ensure_len("Skip flags", depth.len(), skip.len())?;

        let mask = depth
            .iter()
            .zip(level)
            .zip(skip)
            .map(|((d, l), skip)| {
                let outlier = (d - l).abs() * self.inverse_variance(*l, baseline).sqrt() > self.nsigma;
                match self.policy {
                    MaskPolicy::Strict => outlier,
                    MaskPolicy::SkipAware => outlier || *skip,
                }
            })
            .collect();
        Ok(mask)
    }

    /// (depth, mask) -> (level, mask)
    pub fn pass(
        &self,
        depth: &[f64],
        mask: &[bool],
        skip: &[bool],
        prior: Option<&[f64]>,
        baseline: &Baseline,
    ) -> Result<(Vec<f64>, Vec<bool>)> {
        let level = self.smooth(depth, mask, prior, baseline)?;
        let mask = self.mask(depth, &level, skip, baseline)?;
        Ok((level, mask))
    }

    pub fn estimate(&self, depth: &[f64], skip: &[bool], baseline: &Baseline) -> Result<LevelSignal> {
        ensure_len("Skip flags", depth.len(), skip.len())?;
        let mut mask = match self.policy {
            MaskPolicy::Strict => vec![false; depth.len()],
            MaskPolicy::SkipAware => skip.to_vec(),
        };

        let mut level: Option<Vec<f64>> = None;
        for _ in 0..self.passes.count() {
            let (lvl, msk) = self.pass(depth, &mask, skip, level.as_deref(), baseline)?;
            level = Some(lvl);
            mask = msk;
        }
        let level = level.unwrap_or_else(|| depth.to_vec());

        let isig = level
            .iter()
            .map(|x| self.inverse_variance(*x, baseline))
            .collect();
        Ok(LevelSignal { level, isig, mask })
    }
}

/// Inverse of the mean squared deviation of non-excluded bins from their level.
/// `None` when all bins are excluded.
pub fn residual_precision(depth: &[f64], level: &[f64], mask: &[bool]) -> Result<Option<f64>> {
    ensure_len("Level", depth.len(), level.len())?;
    ensure_len("Mask", depth.len(), mask.len())?;

    let (mut n, mut sum2) = (0usize, 0.0);
    for ((d, l), excluded) in depth.iter().zip(level).zip(mask) {
        if !excluded {
            n += 1;
            sum2 += (d - l).powi(2);
        }
    }
    match n {
        0 => Ok(None),
        _ => Ok(Some(n as f64 / sum2.max(f64::MIN_POSITIVE))),
    }
}
