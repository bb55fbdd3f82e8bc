use derive_getters::Getters;
use derive_more::Constructor;
use eyre::Result;

use crate::error::{ensure_len, CallError};
use crate::histogram::ModeFit;

/// Expected depth of the normal-ploidy state and its spread
#[derive(Clone, Copy, PartialEq, Debug, Constructor, Getters)]
pub struct Baseline {
    mean: f64,
    sigma: f64,
}

impl From<&ModeFit> for Baseline {
    fn from(fit: &ModeFit) -> Self {
        Self {
            mean: *fit.mean(),
            sigma: *fit.sigma(),
        }
    }
}

/// Streaming mean/variance over a set of bins. Values can be removed again, which makes
/// boundary moves O(1).
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct RunningStats {
    n: usize,
    sum: f64,
    sum2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
        self.sum2 += value * value;
    }

    #[inline]
    pub fn remove(&mut self, value: f64) {
        debug_assert!(self.n > 0);
        self.n -= 1;
        self.sum -= value;
        self.sum2 -= value * value;
    }

    pub fn absorb(&mut self, other: &Self) {
        self.n += other.n;
        self.sum += other.sum;
        self.sum2 += other.sum2;
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum / self.n as f64
    }

    /// Unbiased sample variance, zero for less than two values
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        ((self.sum2 - self.sum * self.sum / n) / (n - 1.0)).max(0.0)
    }
}

/// Statistics of non-excluded bins within [start, end] (inclusive)
pub fn region_stats(depth: &[f64], mask: &[bool], start: usize, end: usize) -> Result<RunningStats> {
    ensure_len("Mask", depth.len(), mask.len())?;
    if start > end || end >= depth.len() {
        return Err(CallError::EmptyPartition { start, end }.into());
    }

    let mut stats = RunningStats::new();
    for (value, excluded) in depth[start..=end].iter().zip(&mask[start..=end]) {
        if !excluded {
            stats.add(*value);
        }
    }
    Ok(stats)
}

/// Average and sample variance of non-excluded bins within [start, end] (inclusive).
/// Returns (average, variance, number of bins).
pub fn get_average_variance(
    depth: &[f64],
    mask: &[bool],
    start: usize,
    end: usize,
) -> Result<(f64, f64, usize)> {
    let stats = region_stats(depth, mask, start, end)?;
    if stats.n() == 0 {
        return Err(CallError::EmptyPartition { start, end }.into());
    }
    Ok((stats.mean(), stats.variance(), stats.n()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::new();
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.variance(), 0.0);

        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.add(x);
        }
        assert_eq!(stats.n(), 8);
        assert_eq!(stats.mean(), 5.0);
        assert!((stats.variance() - 32.0 / 7.0).abs() < 1e-12);

        stats.remove(9.0);
        stats.remove(2.0);
        assert_eq!(stats.n(), 6);
        assert!((stats.mean() - 29.0 / 6.0).abs() < 1e-12);

        let mut other = RunningStats::new();
        other.add(9.0);
        other.add(2.0);
        stats.absorb(&other);
        assert_eq!(stats.mean(), 5.0);
    }

    #[test]
    fn test_get_average_variance() {
        let depth = [1.0, 2.0, 100.0, 3.0, 4.0];
        let mask = [false, false, true, false, false];

        let (average, variance, n) = get_average_variance(&depth, &mask, 0, 4).unwrap();
        assert_eq!(n, 4);
        assert_eq!(average, 2.5);
        assert!((variance - 5.0 / 3.0).abs() < 1e-12);

        let err = get_average_variance(&depth, &mask, 2, 2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CallError>(),
            Some(&CallError::EmptyPartition { start: 2, end: 2 })
        );
        assert!(get_average_variance(&depth, &mask, 3, 5).is_err());
        assert!(get_average_variance(&depth, &mask[..4], 0, 1).is_err());
    }
}
