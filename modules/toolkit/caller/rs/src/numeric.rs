use std::borrow::Cow;
use std::sync::OnceLock;

use statrs::distribution::{ContinuousCDF, StudentsT};

pub const N_SQRT: usize = 100_000;
pub const N_FUNC: usize = 100_000;
pub const N_INV: usize = 10_000;

/// Tail probability of the mean of `samples` values (Student's t with `samples - 1` degrees of
/// freedom).
#[derive(Clone, Debug)]
pub struct StatFunction {
    samples: usize,
    dist: StudentsT,
}

impl StatFunction {
    /// `None` when the sample is too small to estimate its own variance.
    pub fn new(samples: usize) -> Option<Self> {
        if samples < 2 {
            return None;
        }
        let dist = StudentsT::new(0.0, 1.0, (samples - 1) as f64).ok()?;
        Some(Self { samples, dist })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn freedom(&self) -> f64 {
        (self.samples - 1) as f64
    }

    /// One-sided probability of a statistic at least as extreme as `t`.
    /// Always evaluated on the lower tail to keep precision for large |t|.
    pub fn tail(&self, t: f64) -> f64 {
        if t.is_nan() {
            return 1.0;
        }
        self.dist.cdf(-t.abs())
    }
}

/// Precomputed square roots and inverses of small integers together with lazily fitted
/// statistical functions. Shared by reference between all workers.
#[derive(Debug)]
pub struct NumericCache {
    sqrt: Vec<f64>,
    inv: Vec<f64>,
    functions: Box<[OnceLock<Option<StatFunction>>]>,
}

impl Default for NumericCache {
    fn default() -> Self {
        Self::with_capacity(N_SQRT, N_INV, N_FUNC)
    }
}

impl NumericCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(nsqrt: usize, ninv: usize, nfunc: usize) -> Self {
        let sqrt = (0..nsqrt).map(|x| (x as f64).sqrt()).collect();
        let inv = (0..ninv).map(|x| 1.0 / x as f64).collect();
        let functions = (0..nfunc).map(|_| OnceLock::new()).collect();
        Self {
            sqrt,
            inv,
            functions,
        }
    }

    #[inline]
    pub fn sqrt(&self, n: usize) -> f64 {
        match self.sqrt.get(n) {
            Some(x) => *x,
            None => (n as f64).sqrt(),
        }
    }

    /// 1 / n, infinite for n == 0
    #[inline]
    pub fn inverse(&self, n: usize) -> f64 {
        match self.inv.get(n) {
            Some(x) => *x,
            None => 1.0 / n as f64,
        }
    }

    /// Fitted function for an n-sample mean. Functions within the table capacity are built at most
    /// once and reused afterwards, the rest are built on demand.
    pub fn stat_function(&self, n: usize) -> Option<Cow<'_, StatFunction>> {
        match self.functions.get(n) {
            Some(slot) => slot
                .get_or_init(|| StatFunction::new(n))
                .as_ref()
                .map(Cow::Borrowed),
            None => StatFunction::new(n).map(Cow::Owned),
        }
    }

    /// Number of table slots populated so far
    pub fn constructed(&self) -> usize {
        self.functions.iter().filter(|x| x.get().is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        let cache = NumericCache::with_capacity(100, 10, 10);
        assert_eq!(cache.sqrt(49), 7.0);
        assert_eq!(cache.sqrt(10_000), 100.0);
        assert_eq!(cache.inverse(4), 0.25);
        assert_eq!(cache.inverse(20), 0.05);
        assert!(cache.inverse(0).is_infinite());
    }

    #[test]
    fn test_stat_function() {
        let cache = NumericCache::with_capacity(10, 10, 100);
        assert!(cache.stat_function(0).is_none());
        assert!(cache.stat_function(1).is_none());

        let func = cache.stat_function(10).unwrap();
        assert_eq!(func.samples(), 10);
        assert_eq!(func.freedom(), 9.0);
        assert!((func.tail(0.0) - 0.5).abs() < 1e-12);
        assert_eq!(func.tail(2.0), func.tail(-2.0));
        // t(9) one-sided 97.5% quantile
        assert!((func.tail(2.262) - 0.025).abs() < 1e-3);
        assert_eq!(func.tail(f64::NAN), 1.0);

        // Out of table capacity
        let func = cache.stat_function(1000).unwrap();
        assert!(matches!(func, Cow::Owned(_)));
        assert!(func.tail(50.0) < 1e-100);
    }

    #[test]
    fn test_single_construction() {
        let cache = NumericCache::with_capacity(10, 10, 100);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for n in 2..12 {
                        assert!(cache.stat_function(n).is_some());
                    }
                });
            }
        });
        assert_eq!(cache.constructed(), 10);
        assert!(matches!(cache.stat_function(5), Some(Cow::Borrowed(_))));
    }
}
