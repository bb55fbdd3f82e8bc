use eyre::Result;
use log::{debug, warn};

use crate::error::ensure_len;
use crate::histogram::{GcHistogram, GC_BUCKETS};
use crate::numeric::NumericCache;

/// Upper edge of depth histograms relative to the mean depth of a sample
pub const DEPTH_RANGE_FACTOR: f64 = 4.0;

/// Upper edge for depth histograms: a multiple of the mean over finite, non-negative values.
/// `None` when nothing usable was observed.
pub fn estimate_depth_maximum<'a>(depths: impl IntoIterator<Item = &'a f64>) -> Option<f64> {
    let (mut n, mut sum) = (0usize, 0.0);
    for x in depths {
        if x.is_finite() && *x >= 0.0 {
            n += 1;
            sum += *x;
        }
    }
    if n == 0 || sum <= 0.0 {
        return None;
    }
    Some(DEPTH_RANGE_FACTOR * sum / n as f64)
}

/// Normalizes depth by the mean depth of bins with the same GC content. Buckets are keyed by a
/// percentage, so the same factors work for AT content.
#[derive(Clone, Copy, Debug)]
pub struct GcCorrector<'a> {
    cache: &'a NumericCache,
    min_entries: f64,
    min_bucket_entries: f64,
}

impl<'a> GcCorrector<'a> {
    pub fn new(cache: &'a NumericCache, min_entries: f64, min_bucket_entries: f64) -> Self {
        Self {
            cache,
            min_entries,
            min_bucket_entries,
        }
    }

    /// Per-bucket multiplicative factors `global_mean / bucket_mean`. Buckets with too few
    /// entries keep a factor of 1. `None` when the histogram as a whole is too sparse.
    pub fn factors(&self, his: &GcHistogram) -> Result<Option<Vec<f64>>> {
        let entries = his.entries();
        if entries < self.min_entries {
            warn!(
                "Bucket histogram holds {entries} entries (required {}), the correction is skipped",
                self.min_entries
            );
            return Ok(None);
        }

        let marginal = his.marginal()?;
        let global = match marginal.mean_sigma() {
            Some(fit) if *fit.mean() > 0.0 => *fit.mean(),
            _ => match marginal.mean() {
                Some(mean) if mean > 0.0 => mean,
                _ => {
                    warn!("Bucket histogram has no positive depth, the correction is skipped");
                    return Ok(None);
                }
            },
        };

        let factors = his
            .buckets()
            .iter()
            .map(|bucket| match bucket.mean() {
                Some(mean) if *bucket.entries() >= self.min_bucket_entries && mean > 0.0 => {
                    global / mean
                }
                _ => 1.0,
            })
            .collect::<Vec<_>>();
        debug!(
            "GC correction: global depth {global:.3}, {} of {} buckets corrected",
            factors.iter().filter(|x| **x != 1.0).count(),
            factors.len()
        );
        Ok(Some(factors))
    }

    /// Direct correction, in place. Returns `false` (depth untouched) when the histogram is too
    /// sparse to be trusted.
    pub fn correct(&self, depth: &mut [f64], gc: &[f64], his: &GcHistogram) -> Result<bool> {
        ensure_len("GC", depth.len(), gc.len())?;
        match self.factors(his)? {
            Some(factors) => self.apply(depth, gc, &factors).map(|_| true),
            None => Ok(false),
        }
    }

    /// Fragment-aware correction: the factor applied to a bin is the average factor over the
    /// `window` bins on each side of it, i.e. over the GC content seen by fragments covering it.
    pub fn correct_by_fragment(
        &self,
        depth: &mut [f64],
        gc: &[f64],
        his: &GcHistogram,
        window: usize,
    ) -> Result<bool> {
        ensure_len("GC", depth.len(), gc.len())?;
        match self.factors(his)? {
            Some(factors) => self
                .apply_by_fragment(depth, gc, &factors, window)
                .map(|_| true),
            None => Ok(false),
        }
    }

    /// Multiply each bin by the factor of its GC bucket. Bins with unknown GC are left as is.
    pub fn apply(&self, depth: &mut [f64], gc: &[f64], factors: &[f64]) -> Result<()> {
        ensure_len("GC", depth.len(), gc.len())?;
        ensure_len("GC factors", GC_BUCKETS, factors.len())?;
        for (x, gc) in depth.iter_mut().zip(gc) {
            if let Some(bucket) = GcHistogram::bucket_of(*gc) {
                *x *= factors[bucket];
            }
        }
        Ok(())
    }

    pub fn apply_by_fragment(
        &self,
        depth: &mut [f64],
        gc: &[f64],
        factors: &[f64],
        window: usize,
    ) -> Result<()> {
        ensure_len("GC", depth.len(), gc.len())?;
        ensure_len("GC factors", GC_BUCKETS, factors.len())?;

        // Prefix sums over bins with a known GC content
        let mut sums = Vec::with_capacity(gc.len() + 1);
        let mut counts = Vec::with_capacity(gc.len() + 1);
        sums.push(0.0);
        counts.push(0usize);
        for gc in gc {
            let (sum, cnt) = (sums[sums.len() - 1], counts[counts.len() - 1]);
            match GcHistogram::bucket_of(*gc) {
                Some(bucket) => {
                    sums.push(sum + factors[bucket]);
                    counts.push(cnt + 1);
                }
                None => {
                    sums.push(sum);
                    counts.push(cnt);
                }
            }
        }

        for (ind, x) in depth.iter_mut().enumerate() {
            let start = ind.saturating_sub(window);
            let end = (ind + window + 1).min(gc.len());
            let n = counts[end] - counts[start];
            if n > 0 {
                *x *= (sums[end] - sums[start]) * self.cache.inverse(n);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram() -> GcHistogram {
        let mut his = GcHistogram::new(200, -0.5, 199.5).unwrap();
        for i in 0..5000 {
            his.fill(45.0 + (i % 11) as f64, 50.0);
        }
        for _ in 0..200 {
            his.fill(25.0, 40.0);
        }
        for _ in 0..10 {
            his.fill(10.0, 70.0);
        }
        his
    }

    #[test]
    fn test_estimate_depth_maximum() {
        assert_eq!(estimate_depth_maximum(&[10.0, 30.0, f64::NAN, -1.0]), Some(80.0));
        assert_eq!(estimate_depth_maximum(&[] as &[f64]), None);
        assert_eq!(estimate_depth_maximum(&[0.0, 0.0]), None);
    }

    #[test]
    fn test_factors() {
        let cache = NumericCache::with_capacity(10, 10, 10);
        let his = histogram();

        let factors = GcCorrector::new(&cache, 1000.0, 100.0)
            .factors(&his)
            .unwrap()
            .unwrap();
        assert_eq!(factors.len(), 101);
        assert!((factors[40] - 2.0).abs() < 0.02);
        assert!((factors[50] - 1.0).abs() < 0.01);
        // Too few entries
        assert_eq!(factors[70], 1.0);
        assert_eq!(factors[0], 1.0);

        let sparse = GcCorrector::new(&cache, 1e6, 100.0);
        assert!(sparse.factors(&his).unwrap().is_none());
    }

    #[test]
    fn test_correct() {
        let cache = NumericCache::with_capacity(10, 10, 10);
        let his = histogram();
        let corrector = GcCorrector::new(&cache, 1000.0, 100.0);

        let mut depth = vec![25.0, 50.0, 10.0, 5.0];
        let gc = vec![40.0, 50.0, 70.0, f64::NAN];
        assert!(corrector.correct(&mut depth, &gc, &his).unwrap());
        assert!((depth[0] - 50.0).abs() < 0.5);
        assert!((depth[1] - 50.0).abs() < 0.5);
        assert_eq!(&depth[2..], &[10.0, 5.0]);

        assert!(corrector.correct(&mut depth, &gc[..3], &his).is_err());

        let mut depth = vec![25.0, 50.0];
        let sparse = GcCorrector::new(&cache, 1e6, 100.0);
        assert!(!sparse.correct(&mut depth, &gc[..2], &his).unwrap());
        assert_eq!(depth, vec![25.0, 50.0]);
    }

    #[test]
    fn test_correct_by_fragment() {
        let cache = NumericCache::with_capacity(10, 10, 10);
        let his = histogram();
        let corrector = GcCorrector::new(&cache, 1000.0, 100.0);
        let factors = corrector.factors(&his).unwrap().unwrap();

        let gc = vec![40.0, 40.0, 50.0, 50.0, 50.0, 40.0];
        let mut depth = vec![10.0; gc.len()];
        assert!(corrector
            .correct_by_fragment(&mut depth, &gc, &his, 1)
            .unwrap());

        let expected = |window: &[usize]| {
            let total: f64 = window.iter().map(|x| factors[*x]).sum();
            10.0 * total / window.len() as f64
        };
        let expected = [
            expected(&[40, 40]),
            expected(&[40, 40, 50]),
            expected(&[40, 50, 50]),
            expected(&[50, 50, 50]),
            expected(&[50, 50, 40]),
            expected(&[50, 40]),
        ];
        for (x, y) in depth.iter().zip(expected) {
            assert!((x - y).abs() < 1e-9, "{x} != {y}");
        }

        // Zero-width window is the direct correction
        let mut direct = vec![10.0; gc.len()];
        let mut windowed = direct.clone();
        corrector.correct(&mut direct, &gc, &his).unwrap();
        corrector
            .correct_by_fragment(&mut windowed, &gc, &his, 0)
            .unwrap();
        for (x, y) in direct.iter().zip(&windowed) {
            assert!((x - y).abs() < 1e-9);
        }
    }
}
