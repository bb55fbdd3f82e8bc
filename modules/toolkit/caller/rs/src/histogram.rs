use derive_getters::{Dissolve, Getters};
use eyre::{ensure, eyre, Result};
use itertools::Itertools;
use statrs::function::erf::erfc;

/// Number of integer GC buckets, 0% through 100%
pub const GC_BUCKETS: usize = 101;

// Mode fits use a +-3 sigma window around the current estimate
const WINDOW_SIGMAS: f64 = 3.0;
const MAX_ITERATIONS: usize = 100;

#[inline]
fn pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

#[inline]
pub(crate) fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Location and spread of a single Gaussian mode of a histogram
#[derive(Clone, Copy, PartialEq, Debug, Getters, Dissolve)]
pub struct ModeFit {
    mean: f64,
    sigma: f64,
    /// Estimated number of entries in the mode, including its truncated tails
    weight: f64,
}

impl ModeFit {
    pub fn new(mean: f64, sigma: f64, weight: f64) -> Self {
        Self {
            mean,
            sigma,
            weight,
        }
    }

    /// Expected number of mode entries within [low, high)
    pub fn expected(&self, low: f64, high: f64) -> f64 {
        if self.sigma <= 0.0 {
            return if (low..high).contains(&self.mean) {
                self.weight
            } else {
                0.0
            };
        }
        let a = (low - self.mean) / self.sigma;
        let b = (high - self.mean) / self.sigma;
        self.weight * (normal_cdf(b) - normal_cdf(a))
    }
}

/// Fixed-width 1D histogram. Out-of-range values are accumulated in under/overflow counters,
/// all filled values take part in the exact mean.
#[derive(Clone, PartialEq, Debug, Getters, Dissolve)]
pub struct Histogram {
    low: f64,
    high: f64,
    width: f64,
    counts: Vec<f64>,
    underflow: f64,
    overflow: f64,
    entries: f64,
    sum: f64,
}

impl Histogram {
    pub fn new(bins: usize, low: f64, high: f64) -> Result<Self> {
        ensure!(bins > 0, "Histogram must have at least one bin");
        ensure!(
            low.is_finite() && high.is_finite() && low < high,
            "Invalid histogram range [{low}, {high})"
        );
        Ok(Self {
            low,
            high,
            width: (high - low) / bins as f64,
            counts: vec![0.0; bins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0.0,
            sum: 0.0,
        })
    }

    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    pub fn bin_of(&self, x: f64) -> Option<usize> {
        if !(x >= self.low && x < self.high) {
            return None;
        }
        let bin = ((x - self.low) / self.width) as usize;
        Some(bin.min(self.counts.len() - 1))
    }

    pub fn center(&self, bin: usize) -> f64 {
        self.low + (bin as f64 + 0.5) * self.width
    }

    pub fn edge(&self, bin: usize) -> f64 {
        self.low + bin as f64 * self.width
    }

    pub fn fill(&mut self, x: f64) {
        self.fill_weighted(x, 1.0)
    }

    pub fn fill_weighted(&mut self, x: f64, weight: f64) {
        if x.is_nan() {
            return;
        }
        match self.bin_of(x) {
            Some(bin) => self.counts[bin] += weight,
            None if x < self.low => self.underflow += weight,
            None => self.overflow += weight,
        }
        self.entries += weight;
        self.sum += weight * x;
    }

    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if self.counts.len() != other.counts.len() || self.low != other.low || self.high != other.high
        {
            return Err(eyre!("Can't merge histograms with different binning"));
        }
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += *b;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.entries += other.entries;
        self.sum += other.sum;
        Ok(())
    }

    /// Exact mean of all filled values
    pub fn mean(&self) -> Option<f64> {
        if self.entries > 0.0 {
            Some(self.sum / self.entries)
        } else {
            None
        }
    }

    /// First bin with the highest count, `None` for an empty histogram
    pub fn peak(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (bin, cnt) in self.counts.iter().enumerate() {
            if *cnt > best.map_or(0.0, |x| x.1) {
                best = Some((bin, *cnt));
            }
        }
        best.map(|x| x.0)
    }

    // Sum of in-range values, approximated by bin centers
    fn binned_sum(&self) -> f64 {
        self.counts
            .iter()
            .enumerate()
            .map(|(bin, cnt)| cnt * self.center(bin))
            .sum()
    }

    /// Remove the expected contribution of a fitted mode. Counts never go below zero, under- and
    /// overflow entries are kept together with their exact sum.
    pub fn subtract(&mut self, mode: &ModeFit) {
        let outside = self.sum - self.binned_sum();
        for bin in 0..self.counts.len() {
            let expected = mode.expected(self.edge(bin), self.edge(bin + 1));
            self.counts[bin] = (self.counts[bin] - expected).max(0.0);
        }
        self.entries = self.counts.iter().sum::<f64>() + self.underflow + self.overflow;
        self.sum = self.binned_sum() + outside;
    }

    /// Box-smoothed counts with the given half-width (in bins)
    pub fn smoothed(&self, halfwidth: usize) -> Vec<f64> {
        let n = self.counts.len();
        let mut prefix = Vec::with_capacity(n + 1);
        prefix.push(0.0);
        for cnt in &self.counts {
            prefix.push(prefix[prefix.len() - 1] + cnt);
        }
        (0..n)
            .map(|bin| {
                let start = bin.saturating_sub(halfwidth);
                let end = (bin + halfwidth + 1).min(n);
                (prefix[end] - prefix[start]) / (end - start) as f64
            })
            .collect()
    }

    // Total, mean and variance of the counts in a bin range
    fn moments(&self, range: std::ops::RangeInclusive<usize>) -> (f64, f64, f64) {
        let (mut n, mut s1, mut s2) = (0.0, 0.0, 0.0);
        for bin in range {
            let (cnt, x) = (self.counts[bin], self.center(bin));
            n += cnt;
            s1 += cnt * x;
            s2 += cnt * x * x;
        }
        if n <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let mean = s1 / n;
        (n, mean, (s2 / n - mean * mean).max(0.0))
    }

    /// Typical distance (in bins) between populated bins, weighted by their counts. Integer depths
    /// in bins narrower than 1 populate every few bins only.
    pub fn granularity(&self) -> usize {
        let gaps = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, cnt)| **cnt > 0.0)
            .tuple_windows()
            .map(|((a, ca), (b, cb))| (b - a, ca + cb))
            .sorted_by_key(|x| x.0)
            .collect::<Vec<_>>();

        let half = gaps.iter().map(|x| x.1).sum::<f64>() / 2.0;
        let mut cumulative = 0.0;
        for (gap, weight) in gaps {
            cumulative += weight;
            if cumulative >= half {
                return gap;
            }
        }
        1
    }

    /// Smoothing half-width (in bins) for locating the mode in sparse histograms. Never narrower
    /// than the spacing of populated bins.
    pub fn smoothing(&self) -> usize {
        let (_, _, variance) = self.moments(0..=self.counts.len() - 1);
        ((0.1 * variance.sqrt() / self.width).round() as usize)
            .max(self.granularity())
            .max(1)
    }

    /// Mean and sigma of the dominant mode.
    ///
    /// The peak of the smoothed histogram gives the starting point, the spread of the counts
    /// around it the starting sigma. The estimate is then refined on a symmetric window around
    /// the current mean, correcting the window moments for truncation of the Gaussian tails and
    /// for the spacing of the data. A mode narrower than the data spacing is a lone spike of
    /// lattice data, the fit is repeated with wider smoothing then.
    pub fn mean_sigma(&self) -> Option<ModeFit> {
        let spacing = self.granularity() as f64 * self.width;
        let mut halfwidth = self.smoothing();
        let fit = self.fit_mode(halfwidth, spacing)?;
        while fit.sigma < spacing && 2 * halfwidth < self.counts.len() {
            halfwidth *= 2;
            if let Some(wider) = self
                .fit_mode(halfwidth, spacing)
                .filter(|x| x.sigma >= spacing)
            {
                return Some(wider);
            }
        }
        Some(fit)
    }

    fn fit_mode(&self, halfwidth: usize, spacing: f64) -> Option<ModeFit> {
        let nbins = self.counts.len();
        let smoothed = self.smoothed(halfwidth);
        let (peak, top) = smoothed
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, top)| (bin, *top))?;
        if top <= 0.0 {
            return None;
        }

        // Half-maximum width bounds the window for the starting sigma
        let half = top / 2.0;
        let mut left = peak;
        while left > 0 && smoothed[left - 1] > half {
            left -= 1;
        }
        let mut right = peak;
        while right + 1 < nbins && smoothed[right + 1] > half {
            right += 1;
        }
        let fwhm = self.edge(right + 1) - self.edge(left);
        let reach = (fwhm / (2.0 * (2.0 * 2f64.ln()).sqrt())).max(spacing);

        let mut mean = self.center(peak);
        let lo = self.bin_of((mean - WINDOW_SIGMAS * reach).max(self.low))?;
        let hi = self.bin_of((mean + WINDOW_SIGMAS * reach).min(self.high - self.width * 0.5))?;
        let (_, _, variance) = self.moments(lo..=hi);
        let mut sigma = variance.sqrt().max(spacing * 0.5);

        let floor = self.width * 1e-3;
        let sheppard = spacing * spacing / 12.0;
        let mut weight = 0.0;
        for _ in 0..MAX_ITERATIONS {
            let lo = self.bin_of((mean - WINDOW_SIGMAS * sigma).max(self.low));
            let hi = self.bin_of((mean + WINDOW_SIGMAS * sigma).min(self.high - floor));
            let (lo, hi) = match (lo, hi) {
                (Some(lo), Some(hi)) if lo <= hi => (lo, hi),
                _ => break,
            };

            let (n, m, v) = self.moments(lo..=hi);
            if n <= 0.0 {
                return None;
            }

            let a = (self.edge(lo) - mean) / sigma;
            let b = (self.edge(hi + 1) - mean) / sigma;
            let z = normal_cdf(b) - normal_cdf(a);
            if z < 1e-6 {
                break;
            }
            let r1 = (pdf(a) - pdf(b)) / z;
            let r2 = (a * pdf(a) - b * pdf(b)) / z;
            let factor = (1.0 + r2 - r1 * r1).max(1e-3);

            let next_mean = m - sigma * r1;
            let next_sigma = ((v - sheppard).max(0.0) / factor).sqrt().max(floor);
            weight = n / z;

            let converged = (next_mean - mean).abs() <= 1e-9 * mean.abs().max(1.0)
                && (next_sigma - sigma).abs() <= 1e-9 * sigma.max(1.0);
            mean = next_mean;
            sigma = next_sigma;
            if converged {
                break;
            }
        }

        if weight > 0.0 && mean.is_finite() && sigma.is_finite() {
            Some(ModeFit::new(mean, sigma, weight))
        } else {
            None
        }
    }
}

/// Depth-vs-GC distribution: one depth histogram per integer GC percentage
#[derive(Clone, PartialEq, Debug, Getters, Dissolve)]
pub struct GcHistogram {
    buckets: Vec<Histogram>,
}

impl GcHistogram {
    pub fn new(bins: usize, low: f64, high: f64) -> Result<Self> {
        let template = Histogram::new(bins, low, high)?;
        Ok(Self {
            buckets: vec![template; GC_BUCKETS],
        })
    }

    /// GC bucket of a percentage, `None` for NaN
    pub fn bucket_of(gc: f64) -> Option<usize> {
        if gc.is_nan() {
            return None;
        }
        Some(gc.round().clamp(0.0, (GC_BUCKETS - 1) as f64) as usize)
    }

    pub fn fill(&mut self, depth: f64, gc: f64) {
        if let Some(bucket) = Self::bucket_of(gc) {
            self.buckets[bucket].fill(depth);
        }
    }

    pub fn merge(&mut self, other: &Self) -> Result<()> {
        for (a, b) in self.buckets.iter_mut().zip(&other.buckets) {
            a.merge(b)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> f64 {
        self.buckets.iter().map(|x| *x.entries()).sum()
    }

    pub fn bucket(&self, bucket: usize) -> Option<&Histogram> {
        self.buckets.get(bucket)
    }

    /// Depth distribution across all GC buckets
    pub fn marginal(&self) -> Result<Histogram> {
        let mut iter = self.buckets.iter();
        let mut result = iter
            .next()
            .cloned()
            .ok_or_else(|| eyre!("GC histogram has no buckets"))?;
        for bucket in iter {
            result.merge(bucket)?;
        }
        Ok(result)
    }
}
