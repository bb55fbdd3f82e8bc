use derive_getters::{Dissolve, Getters};
use log::warn;

use crate::histogram::{Histogram, ModeFit};

// Residual modes closer than this (in sigmas of the normal mode) are fit leftovers
const MIN_MODE_SEPARATION: f64 = 3.0;

/// Normal-ploidy and CNV-fraction modes of a depth distribution
#[derive(Clone, Copy, PartialEq, Debug, Getters, Dissolve)]
pub struct GenotypeFit {
    normal: ModeFit,
    cnv: Option<ModeFit>,
    /// Depth separating the two modes
    valley: Option<f64>,
    /// Fraction of entries on the CNV side of the valley
    cnv_fraction: f64,
}

impl GenotypeFit {
    /// Copy number of a depth relative to the diploid normal mode
    pub fn copy_number(&self, depth: f64) -> f64 {
        crate::calling::copy_number(depth, *self.normal.mean())
    }

    /// Whether a depth lies on the normal-ploidy side of the valley. Without a CNV mode every
    /// depth does.
    pub fn is_normal(&self, depth: f64) -> bool {
        match (self.cnv, self.valley) {
            (Some(cnv), Some(valley)) if cnv.mean() > self.normal.mean() => depth < valley,
            (Some(_), Some(valley)) => depth > valley,
            _ => true,
        }
    }
}

/// Fits the dominant mode of depth histograms and, when visible, a second CNV mode
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Genotyper {
    min_entries: f64,
}

impl Genotyper {
    pub fn new(min_entries: f64) -> Self {
        Self { min_entries }
    }

    /// Dominant mode, `None` when the histogram is too sparse or has no clear peak
    pub fn fit(&self, his: &Histogram) -> Option<ModeFit> {
        if *his.entries() < self.min_entries {
            warn!(
                "Depth histogram holds {} entries (required {}), the fit is skipped",
                his.entries(),
                self.min_entries
            );
            return None;
        }
        let fit = his.mean_sigma();
        if fit.is_none() {
            warn!("Failed to locate the dominant mode of the depth histogram");
        }
        fit
    }

    /// Dominant mode plus the mode of what remains after subtracting it
    pub fn fit_mixture(&self, his: &Histogram) -> Option<GenotypeFit> {
        let normal = self.fit(his)?;

        let mut residual = his.clone();
        residual.subtract(&normal);
        let cnv = residual
            .mean_sigma()
            .filter(|x| (x.mean() - normal.mean()).abs() > MIN_MODE_SEPARATION * normal.sigma());

        let valley = cnv.and_then(|cnv| Self::valley(his, *normal.mean(), *cnv.mean()));
        let cnv_fraction = match (cnv, valley) {
            (Some(cnv), Some(valley)) => Self::fraction_beyond(his, valley, cnv.mean() > normal.mean()),
            _ => 0.0,
        };
        Some(GenotypeFit {
            normal,
            cnv,
            valley,
            cnv_fraction,
        })
    }

    /// Genome-wide fit. When a histogram of bins inside called regions is available and populated,
    /// its dominant mode replaces the residual CNV mode.
    pub fn genotype(&self, genome: &Histogram, called: Option<&Histogram>) -> Option<GenotypeFit> {
        let mut fit = self.fit_mixture(genome)?;
        let called = match called {
            Some(called) if *called.entries() > 0.0 => called,
            _ => return Some(fit),
        };

        if let Some(cnv) = called.mean_sigma() {
            let valley = Self::valley(genome, *fit.normal.mean(), *cnv.mean());
            fit.cnv = Some(cnv);
            fit.valley = valley;
            fit.cnv_fraction = match valley {
                Some(valley) => {
                    Self::fraction_beyond(genome, valley, cnv.mean() > fit.normal.mean())
                }
                None => 0.0,
            };
        }
        Some(fit)
    }

    /// Center of the least populated (smoothed) bin between two depths
    pub fn valley(his: &Histogram, a: f64, b: f64) -> Option<f64> {
        let (low, high) = (a.min(b), a.max(b));
        let first = his.bin_of(low.max(*his.low()))?;
        let last = his.bin_of(high.min(his.high() - his.width() * 0.5))?;
        if last <= first + 1 {
            return None;
        }

        let smoothed = his.smoothed(his.smoothing());
        let mut best = first + 1;
        for bin in first + 1..last {
            if smoothed[bin] < smoothed[best] {
                best = bin;
            }
        }
        Some(his.center(best))
    }

    fn fraction_beyond(his: &Histogram, valley: f64, above: bool) -> f64 {
        let total: f64 = his.counts().iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let beyond: f64 = his
            .counts()
            .iter()
            .enumerate()
            .filter(|(bin, _)| {
                if above {
                    his.center(*bin) > valley
                } else {
                    his.center(*bin) < valley
                }
            })
            .map(|(_, cnt)| *cnt)
            .sum();
        beyond / total
    }
}
