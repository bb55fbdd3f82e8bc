use std::cell::RefCell;
use std::sync::{Mutex, PoisonError};

use cnvscan_core_rs::loc::Contig;
use eyre::{eyre, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use thread_local::ThreadLocal;

use crate::config::{Config, Correction};
use crate::correction::{estimate_depth_maximum, GcCorrector};
use crate::genotype::{GenotypeFit, Genotyper};
use crate::histogram::{GcHistogram, Histogram};
use crate::numeric::NumericCache;
use crate::result::{CalledRegion, ChromosomeReport, Harvest};
use crate::signal::ChromosomeSignal;
use crate::stats::Baseline;
use crate::worker::{Prepared, Worker};

/// Multi-chromosome pipeline: validation, GC correction, baseline fitting, and per-chromosome
/// calling dispatched on a thread pool.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    cache: NumericCache,
    workers: ThreadLocal<RefCell<Worker>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

// Fill a histogram from every prepared chromosome of the requested kind and merge the results
fn accumulate<H, F, M>(
    pool: &ThreadPool,
    prepared: &[Result<Prepared>],
    sex: bool,
    template: &H,
    fill: F,
    merge: M,
) -> Result<H>
where
    H: Clone + Send + Sync,
    F: Fn(&mut H, &Prepared) + Sync + Send,
    M: Fn(&mut H, &H) -> Result<()> + Sync + Send,
{
    pool.install(|| {
        prepared
            .par_iter()
            .filter_map(|x| x.as_ref().ok())
            .filter(|x| x.sex == sex)
            .map(|x| {
                let mut his = template.clone();
                fill(&mut his, x);
                Ok(his)
            })
            .try_reduce(
                || template.clone(),
                |mut a, b| {
                    merge(&mut a, &b)?;
                    Ok(a)
                },
            )
    })
}

fn depth_maximum(prepared: &[Result<Prepared>]) -> Option<f64> {
    estimate_depth_maximum(
        prepared
            .iter()
            .flatten()
            .flat_map(|x| x.usable().map(|(depth, _)| depth)),
    )
}

fn fill_depth(his: &mut Histogram, x: &Prepared) {
    for (depth, _) in x.usable() {
        his.fill(*depth);
    }
}

// Normalize every chromosome with an AT channel by the mean depth of its AT bucket. Buckets are
// filled from autosomal bins on the normal side of the genome-wide genotype valley.
fn correct_at(
    pool: &ThreadPool,
    prepared: &mut [Result<Prepared>],
    config: &Config,
    cache: &NumericCache,
    maximum: f64,
) -> Result<bool> {
    let bins = *config.histogram_bins();
    let template = Histogram::new(bins, 0.0, maximum)?;
    let genome = accumulate(pool, prepared, false, &template, fill_depth, Histogram::merge)?;
    let fit = match Genotyper::new(*config.min_fit_entries()).fit_mixture(&genome) {
        Some(fit) => fit,
        None => {
            warn!("Genome depth histogram can't be fitted, AT correction is skipped");
            return Ok(false);
        }
    };
    debug!(
        "AT correction: valley {:?}, CNV fraction {:.4}",
        fit.valley(),
        fit.cnv_fraction()
    );

    let template = GcHistogram::new(bins, 0.0, maximum)?;
    let fill = |his: &mut GcHistogram, x: &Prepared| {
        if let Some(at) = &x.at {
            for ((depth, at), skip) in x.depth.iter().zip(at).zip(&x.skip) {
                if !skip && fit.is_normal(*depth) {
                    his.fill(*depth, *at);
                }
            }
        }
    };
    let his = accumulate(pool, prepared, false, &template, fill, GcHistogram::merge)?;

    let corrector = GcCorrector::new(cache, *config.min_gc_entries(), *config.min_bucket_entries());
    let factors = match corrector.factors(&his)? {
        Some(factors) => factors,
        None => return Ok(false),
    };
    pool.install(|| {
        prepared.par_iter_mut().for_each(|slot| {
            let outcome = match slot.as_mut() {
                Ok(x) => match x.at.as_deref() {
                    Some(at) => {
                        let result = corrector.apply(&mut x.depth, at, &factors);
                        if result.is_ok() {
                            x.corrected = true;
                        }
                        result
                    }
                    None => Ok(()),
                },
                Err(_) => return,
            };
            if let Err(err) = outcome {
                *slot = Err(err);
            }
        });
    });
    Ok(true)
}

// Baseline from a depth histogram: the dominant mode if it can be fitted, Poisson-like spread
// around the plain mean otherwise
fn baseline(genotyper: &Genotyper, his: &Histogram) -> Option<Baseline> {
    if let Some(fit) = genotyper.fit(his) {
        return Some(Baseline::from(&fit));
    }
    match his.mean() {
        Some(mean) if mean > 0.0 => {
            warn!("Falling back to the mean depth {mean:.3} as the baseline");
            Some(Baseline::new(mean, mean.sqrt()))
        }
        _ => None,
    }
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self::with_cache(config, NumericCache::default())
    }

    pub fn with_cache(config: Config, cache: NumericCache) -> Self {
        Self {
            config,
            cache,
            workers: ThreadLocal::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &NumericCache {
        &self.cache
    }

    pub fn reset(&mut self) {
        // Soft-reset all workers
        for w in self.workers.iter_mut() {
            w.borrow_mut().reset()
        }
    }

    pub fn run<Ctg: Contig>(
        &mut self,
        pool: &ThreadPool,
        signals: Vec<ChromosomeSignal<Ctg>>,
    ) -> Result<Harvest<Ctg>> {
        self.reset();
        let config = &self.config;
        let cache = &self.cache;
        let bins = *config.histogram_bins();

        // 1. Validate inputs, shape errors isolate the chromosome
        let (contigs, mut prepared): (Vec<Ctg>, Vec<Result<Prepared>>) = pool.install(|| {
            signals
                .into_par_iter()
                .map(|signal| (signal.contig().clone(), Prepared::new(signal, config)))
                .unzip()
        });
        for (contig, chromosome) in contigs.iter().zip(&prepared) {
            if let Err(err) = chromosome {
                warn!("Chromosome {contig:?} is skipped: {err}");
            }
        }

        // 2-3. GC histograms and correction
        let maximum = match depth_maximum(&prepared) {
            Some(maximum) => maximum,
            None => {
                warn!("No usable depth in any chromosome");
                return Ok(self.harvest(contigs, prepared, Vec::new(), (None, None), None));
            }
        };

        if *config.correction() != Correction::None {
            let template = GcHistogram::new(bins, 0.0, maximum)?;
            let fill = |his: &mut GcHistogram, x: &Prepared| {
                for (depth, gc) in x.usable() {
                    his.fill(*depth, *gc);
                }
            };
            let autosomal = accumulate(pool, &prepared, false, &template, fill, GcHistogram::merge)?;
            let sex = accumulate(pool, &prepared, true, &template, fill, GcHistogram::merge)?;

            let corrector =
                GcCorrector::new(cache, *config.min_gc_entries(), *config.min_bucket_entries());
            let autosomal = corrector.factors(&autosomal)?;
            let sex = if sex.entries() >= *config.min_gc_entries() {
                corrector.factors(&sex)?
            } else {
                autosomal.clone()
            };

            let window = config.fragment_window();
            pool.install(|| {
                prepared.par_iter_mut().for_each(|slot| {
                    let outcome = match slot.as_mut() {
                        Ok(x) => {
                            let factors = if x.sex {
                                sex.as_deref().or(autosomal.as_deref())
                            } else {
                                autosomal.as_deref()
                            };
                            let result = match (factors, config.correction()) {
                                (None, _) | (_, Correction::None) => Ok(false),
                                (Some(factors), Correction::Gc) => {
                                    corrector.apply(&mut x.depth, &x.gc, factors).map(|_| true)
                                }
                                (Some(factors), Correction::GcByFragment { .. }) => corrector
                                    .apply_by_fragment(&mut x.depth, &x.gc, factors, window)
                                    .map(|_| true),
                            };
                            result.map(|corrected| x.corrected = corrected)
                        }
                        Err(_) => return,
                    };
                    if let Err(err) = outcome {
                        *slot = Err(err);
                    }
                });
            });
        }

        // 3b. AT bias correction
        if *config.at_correction() {
            let maximum = depth_maximum(&prepared).unwrap_or(maximum);
            if correct_at(pool, &mut prepared, config, cache, maximum)? {
                info!("AT bias correction applied");
            }
        }

        // 4. Genome-wide depth histograms and baselines
        let maximum = depth_maximum(&prepared).unwrap_or(maximum);
        let template = Histogram::new(bins, 0.0, maximum)?;
        let genome = accumulate(pool, &prepared, false, &template, fill_depth, Histogram::merge)?;
        let sex_genome =
            accumulate(pool, &prepared, true, &template, fill_depth, Histogram::merge)?;

        let genotyper = Genotyper::new(*config.min_fit_entries());
        let autosomal = if *genome.entries() > 0.0 {
            baseline(&genotyper, &genome)
        } else {
            None
        };
        let sex = if *sex_genome.entries() >= *config.min_fit_entries() {
            baseline(&genotyper, &sex_genome)
        } else {
            None
        };
        info!("Baselines: autosomal {autosomal:?}, sex chromosomes {sex:?}");

        let baselines = prepared
            .iter()
            .map(|x| match x {
                Ok(x) if x.sex => sex.or(autosomal),
                Ok(_) => autosomal.or(sex),
                Err(_) => None,
            })
            .collect::<Vec<_>>();
        for (slot, baseline) in prepared.iter_mut().zip(&baselines) {
            if slot.is_ok() && baseline.is_none() {
                *slot = Err(eyre!("Baseline depth is unknown"));
            }
        }

        // 5. Level, merge and call every chromosome
        let regions = Mutex::new(Vec::new());
        let indices = (0..prepared.len()).collect::<Vec<_>>();
        pool.scope(|s| {
            for ind in &indices {
                let (chromosome, baseline) = match (&prepared[*ind], baselines[*ind]) {
                    (Ok(chromosome), Some(baseline)) => (chromosome, baseline),
                    _ => continue,
                };
                let (contig, workers, regions) = (&contigs[*ind], &self.workers, &regions);

                s.spawn(move |_| {
                    let called = workers.get_or_default().borrow_mut().process(
                        *ind, contig, chromosome, &baseline, config, cache,
                    );
                    regions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((*ind, called));
                });
            }
        });
        let regions = regions
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .sorted_by_key(|x| x.0)
            .collect::<Vec<_>>();

        // 6. Genotype the population of called bins
        let mut called = template.clone();
        for (ind, chromosome) in regions.iter() {
            let x = match &prepared[*ind] {
                Ok(x) if !x.sex => x,
                _ => continue,
            };
            for region in chromosome {
                for bin in *region.start()..=*region.end() {
                    if !x.skip[bin] {
                        called.fill(x.depth[bin]);
                    }
                }
            }
        }
        let regions = regions
            .into_iter()
            .flat_map(|(_, x)| x)
            .collect::<Vec<_>>();
        debug!("{} regions called", regions.len());

        let genotype = if *genome.entries() > 0.0 {
            genotyper.genotype(&genome, Some(&called))
        } else {
            None
        };
        if let Some(fit) = &genotype {
            info!(
                "Genotype: normal mode {:?}, CNV mode {:?}, CNV fraction {:.4}",
                fit.normal(),
                fit.cnv(),
                fit.cnv_fraction()
            );
        }

        Ok(self.harvest(contigs, prepared, regions, (autosomal, sex), genotype))
    }

    fn harvest<Ctg: Contig>(
        &mut self,
        contigs: Vec<Ctg>,
        prepared: Vec<Result<Prepared>>,
        regions: Vec<CalledRegion<Ctg>>,
        baselines: (Option<Baseline>, Option<Baseline>),
        genotype: Option<GenotypeFit>,
    ) -> Harvest<Ctg> {
        let mut outcomes = Worker::collapse(self.workers.iter_mut().map(|x| x.get_mut()));
        let chromosomes = contigs
            .into_iter()
            .zip(prepared)
            .enumerate()
            .map(|(ind, (contig, chromosome))| match chromosome {
                Ok(x) => {
                    let status = outcomes
                        .remove(&ind)
                        .unwrap_or_else(|| Err(eyre!("Chromosome wasn't processed")));
                    ChromosomeReport::new(contig, x.corrected, status)
                }
                Err(err) => ChromosomeReport::new(contig, false, Err(err)),
            })
            .collect();
        Harvest::new(regions, chromosomes, baselines.0, baselines.1, genotype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::result::CnvClass;
    use cnvscan_core_rs::parallelism;

    fn pattern(n: usize, level: f64) -> Vec<f64> {
        (0..n)
            .map(|x| level + [-6.0, 2.0, 8.0, -2.0, 0.0, 4.0, -8.0, 6.0, -4.0][x % 9])
            .collect()
    }

    #[test]
    fn test_run() -> Result<()> {
        let pool = parallelism::pool(2)?;
        let mut engine = Engine::new(Config::default());

        let mut gained = pattern(1500, 50.0);
        for x in &mut gained[600..660] {
            *x += 50.0;
        }
        let signals = vec![
            ChromosomeSignal::new("1".to_string(), pattern(1500, 50.0), vec![40.0; 1500]),
            ChromosomeSignal::new("2".to_string(), gained, vec![40.0; 1500]),
            ChromosomeSignal::new("3".to_string(), pattern(10, 50.0), vec![40.0; 9]),
            ChromosomeSignal::new("X".to_string(), pattern(500, 25.0), vec![40.0; 500])
                .detect_sex_chromosome(),
        ];

        let harvest = engine.run(&pool, signals)?;
        assert_eq!(harvest.chromosomes().len(), 4);
        assert!(harvest.chromosomes()[0].is_ok());
        assert!(harvest.chromosomes()[1].is_ok());
        assert!(*harvest.chromosomes()[1].corrected());

        let failed = harvest.chromosomes()[2].status().as_ref().unwrap_err();
        assert!(matches!(
            failed.downcast_ref::<CallError>(),
            Some(CallError::InputShape { what: "GC", .. })
        ));

        // Too few bins for its own baseline, falls back to the autosomal one and is called as a loss
        assert!(harvest.sex().is_none());
        assert!(harvest.chromosomes()[3].is_ok());
        let on_x = harvest
            .regions()
            .iter()
            .filter(|x| x.contig() == "X")
            .collect::<Vec<_>>();
        assert!(!on_x.is_empty());
        assert!(on_x.iter().all(|x| *x.class() == CnvClass::Loss));

        let autosomal = harvest.autosomal().unwrap();
        assert!((autosomal.mean() - 50.0).abs() < 2.0);

        let on_2 = harvest
            .regions()
            .iter()
            .filter(|x| x.contig() == "2")
            .collect::<Vec<_>>();
        assert_eq!(on_2.len(), 1);
        assert_eq!(*on_2[0].class(), CnvClass::Gain);
        assert!(on_2[0].start().abs_diff(600) <= 4);
        assert!(on_2[0].end().abs_diff(659) <= 4);
        assert!(harvest.regions().iter().all(|x| x.contig() != "1"));

        // Rerun reuses the engine
        let harvest = engine.run::<String>(&pool, vec![])?;
        assert!(harvest.chromosomes().is_empty());
        assert!(harvest.regions().is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_labels() -> Result<()> {
        let pool = parallelism::pool(2)?;
        let mut engine = Engine::new(Config::default());

        // Labels don't have to be unique, chromosomes are tracked by their position
        let mut gained = pattern(1500, 50.0);
        for x in &mut gained[1200..1260] {
            *x += 50.0;
        }
        let signals = vec![
            ChromosomeSignal::new("1", pattern(1000, 50.0), vec![40.0; 1000]),
            ChromosomeSignal::new("1", gained, vec![40.0; 1500]),
        ];

        let harvest = engine.run(&pool, signals)?;
        assert!(harvest.chromosomes().iter().all(|x| x.is_ok()));
        assert_eq!(harvest.regions().len(), 1, "{:?}", harvest.regions());

        let region = &harvest.regions()[0];
        assert_eq!(*region.class(), CnvClass::Gain);
        assert!(region.start().abs_diff(1200) <= 4);
        assert!(region.end().abs_diff(1259) <= 4);
        Ok(())
    }
}
