pub use calling::{copy_number, Adjustment, RegionCaller};
pub use config::{Config, Correction, MaskPolicy, Outputs, Passes};
pub use correction::{estimate_depth_maximum, GcCorrector};
pub use engine::Engine;
pub use error::CallError;
pub use genotype::{GenotypeFit, Genotyper};
pub use histogram::{GcHistogram, Histogram, ModeFit, GC_BUCKETS};
pub use level::{residual_precision, LevelEstimator, LevelSignal};
pub use merge::{Partition, SegmentMerger};
pub use numeric::{NumericCache, StatFunction};
pub use result::{CalledRegion, ChromosomeOutputs, ChromosomeReport, CnvClass, Harvest};
pub use signal::{is_sex_chromosome, ChromosomeSignal};
pub use stats::{get_average_variance, region_stats, Baseline, RunningStats};

mod calling;
pub mod config;
mod correction;
mod engine;
mod error;
mod genotype;
mod histogram;
mod level;
mod merge;
mod numeric;
mod result;
mod signal;
mod stats;
mod worker;
