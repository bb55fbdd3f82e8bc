pub use contig::Contig;
pub use interval::{Interval, IntervalOp};

mod contig;
mod interval;
