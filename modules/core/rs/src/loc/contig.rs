use std::fmt::Debug;
use std::hash::Hash;

/// Chromosome label attached to depth signals and called regions. `&str`, `String` and numeric
/// IDs all qualify, the only requirement is that labels can be compared and shared with workers.
pub trait Contig: Hash + Eq + Clone + Debug + Send + Sync {}

impl<T: Hash + Eq + Clone + Debug + Send + Sync> Contig for T {}
