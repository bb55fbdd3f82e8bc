use std::fmt::Debug;

/// Integer type usable as a genomic coordinate (bin index or base-pair position)
pub trait PrimInt: ::num::PrimInt + Debug + Default {}

impl<T: ::num::PrimInt + Debug + Default> PrimInt for T {}
