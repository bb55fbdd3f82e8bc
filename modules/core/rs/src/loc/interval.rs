use std::rc::Rc;
use std::sync::Arc;

use derive_getters::Dissolve;
use eyre::{eyre, Result};
use impl_tools::autoimpl;

use crate::num::PrimInt;

/// Interval is a half-open genomic region [start, end).
/// Coordinates are either base pairs or bin indices, depending on the context.
/// Empty intervals (start == end) and intervals with negative length are prohibited.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Dissolve)]
pub struct Interval<Idx: PrimInt> {
    start: Idx,
    end: Idx,
}

/// Trait for types that can be generally viewed as half-open genomic intervals [start, end).
#[autoimpl(for <T: trait + ?Sized> &T, Box<T>, Rc<T>, Arc<T>)]
#[allow(clippy::len_without_is_empty)]
pub trait IntervalOp {
    type Idx: PrimInt;

    /// Start position of the interval-like object.
    fn start(&self) -> Self::Idx;

    /// End position of the interval-like object.
    fn end(&self) -> Self::Idx;

    /// Length of the interval-like object.
    fn len(&self) -> Self::Idx {
        self.end() - self.start()
    }

    /// Check if the interval-like object contains a given position.
    fn contains(&self, pos: Self::Idx) -> bool {
        self.start() <= pos && pos < self.end()
    }
}

impl<T: PrimInt> IntervalOp for Interval<T> {
    type Idx = T;

    #[inline(always)]
    fn start(&self) -> Self::Idx {
        self.start
    }
    #[inline(always)]
    fn end(&self) -> Self::Idx {
        self.end
    }
}

impl<Idx: PrimInt> Interval<Idx> {
    pub fn new(start: Idx, end: Idx) -> Result<Self> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(eyre!("Invalid interval: start >= end"))
        }
    }

    /// Sort and merge overlapping or touching intervals in a single pass.
    pub fn merge(intervals: &mut [Self]) -> Vec<Self> {
        intervals.sort_by_key(|x| x.start);

        let mut merged: Vec<Self> = Vec::with_capacity(intervals.len());
        for current in intervals.iter() {
            match merged.last_mut() {
                Some(last) if current.start <= last.end => {
                    last.end = last.end.max(current.end);
                }
                _ => merged.push(*current),
            }
        }
        merged
    }

    /// Bins of the given size that overlap the interval, i.e. [start / size, ceil(end / size)).
    pub fn binned(&self, bin_size: Idx) -> Result<Self> {
        if bin_size <= Idx::zero() {
            return Err(eyre!("Bin size must be positive"));
        }
        let start = self.start / bin_size;
        let end = (self.end + bin_size - Idx::one()) / bin_size;
        Self::new(start, end)
    }

    /// Inverse of `binned` for bin intervals: base-pair span covered by the bins.
    pub fn unbinned(&self, bin_size: Idx) -> Result<Self> {
        if bin_size <= Idx::zero() {
            return Err(eyre!("Bin size must be positive"));
        }
        Self::new(self.start * bin_size, self.end * bin_size)
    }
}
