use derive_getters::{Dissolve, Getters};
use derive_more::Constructor;
use eyre::Result;

use crate::error::ensure_len;

/// Run of bins sharing one merged level. `start` and `end` are inclusive bin indices of the first
/// and last member, excluded bins in between are spanned but not counted.
#[derive(Clone, Copy, PartialEq, Debug, Constructor, Getters, Dissolve)]
pub struct Partition {
    start: usize,
    end: usize,
    /// Mean level of the members
    level: f64,
    /// Number of non-excluded bins
    size: usize,
}

impl Partition {
    pub fn bins(&self) -> usize {
        self.end - self.start + 1
    }

    // Incremental mean, exact when the added level equals the current one
    fn push(&mut self, ind: usize, level: f64) {
        self.end = ind;
        self.size += 1;
        self.level += (level - self.level) / self.size as f64;
    }

    fn absorb(&mut self, other: &Self) {
        let size = self.size + other.size;
        self.level = (self.level * self.size as f64 + other.level * other.size as f64) / size as f64;
        self.end = other.end;
        self.size = size;
    }
}

/// Left-to-right pass merging bins with levels within a relative tolerance of the running
/// partition's mean level
#[derive(Clone, Copy, PartialEq, Debug, Constructor)]
pub struct SegmentMerger {
    delta: f64,
}

impl SegmentMerger {
    pub fn delta(&self) -> f64 {
        self.delta
    }

    #[inline]
    pub fn same_level(&self, anchor: f64, value: f64) -> bool {
        (value - anchor).abs() <= self.delta * anchor.abs()
    }

    /// Partitions of non-excluded bins. Neighbouring partitions never share a level, which makes
    /// merging the flattened output reproduce the same partitions.
    pub fn merge(&self, level: &[f64], mask: &[bool]) -> Result<Vec<Partition>> {
        ensure_len("Mask", level.len(), mask.len())?;

        let mut partitions: Vec<Partition> = Vec::new();
        let mut current: Option<Partition> = None;
        for (ind, (value, excluded)) in level.iter().zip(mask).enumerate() {
            if *excluded {
                continue;
            }
            match current.as_mut() {
                Some(p) if self.same_level(p.level, *value) => p.push(ind, *value),
                _ => {
                    if let Some(p) = current.take() {
                        self.close(&mut partitions, p);
                    }
                    current = Some(Partition::new(ind, ind, *value, 1));
                }
            }
        }
        if let Some(p) = current {
            self.close(&mut partitions, p);
        }
        Ok(partitions)
    }

    // Append a finished partition, joining it with its predecessors while their means agree
    fn close(&self, partitions: &mut Vec<Partition>, mut partition: Partition) {
        while let Some(last) = partitions.last() {
            if !self.same_level(last.level, partition.level) {
                break;
            }
            let mut last = *last;
            partitions.pop();
            last.absorb(&partition);
            partition = last;
        }
        partitions.push(partition);
    }

    /// Merged level signal: every member bin gets the level of its partition,
    /// excluded bins are NaN.
    pub fn flatten(&self, partitions: &[Partition], mask: &[bool]) -> Vec<f64> {
        let mut result = vec![f64::NAN; mask.len()];
        for p in partitions {
            for ind in p.start..(p.end + 1).min(mask.len()) {
                if !mask[ind] {
                    result[ind] = p.level;
                }
            }
        }
        result
    }
}
