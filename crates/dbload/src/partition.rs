//! Splitting a row count into per-worker ranges.

use std::ops::Range;

use clap::ValueEnum;

use crate::error::LoadError;

/// A contiguous range of sequence positions assigned to one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub worker: usize,
    /// First position, inclusive.
    pub start: usize,
    /// Last position, exclusive.
    pub end: usize,
}

impl Partition {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What to do with the `total % workers` positions that don't fit an even
/// split.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum RemainderPolicy {
    /// Leave the remainder out; those positions are never processed.
    Drop,
    /// Append the remainder to the last partition.
    #[default]
    LastPartition,
}

/// Splits `[0, total)` into `workers` contiguous, non-overlapping partitions
/// of `total / workers` positions each.
///
/// Partition `i` covers `[i * per_worker, (i + 1) * per_worker)`. The
/// `total % workers` leftover positions are handled according to `policy`.
/// When `workers > total` every partition is empty except, with
/// [`RemainderPolicy::LastPartition`], the last one.
pub fn plan(
    total: usize,
    workers: usize,
    policy: RemainderPolicy,
) -> Result<Vec<Partition>, LoadError> {
    if workers == 0 {
        return Err(LoadError::InvalidConfiguration(
            "worker count must be positive".to_string(),
        ));
    }

    let per_worker = total / workers;
    let mut partitions: Vec<Partition> = (0..workers)
        .map(|worker| Partition {
            worker,
            start: worker * per_worker,
            end: (worker + 1) * per_worker,
        })
        .collect();

    if policy == RemainderPolicy::LastPartition {
        if let Some(last) = partitions.last_mut() {
            last.end = total;
        }
    }

    Ok(partitions)
}

/// Number of positions in `[0, total)` that no partition covers.
pub fn uncovered(total: usize, partitions: &[Partition]) -> usize {
    let covered: usize = partitions.iter().map(Partition::len).sum();
    total - covered
}
