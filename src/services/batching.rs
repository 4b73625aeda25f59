use std::ops::Range;

use crate::error::{AppError, AppResult};

/// Number of scenes handled per write transaction by default
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Position of one batch within a batched recompute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    /// Zero-based batch number
    pub index: usize,
    /// Index of the first scene in the batch
    pub start: usize,
    /// One past the index of the last scene in the batch
    pub end: usize,
}

impl BatchInfo {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Partitioning of a scene list into fixed-size batches
///
/// Pairs are only compared within a batch, so a plan trades completeness for
/// bounded transaction size: every pair is covered only when the batch size
/// is at least the number of scenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    batch_size: usize,
}

impl Default for BatchPlan {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

fn pairs_within(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

impl BatchPlan {
    pub fn new(batch_size: usize) -> AppResult<Self> {
        if batch_size == 0 {
            return Err(AppError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches covering `total` scenes in order; the last one may be short
    pub fn batches(&self, total: usize) -> Vec<BatchInfo> {
        (0..total)
            .step_by(self.batch_size)
            .enumerate()
            .map(|(index, start)| BatchInfo {
                index,
                start,
                end: (start + self.batch_size).min(total),
            })
            .collect()
    }

    /// Number of unordered pairs a batched pass compares over `total` scenes
    pub fn compared_pairs(&self, total: usize) -> usize {
        self.batches(total)
            .iter()
            .map(|batch| pairs_within(batch.len()))
            .sum()
    }

    /// Number of unordered pairs among `total` scenes
    pub fn total_pairs(total: usize) -> usize {
        pairs_within(total)
    }

    /// Whether a batched pass over `total` scenes compares every pair
    pub fn covers_all_pairs(&self, total: usize) -> bool {
        self.batch_size >= total
    }
}
