//! Per-iteration embedding history.
//!
//! The worker appends one snapshot per completed iteration; any thread may
//! read. Snapshots are immutable and shared behind `Arc`, so a reader only
//! holds the lock long enough to clone a pointer.

use crate::TsneError;
use ndarray::{Array2, ArrayView2};
use parking_lot::RwLock;
use std::sync::Arc;

/// Embedding positions after one completed iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingSnapshot {
    iteration: usize,
    positions: Array2<f64>,
    cost: f64,
}

impl EmbeddingSnapshot {
    pub(crate) fn new(iteration: usize, positions: Array2<f64>, cost: f64) -> Self {
        Self {
            iteration,
            positions,
            cost,
        }
    }

    /// 1-based iteration that produced this embedding.
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// `n × output_dimensions` coordinates.
    #[must_use]
    pub fn positions(&self) -> ArrayView2<f64> {
        self.positions.view()
    }

    /// Most recently evaluated cost at this iteration.
    #[must_use]
    pub fn cost(&self) -> f64 {
        self.cost
    }
}

/// Ordered snapshots of the current (or most recent) run.
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    snapshots: RwLock<Vec<Arc<EmbeddingSnapshot>>>,
}

impl SnapshotHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for a 1-based iteration.
    ///
    /// # Errors
    /// * `TsneError::OutOfRange` if `iteration` is 0 or greater than
    ///   [`len`](Self::len)
    pub fn get(&self, iteration: usize) -> Result<Arc<EmbeddingSnapshot>, TsneError> {
        let snapshots = self.snapshots.read();
        iteration
            .checked_sub(1)
            .and_then(|index| snapshots.get(index))
            .cloned()
            .ok_or(TsneError::OutOfRange {
                iteration,
                available: snapshots.len(),
            })
    }

    /// Number of stored snapshots, equal to the last completed iteration.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether no iteration has completed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }

    /// Snapshot of the last completed iteration, if any.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<EmbeddingSnapshot>> {
        self.snapshots.read().last().cloned()
    }

    pub(crate) fn append(&self, snapshot: Arc<EmbeddingSnapshot>) {
        let mut snapshots = self.snapshots.write();
        debug_assert_eq!(
            snapshot.iteration,
            snapshots.len() + 1,
            "snapshots must arrive in iteration order"
        );
        snapshots.push(snapshot);
    }

    /// Empties the history, returning what it held.
    pub(crate) fn take(&self) -> Vec<Arc<EmbeddingSnapshot>> {
        std::mem::take(&mut *self.snapshots.write())
    }

    /// Puts back snapshots removed by [`take`](Self::take).
    pub(crate) fn restore(&self, snapshots: Vec<Arc<EmbeddingSnapshot>>) {
        *self.snapshots.write() = snapshots;
    }
}
