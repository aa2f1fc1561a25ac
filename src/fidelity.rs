//! Embedding fidelity as a rank correlation of pairwise distances.
//!
//! For every unordered pair of points the distance in the original space is
//! compared with the distance in the embedding. Spearman's coefficient over
//! all pairs measures how well the embedding preserves the ordering of
//! distances; `1.0` means every pair is ranked the same in both spaces.

use crate::distance::{DistanceMatrix, DistanceMetric};
use crate::history::EmbeddingSnapshot;
use crate::TsneError;

/// Summary statistics for one stored embedding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FidelityReport {
    /// Cost recorded with the evaluated snapshot
    pub final_cost: f64,

    /// Spearman correlation between original and embedded distances, in
    /// `[-1, 1]`
    pub rank_correlation: f64,

    /// Iteration that produced the evaluated snapshot
    pub iterations_completed: usize,
}

/// Scores a snapshot against the original-space distances.
///
/// Embedded distances use the same metric family as the original ones.
///
/// # Errors
/// * `TsneError::EmptyInput` if there are fewer than two points
/// * `TsneError::InvalidDimensions` if the snapshot and the distance matrix
///   disagree on the number of points
pub fn evaluate(
    original: &DistanceMatrix,
    snapshot: &EmbeddingSnapshot,
    metric: DistanceMetric,
) -> Result<FidelityReport, TsneError> {
    let n = original.n_points();
    if n < 2 {
        return Err(TsneError::EmptyInput);
    }

    let positions = snapshot.positions();
    if positions.nrows() != n {
        return Err(TsneError::InvalidDimensions {
            what: "snapshot",
            expected: vec![n, positions.ncols()],
            actual: positions.shape().to_vec(),
        });
    }

    let embedded = DistanceMatrix::from_embedding(positions, metric);
    let rank_correlation = spearman(original.as_slice(), embedded.as_slice());

    Ok(FidelityReport {
        final_cost: snapshot.cost(),
        rank_correlation,
        iterations_completed: snapshot.iteration(),
    })
}

/// Ranks starting at 0, ties share the average of the ranks they span.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_unstable_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }

        #[allow(clippy::cast_precision_loss)]
        let rank = (start + end - 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }

    ranks
}

/// Pearson correlation, `0.0` when either sequence has no variance.
fn pearson(a: &[f64], b: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let (cov, var_a, var_b) = a.iter().zip(b).fold((0.0, 0.0, 0.0), |(c, va, vb), (x, y)| {
        let dx = x - mean_a;
        let dy = y - mean_b;
        (c + dx * dy, va + dx * dx, vb + dy * dy)
    });

    if var_a <= 0.0 || var_b <= 0.0 {
        0.0
    } else {
        cov / (var_a.sqrt() * var_b.sqrt())
    }
}

/// Spearman rank correlation of two equally long sequences.
#[must_use]
pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "sequences must have the same length");
    if a.is_empty() {
        return 0.0;
    }

    pearson(&average_ranks(a), &average_ranks(b)).clamp(-1.0, 1.0)
}
