//! High-dimensional input affinities.
//!
//! Each point gets a Gaussian kernel whose precision is tuned by bisection so
//! the entropy of the point's conditional neighbour distribution equals
//! `ln(perplexity)`. The conditional distributions are then symmetrized into
//! joint probabilities that sum to one and stored in compressed sparse row
//! form.
//!
//! The bisection is best effort: when it does not reach the tolerance within
//! the step cap, the precision from the last step is kept. This mirrors the
//! reference Barnes-Hut t-SNE and is not reported as an error.

use crate::distance::DistanceMatrix;
use rayon::prelude::*;
use tracing::{debug, trace};

/// Allowed absolute gap between the achieved and the target entropy.
pub const PERPLEXITY_TOLERANCE: f64 = 1e-5;

/// Maximum number of bisection steps per point.
pub const MAX_BISECTION_STEPS: usize = 200;

/// Outcome of calibrating one point's Gaussian kernel.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// Kernel precision, `1 / (2 sigma^2)`
    pub beta: f64,

    /// Whether the target entropy was reached within the tolerance
    pub converged: bool,

    /// Conditional probabilities, parallel to the input distances
    pub probabilities: Vec<f64>,
}

/// Finds the kernel precision for one point by bisection.
///
/// # Arguments
/// * `sq_distances` - Squared distances from the point to its candidate
///   neighbours
/// * `perplexity` - Target effective number of neighbours
#[must_use]
pub fn calibrate(sq_distances: &[f64], perplexity: f64) -> Calibration {
    let target = perplexity.ln();
    let mut beta = 1.0;
    let mut min_beta = f64::NEG_INFINITY;
    let mut max_beta = f64::INFINITY;
    let mut probabilities = vec![0.0; sq_distances.len()];
    let mut converged = false;
    let mut sum_p = f64::MIN_POSITIVE;
    let mut tried = beta;

    for _ in 0..MAX_BISECTION_STEPS {
        tried = beta;
        for (p, &d) in probabilities.iter_mut().zip(sq_distances) {
            *p = (-beta * d).exp();
        }

        sum_p = probabilities.iter().sum::<f64>().max(f64::MIN_POSITIVE);
        let weighted: f64 = probabilities
            .iter()
            .zip(sq_distances)
            .map(|(p, d)| beta * d * p)
            .sum();
        let entropy = weighted / sum_p + sum_p.ln();
        let diff = entropy - target;

        if diff.abs() < PERPLEXITY_TOLERANCE {
            converged = true;
            break;
        }

        // Entropy too high means the kernel is too wide
        if diff > 0.0 {
            min_beta = beta;
            beta = if max_beta.is_infinite() {
                beta * 2.0
            } else {
                (beta + max_beta) / 2.0
            };
        } else {
            max_beta = beta;
            beta = if min_beta.is_infinite() {
                beta / 2.0
            } else {
                (beta + min_beta) / 2.0
            };
        }
    }

    for p in &mut probabilities {
        *p /= sum_p;
    }

    Calibration {
        beta: tried,
        converged,
        probabilities,
    }
}

/// Symmetric joint probabilities `P` in compressed sparse row form.
#[derive(Debug, Clone, PartialEq)]
pub struct Affinities {
    row_ptr: Vec<usize>,
    columns: Vec<usize>,
    values: Vec<f64>,
}

impl Affinities {
    /// Builds joint probabilities from original-space distances.
    ///
    /// Distances are squared and scaled so the largest is one before the
    /// kernels are calibrated.
    ///
    /// # Arguments
    /// * `distances` - Pairwise distances in the original space
    /// * `perplexity` - Target effective number of neighbours per point
    /// * `n_neighbors` - Number of nearest points each conditional
    ///   distribution is restricted to; `n - 1` keeps every pair
    #[must_use]
    pub fn from_distances(distances: &DistanceMatrix, perplexity: f64, n_neighbors: usize) -> Self {
        let n = distances.n_points();
        let k = n_neighbors.min(n.saturating_sub(1));

        let max = distances.max();
        let scale = if max > 0.0 { 1.0 / (max * max) } else { 1.0 };

        let conditional: Vec<(Vec<usize>, Calibration)> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut candidates: Vec<(usize, f64)> = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| {
                        let d = distances.get(i, j);
                        (j, d * d * scale)
                    })
                    .collect();

                if k < candidates.len() {
                    candidates.select_nth_unstable_by(k, |a, b| f64::total_cmp(&a.1, &b.1));
                    candidates.truncate(k);
                }

                let (neighbors, sq_distances): (Vec<usize>, Vec<f64>) =
                    candidates.into_iter().unzip();
                (neighbors, calibrate(&sq_distances, perplexity))
            })
            .collect();

        let missed = conditional.iter().filter(|(_, c)| !c.converged).count();
        if missed > 0 {
            trace!("{missed} of {n} points kept a best-effort kernel bandwidth");
        }

        // Symmetrize: P_ij = p(j|i) + p(i|j), then normalize to sum one
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for (i, (neighbors, calibration)) in conditional.iter().enumerate() {
            for (&j, &p) in neighbors.iter().zip(&calibration.probabilities) {
                rows[i].push((j, p));
                rows[j].push((i, p));
            }
        }

        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut columns = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);

        for mut row in rows {
            row.sort_unstable_by_key(|&(j, _)| j);
            let row_start = columns.len();
            for (j, p) in row {
                if columns.len() > row_start && columns.last() == Some(&j) {
                    if let Some(last) = values.last_mut() {
                        *last += p;
                    }
                } else {
                    columns.push(j);
                    values.push(p);
                }
            }
            row_ptr.push(columns.len());
        }

        let total: f64 = values.iter().sum();
        if total > 0.0 {
            values.iter_mut().for_each(|p| *p /= total);
        }

        debug!(
            "Input affinities: {n} points, {} stored entries, {k} neighbours each",
            values.len()
        );

        Self {
            row_ptr,
            columns,
            values,
        }
    }

    /// Number of points.
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.row_ptr.len().saturating_sub(1)
    }

    /// Number of stored non-zero entries.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column indices and probabilities of row `i`.
    #[must_use]
    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let range = self.row_ptr[i]..self.row_ptr[i + 1];
        (&self.columns[range.clone()], &self.values[range])
    }

    /// Joint probability of `(i, j)`, zero when not stored.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (columns, values) = self.row(i);
        columns
            .binary_search(&j)
            .map_or(0.0, |position| values[position])
    }
}
