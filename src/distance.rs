//! Pairwise distances in the original feature space.
//!
//! Distances are stored in a single contiguous lower-triangular buffer: row
//! `i` holds the `i` distances from point `i` to points `0..i`. The diagonal is
//! implied zero and never stored. Iterating the buffer front to back therefore
//! visits every unordered pair `(r, c)` with `r > 0` and `c < r` in row-major
//! order, which is the order the fidelity metric relies on.
//!
//! Unmasked, unweighted rows take a SIMD path; rows that need per-cell
//! missing-value handling or per-column weights fall back to a scalar loop.

use crate::TsneError;
use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;
use wide::f64x4;

/// Distance function used for both the original and the embedded space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum DistanceMetric {
    /// Square root of the (weighted) sum of squared differences
    #[default]
    Euclidean,

    /// (Weighted) sum of absolute differences
    Manhattan,
}

impl DistanceMetric {
    /// Distance between two equally long vectors under this metric.
    #[must_use]
    pub fn between(self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            DistanceMetric::Euclidean => simd_euclidean_distance(a, b),
            DistanceMetric::Manhattan => simd_manhattan_distance(a, b),
        }
    }
}

/// Symmetric pairwise distance matrix in packed lower-triangular form.
#[derive(Clone, Debug, PartialEq)]
pub struct DistanceMatrix {
    n: usize,
    values: Vec<f64>,
}

/// Offset of row `i` in the packed buffer.
const fn row_offset(i: usize) -> usize {
    i * i.saturating_sub(1) / 2
}

impl DistanceMatrix {
    /// Computes distances between all rows of `x`.
    ///
    /// # Arguments
    /// * `x` - Feature matrix, one observation per row
    /// * `mask` - Optional `(n, m)` matrix; `true` marks a missing value. A
    ///   feature only contributes to a pair when neither value is missing.
    /// * `weights` - Optional per-column weights of length `m`
    /// * `metric` - Distance function
    ///
    /// # Errors
    /// * `TsneError::InvalidDimensions` if the mask shape is not `(n, m)` or
    ///   the weight vector length is not `m`
    /// * `TsneError::NegativeWeight` if any column weight is negative or not
    ///   finite
    pub fn build(
        x: ArrayView2<f64>,
        mask: Option<ArrayView2<bool>>,
        weights: Option<ArrayView1<f64>>,
        metric: DistanceMetric,
    ) -> Result<Self, TsneError> {
        let n = x.nrows();
        check_inputs(x, mask, weights)?;

        let x = x.as_standard_layout();
        let plain = mask.is_none() && weights.is_none();

        let matrix = Self::from_fn(n, |i, j| {
            if plain {
                let a = x.row(i);
                let b = x.row(j);
                metric.between(a.as_slice().unwrap_or(&[]), b.as_slice().unwrap_or(&[]))
            } else {
                masked_distance(x.view(), mask, weights, metric, i, j)
            }
        });

        Ok(matrix)
    }

    /// Computes distances between the rows of an embedding.
    ///
    /// Embeddings are dense and unweighted, so this never fails.
    #[must_use]
    pub fn from_embedding(y: ArrayView2<f64>, metric: DistanceMetric) -> Self {
        let y = y.as_standard_layout();
        Self::from_fn(y.nrows(), |i, j| {
            let a = y.row(i);
            let b = y.row(j);
            metric.between(a.as_slice().unwrap_or(&[]), b.as_slice().unwrap_or(&[]))
        })
    }

    /// Fills the packed buffer in parallel, one task per row.
    fn from_fn<F>(n: usize, distance: F) -> Self
    where
        F: Fn(usize, usize) -> f64 + Sync,
    {
        let mut values = vec![0.0; row_offset(n)];

        // Carve the buffer into ragged row slices so rows can be written
        // concurrently without aliasing
        let mut rows = Vec::with_capacity(n);
        let mut rest = values.as_mut_slice();
        for i in 0..n {
            let (row, tail) = std::mem::take(&mut rest).split_at_mut(i);
            rows.push(row);
            rest = tail;
        }

        rows.into_par_iter().enumerate().for_each(|(i, row)| {
            for (j, d) in row.iter_mut().enumerate() {
                *d = distance(i, j);
            }
        });

        Self { n, values }
    }

    /// Number of points the matrix was built from.
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.n
    }

    /// Number of stored unordered pairs, `n * (n - 1) / 2`.
    #[must_use]
    pub fn n_pairs(&self) -> usize {
        self.values.len()
    }

    /// Distance between points `i` and `j` (order does not matter).
    ///
    /// # Panics
    /// * If either index is out of bounds
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        match i.cmp(&j) {
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => self.values[row_offset(i) + j],
            std::cmp::Ordering::Less => self.values[row_offset(j) + i],
        }
    }

    /// Distances from point `i` to points `0..i`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[row_offset(i)..row_offset(i + 1)]
    }

    /// All stored distances, pairs `(r, c)` with `c < r` in row-major order.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Largest stored distance, or `0.0` for fewer than two points.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(0.0, f64::max)
    }
}

/// Checks that a mask and column weights fit the feature matrix `x`.
///
/// # Errors
/// * `TsneError::InvalidDimensions` if the mask shape is not `(n, m)` or the
///   weight vector length is not `m`
/// * `TsneError::NegativeWeight` if any column weight is negative or not
///   finite
pub(crate) fn check_inputs(
    x: ArrayView2<f64>,
    mask: Option<ArrayView2<bool>>,
    weights: Option<ArrayView1<f64>>,
) -> Result<(), TsneError> {
    let (n, m) = x.dim();

    if let Some(mask) = mask {
        if mask.dim() != (n, m) {
            return Err(TsneError::InvalidDimensions {
                what: "mask",
                expected: vec![n, m],
                actual: mask.shape().to_vec(),
            });
        }
    }

    if let Some(weights) = weights {
        if weights.len() != m {
            return Err(TsneError::InvalidDimensions {
                what: "weights",
                expected: vec![m],
                actual: vec![weights.len()],
            });
        }

        if let Some(column) = weights.iter().position(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(TsneError::NegativeWeight { column });
        }
    }

    Ok(())
}

/// Scalar distance honoring the missing-value mask and column weights.
fn masked_distance(
    x: ArrayView2<f64>,
    mask: Option<ArrayView2<bool>>,
    weights: Option<ArrayView1<f64>>,
    metric: DistanceMetric,
    i: usize,
    j: usize,
) -> f64 {
    let mut sum = 0.0;
    for k in 0..x.ncols() {
        if mask.is_some_and(|mask| mask[[i, k]] || mask[[j, k]]) {
            continue;
        }

        let w = weights.map_or(1.0, |weights| weights[k]);
        let diff = x[[i, k]] - x[[j, k]];
        sum += match metric {
            DistanceMetric::Euclidean => w * diff * diff,
            DistanceMetric::Manhattan => w * diff.abs(),
        };
    }

    match metric {
        DistanceMetric::Euclidean => sum.sqrt(),
        DistanceMetric::Manhattan => sum,
    }
}

/// Computes Euclidean distance between slices using SIMD operations.
///
/// Processes vectors in chunks of 4 lanes and handles the remainder
/// sequentially.
///
/// # Panics
/// * If vectors have different lengths (debug builds only)
pub fn simd_euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(4);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(4);
    let b_remainder = b_chunks.remainder();

    let mut sum_sq = f64x4::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let diff = lanes(a_chunk) - lanes(b_chunk);
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f64 = sum_sq.as_array_ref().iter().sum();

    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq.sqrt()
}

/// Computes Manhattan distance between slices using SIMD operations.
pub fn simd_manhattan_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(4);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(4);
    let b_remainder = b_chunks.remainder();

    let mut sum_abs = f64x4::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        sum_abs += (lanes(a_chunk) - lanes(b_chunk)).abs();
    }

    let mut total: f64 = sum_abs.as_array_ref().iter().sum();
    for (a, b) in a_remainder.iter().zip(b_remainder) {
        total += (a - b).abs();
    }

    total
}

/// Loads an exact 4-element chunk into a SIMD register.
#[inline]
fn lanes(chunk: &[f64]) -> f64x4 {
    f64x4::new([chunk[0], chunk[1], chunk[2], chunk[3]])
}
