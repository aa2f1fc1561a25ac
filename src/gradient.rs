//! t-SNE gradient and cost.
//!
//! The gradient of the Kullback-Leibler divergence splits into an attractive
//! term over the stored input affinities and a repulsive term over all pairs:
//!
//! `dC/dy_i = sum_j e * p_ij q_ij (y_i - y_j) - (1 / Z) sum_j q_ij^2 (y_i - y_j)`
//!
//! with `q_ij = 1 / (1 + |y_i - y_j|^2)`, `Z = sum_{k != l} q_kl` and `e` the
//! current early-exaggeration factor. The constant factor 4 is folded into the
//! learning rate. The repulsive sums are computed exactly when `theta` is zero
//! and through a [`SpaceTree`] otherwise; one tree is built per call and shared
//! by every point.

use crate::affinity::Affinities;
use crate::tree::SpaceTree;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut1, Zip};
use rayon::prelude::*;

/// Calculates the gradient of the t-SNE cost for the current embedding.
///
/// # Arguments
/// * `y` - Current embedding coordinates as an n × d matrix
/// * `p` - Symmetric input affinities
/// * `exaggeration` - Multiplier applied to `p` in the attractive term
/// * `theta` - Barnes-Hut accuracy threshold; `0` computes repulsion exactly
///
/// # Returns
/// An n × d gradient matrix
#[must_use]
pub fn tsne_grad(y: ArrayView2<f64>, p: &Affinities, exaggeration: f64, theta: f64) -> Array2<f64> {
    let attraction = attractive_forces(y, p, exaggeration);
    let (repulsion, z) = if theta > 0.0 {
        approximate_repulsion(y, theta)
    } else {
        exact_repulsion(y)
    };

    let z = z.max(f64::MIN_POSITIVE);
    attraction - repulsion / z
}

/// Kullback-Leibler divergence `KL(P || Q)` of the current embedding.
///
/// Uses the un-exaggerated affinities. With `theta > 0` the normalization `Z`
/// is estimated with the same tree approximation as the gradient.
#[must_use]
pub fn kl_divergence(y: ArrayView2<f64>, p: &Affinities, theta: f64) -> f64 {
    let z = if theta > 0.0 {
        approximate_repulsion(y, theta).1
    } else {
        exact_repulsion(y).1
    };
    let z = z.max(f64::MIN_POSITIVE);

    (0..y.nrows())
        .into_par_iter()
        .map(|i| {
            let (columns, values) = p.row(i);
            columns
                .iter()
                .zip(values)
                .map(|(&j, &p_ij)| {
                    let q_ij = student_t(y, i, j) / z;
                    p_ij * ((p_ij + f64::MIN_POSITIVE) / (q_ij + f64::MIN_POSITIVE)).ln()
                })
                .sum::<f64>()
        })
        .sum()
}

/// Student-t kernel with one degree of freedom between rows `i` and `j`.
#[inline]
fn student_t(y: ArrayView2<f64>, i: usize, j: usize) -> f64 {
    let sq_dist: f64 = y
        .row(i)
        .iter()
        .zip(y.row(j))
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    1.0 / (1.0 + sq_dist)
}

/// Attractive forces `e * sum_j p_ij q_ij (y_i - y_j)` over stored entries.
fn attractive_forces(y: ArrayView2<f64>, p: &Affinities, exaggeration: f64) -> Array2<f64> {
    let mut forces = Array2::zeros(y.dim());

    Zip::indexed(forces.rows_mut()).par_for_each(|i, mut force| {
        let (columns, values) = p.row(i);
        for (&j, &p_ij) in columns.iter().zip(values) {
            let mult = exaggeration * p_ij * student_t(y, i, j);
            accumulate(&mut force, y, i, j, mult);
        }
    });

    forces
}

/// Exact repulsive forces and normalization `Z`, O(n²).
fn exact_repulsion(y: ArrayView2<f64>) -> (Array2<f64>, f64) {
    let n = y.nrows();
    let mut forces = Array2::zeros(y.dim());
    let mut row_sums = Array1::<f64>::zeros(n);

    Zip::indexed(forces.rows_mut())
        .and(&mut row_sums)
        .par_for_each(|i, mut force, row_sum| {
            for j in (0..n).filter(|&j| j != i) {
                let q = student_t(y, i, j);
                *row_sum += q;
                accumulate(&mut force, y, i, j, q * q);
            }
        });

    (forces, row_sums.sum())
}

/// Barnes-Hut repulsive forces and normalization `Z`.
fn approximate_repulsion(y: ArrayView2<f64>, theta: f64) -> (Array2<f64>, f64) {
    let tree = SpaceTree::build(y);
    let mut forces = Array2::zeros(y.dim());
    let mut row_sums = Array1::<f64>::zeros(y.nrows());

    Zip::indexed(forces.rows_mut())
        .and(&mut row_sums)
        .par_for_each(|i, mut force, row_sum| {
            let (estimate, sum_q) = tree.repulsion(i, theta);
            for (f, e) in force.iter_mut().zip(estimate) {
                *f = e;
            }
            *row_sum = sum_q;
        });

    (forces, row_sums.sum())
}

#[inline]
fn accumulate(force: &mut ArrayViewMut1<f64>, y: ArrayView2<f64>, i: usize, j: usize, mult: f64) {
    for (d, f) in force.iter_mut().enumerate() {
        *f += mult * (y[[i, d]] - y[[j, d]]);
    }
}
