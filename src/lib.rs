#![allow(clippy::multiple_crate_versions)]

//! # Live t-SNE: observable, cancellable t-distributed stochastic neighbour embedding
//!
//! This crate computes low-dimensional embeddings of high-dimensional point
//! sets with t-SNE and runs the optimization on a background worker so a
//! caller can watch it converge, scrub back through every intermediate
//! embedding, stop it early and score any stored iteration.
//!
//! ## Key Features
//!
//! - Exact repulsion for small inputs and Barnes-Hut approximation (quadtree
//!   in 2D, octree in 3D) for larger ones, selected by `theta`
//! - Momentum with adaptive per-coordinate gains and early exaggeration
//! - Euclidean or Manhattan distances with optional missing-value masks and
//!   column weights
//! - Per-column standardization of the raw features
//! - One stored snapshot per iteration with random access
//! - Spearman rank correlation between original and embedded distances as a
//!   fidelity score
//!
//! ## Examples
//!
//! Blocking run on the calling thread:
//! ```rust,no_run
//! use ndarray::Array2;
//! use tsne_live::{fit_transform, Configuration};
//!
//! let data: Array2<f64> = // ... load your high-dimensional data
//! # Array2::zeros((100, 50));
//! let config = Configuration::builder()
//!     .perplexity(Configuration::suggested_perplexity(data.nrows()))
//!     .random_seed(42)
//!     .build();
//! let (embedding, summary) = fit_transform(data.view(), config).unwrap();
//! ```
//!
//! Observed run on a worker thread:
//! ```rust,no_run
//! use ndarray::Array2;
//! use tsne_live::{Configuration, Progress, RunCoordinator, RunInput, RunObserver};
//!
//! struct Printer;
//!
//! impl RunObserver for Printer {
//!     fn on_progress(&self, progress: &Progress<'_>) {
//!         println!("{}", progress.log_line);
//!     }
//! }
//!
//! let data: Array2<f64> = // ...
//! # Array2::zeros((100, 5));
//! let mut coordinator = RunCoordinator::new();
//! let handle = coordinator
//!     .start(
//!         Configuration::builder().max_iterations(1000).build(),
//!         data.view(),
//!         RunInput::default(),
//!         Printer,
//!     )
//!     .unwrap();
//!
//! // ... later
//! handle.request_stop();
//! handle.join();
//! let last = coordinator.history().len();
//! let report = coordinator.evaluate(last).unwrap();
//! ```
//!
//! ## Configuration
//!
//! Core parameters:
//! - `perplexity`: Effective number of neighbours per point (default: 30);
//!   must not exceed `(n - 1) / 3`
//! - `theta`: Barnes-Hut accuracy threshold, `0` for exact repulsion
//!   (default: 0.5)
//! - `max_iterations`: Iteration cap (default: 5000)
//! - `min_cost`: Stop once the evaluated cost drops below this (default:
//!   1e-6)
//! - `output_dimensions`: 2 or 3 (default: 2)
//! - `random_seed`: Optional seed for a reproducible initial embedding
//!
//! Optimizer parameters:
//! - `learning_rate` (default: 200), `momentum` (default: 0.5),
//!   `final_momentum` (default: 0.8), `momentum_switch_iteration` (default:
//!   250), `exaggeration_factor` (default: 12)
//!
//! ## References
//!
//! [Visualizing Data using t-SNE](https://jmlr.org/papers/v9/vandermaaten08a.html).
//! van der Maaten, L., & Hinton, G. (2008).
//! Journal of Machine Learning Research, 9(86), 2579-2605.
//!
//! [Accelerating t-SNE using Tree-Based Algorithms](https://jmlr.org/papers/v15/vandermaaten14a.html).
//! van der Maaten, L. (2014).
//! Journal of Machine Learning Research, 15(93), 3221-3245.

// Submodule imports
pub mod affinity;
mod coordinator;
pub mod distance;
mod export;
mod fidelity;
pub mod gradient;
mod history;
pub mod optimizer;
mod schedule;
pub mod standardize;
pub mod tree;

#[cfg(test)]
mod tests;

pub use coordinator::{
    Progress, RunCoordinator, RunHandle, RunInput, RunObserver, RunState, RunSummary,
};
pub use distance::{DistanceMatrix, DistanceMetric};
pub use export::{EmbeddingExport, ExportColumn, Group, Grouping, ResultSink};
pub use fidelity::{evaluate, spearman, FidelityReport};
pub use history::{EmbeddingSnapshot, SnapshotHistory};
pub use optimizer::StopReason;
pub use standardize::Standardization;

use bon::Builder;
use ndarray::{Array2, ArrayView2};
use ndarray_rand::rand_distr::{Normal, NormalError};
use ndarray_rand::RandomExt;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::debug;

use crate::affinity::Affinities;
use crate::optimizer::optimize;

/// Standard deviation of the random initial embedding.
const INITIAL_SCALE: f64 = 1e-4;

/// Upper bound of the suggested perplexity.
const MAX_SUGGESTED_PERPLEXITY: f64 = 30.0;

/// Configuration options for a t-SNE run.
///
/// Controls the input affinities, the optimizer schedule and termination.
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct Configuration {
    /// Effective number of neighbours each point's Gaussian kernel covers
    #[builder(default = 30.0)]
    pub perplexity: f64,

    /// Barnes-Hut accuracy threshold; `0` computes repulsion exactly
    #[builder(default = 0.5)]
    pub theta: f64,

    /// Maximum number of iterations
    #[builder(default = 5000)]
    pub max_iterations: usize,

    /// Stop once the most recently evaluated cost is below this value
    #[builder(default = 1e-6)]
    pub min_cost: f64,

    /// Gradient descent step size
    #[builder(default = 200.0)]
    pub learning_rate: f64,

    /// Momentum before `momentum_switch_iteration`
    #[builder(default = 0.5)]
    pub momentum: f64,

    /// Momentum from `momentum_switch_iteration` on
    #[builder(default = 0.8)]
    pub final_momentum: f64,

    /// 0-based iteration at which `final_momentum` takes over
    #[builder(default = 250)]
    pub momentum_switch_iteration: usize,

    /// Number of embedding dimensions, 2 or 3
    #[builder(default = 2)]
    pub output_dimensions: usize,

    /// Distance function for the original space and for fidelity scoring
    #[builder(default)]
    pub distance_metric: DistanceMetric,

    /// Optional random seed for the initial embedding
    pub random_seed: Option<u64>,

    /// Multiplier on the input affinities during early exaggeration
    #[builder(default = 12.0)]
    pub exaggeration_factor: f64,

    /// Column transformation applied before distances are computed
    #[builder(default)]
    pub standardization: Standardization,

    /// Iterations between cost evaluations
    #[builder(default = 50)]
    pub cost_interval: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            theta: 0.5,
            max_iterations: 5000,
            min_cost: 1e-6,
            learning_rate: 200.0,
            momentum: 0.5,
            final_momentum: 0.8,
            momentum_switch_iteration: 250,
            output_dimensions: 2,
            distance_metric: DistanceMetric::default(),
            random_seed: None,
            exaggeration_factor: 12.0,
            standardization: Standardization::default(),
            cost_interval: 50,
        }
    }
}

impl Configuration {
    /// Largest perplexity accepted for `n` observations, `(n - 1) / 3`.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn max_perplexity(n: usize) -> f64 {
        n.saturating_sub(1) as f64 / 3.0
    }

    /// Default perplexity for `n` observations: `floor((n - 1) / 3)`, at most
    /// 30.
    #[must_use]
    pub fn suggested_perplexity(n: usize) -> f64 {
        Self::max_perplexity(n).floor().min(MAX_SUGGESTED_PERPLEXITY)
    }

    /// Checks every parameter against its allowed range for `n` observations.
    ///
    /// # Errors
    /// * `ConfigError` describing the first violated rule
    pub fn validate(&self, n: usize) -> Result<(), ConfigError> {
        if n < 2 {
            return Err(ConfigError::TooFewPoints(n));
        }

        positive("perplexity", self.perplexity)?;
        positive("learning_rate", self.learning_rate)?;
        within("theta", self.theta, 0.0, f64::INFINITY)?;
        within("min_cost", self.min_cost, 0.0, f64::INFINITY)?;
        within("momentum", self.momentum, 0.0, 1.0)?;
        within("final_momentum", self.final_momentum, 0.0, 1.0)?;
        within("exaggeration_factor", self.exaggeration_factor, 1.0, f64::INFINITY)?;

        if self.max_iterations == 0 {
            return Err(ConfigError::NonPositive {
                parameter: "max_iterations",
            });
        }
        if self.cost_interval == 0 {
            return Err(ConfigError::NonPositive {
                parameter: "cost_interval",
            });
        }
        if !(2..=tree::MAX_DIMS).contains(&self.output_dimensions) {
            return Err(ConfigError::Dimensions(self.output_dimensions));
        }

        let max = Self::max_perplexity(n);
        if self.perplexity > max {
            return Err(ConfigError::PerplexityTooLarge {
                perplexity: self.perplexity,
                n,
                max,
            });
        }

        Ok(())
    }
}

fn positive(parameter: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { parameter })
    }
}

fn within(parameter: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::NotInRange {
            parameter,
            value,
            min,
            max,
        })
    }
}

/// Number of nearest points each conditional distribution keeps.
///
/// Exact runs keep every pair; approximate runs keep `floor(3 * perplexity)`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn neighbor_count(config: &Configuration, n: usize) -> usize {
    let all = n.saturating_sub(1);
    if config.theta > 0.0 {
        ((3.0 * config.perplexity).floor() as usize).min(all)
    } else {
        all
    }
}

/// Draws the initial embedding from `N(0, 1e-4²)`.
///
/// # Errors
/// * `TsneError::Normal` if the distribution cannot be constructed
pub(crate) fn initial_embedding(
    n: usize,
    dims: usize,
    seed: Option<u64>,
) -> Result<Array2<f64>, TsneError> {
    let normal = Normal::new(0.0, INITIAL_SCALE)?;
    Ok(match seed {
        None => Array2::random((n, dims), normal),
        Some(seed) => Array2::random_using((n, dims), normal, &mut SmallRng::seed_from_u64(seed)),
    })
}

/// Embeds `x` on the calling thread.
///
/// Runs the same pipeline as [`RunCoordinator::start`] without a mask, column
/// weights or observers, and blocks until the run ends.
///
/// # Arguments
/// * `x` - Input data matrix where each row is an observation
/// * `config` - Configuration options controlling the embedding
///
/// # Returns
/// A tuple containing:
/// * Final embedding coordinates as an `(n, output_dimensions)` matrix
/// * Summary with the final cost, iteration count, stop reason and log
///
/// # Errors
/// * `TsneError::InvalidConfiguration` - The configuration does not fit the
///   number of observations
/// * `TsneError::Normal` - Random initialization fails
pub fn fit_transform(
    x: ArrayView2<f64>,
    config: Configuration,
) -> Result<(Array2<f64>, RunSummary), TsneError> {
    let n = x.nrows();
    config.validate(n)?;

    let x = config.standardization.apply(x, None);
    let distances = DistanceMatrix::build(x.view(), None, None, config.distance_metric)?;
    let p = Affinities::from_distances(&distances, config.perplexity, neighbor_count(&config, n));
    let y = initial_embedding(n, config.output_dimensions, config.random_seed)?;

    let outcome = optimize(&config, &p, y, || false, |_, _, _, _| {});
    debug!(
        "Finished after {} iterations ({:?})",
        outcome.iterations_completed, outcome.stop_reason
    );

    let summary = RunSummary::from(&outcome);
    Ok((outcome.embedding, summary))
}

/// Violated configuration rules.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A parameter that must be strictly positive is not
    #[error("{parameter} must be positive")]
    NonPositive {
        /// Parameter name
        parameter: &'static str,
    },

    /// A parameter lies outside its allowed interval
    #[error("{parameter} = {value} is outside [{min}, {max}]")]
    NotInRange {
        /// Parameter name
        parameter: &'static str,
        /// Supplied value
        value: f64,
        /// Smallest allowed value
        min: f64,
        /// Largest allowed value
        max: f64,
    },

    /// Perplexity exceeds `(n - 1) / 3`
    #[error("perplexity {perplexity} is too large for {n} observations (at most {max})")]
    PerplexityTooLarge {
        /// Requested perplexity
        perplexity: f64,
        /// Number of observations
        n: usize,
        /// Largest accepted perplexity
        max: f64,
    },

    /// Output dimensionality other than 2 or 3
    #[error("output dimensions must be 2 or 3, got {0}")]
    Dimensions(usize),

    /// Fewer than two observations
    #[error("at least two observations are required, got {0}")]
    TooFewPoints(usize),
}

/// Errors that can occur while preparing, running or inspecting an
/// embedding.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TsneError {
    /// Configuration rejected before a run started
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    /// An input does not match the shape of the feature matrix
    #[error("invalid {what} shape. Expected {expected:?}, got {actual:?}")]
    InvalidDimensions {
        /// Which input is malformed
        what: &'static str,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// A column weight is negative or not finite
    #[error("weight for column {column} must be finite and non-negative")]
    NegativeWeight {
        /// Offending column
        column: usize,
    },

    /// A run was started before the previous one was joined
    #[error("a run is already active; stop and join it first")]
    RunAlreadyActive,

    /// No snapshot is stored for the requested iteration
    #[error("iteration {iteration} is out of range, {available} iterations stored")]
    OutOfRange {
        /// Requested 1-based iteration
        iteration: usize,
        /// Number of stored snapshots
        available: usize,
    },

    /// Fewer than two points, so there are no pairs to correlate
    #[error("at least two points are required")]
    EmptyInput,

    /// No run has been started yet
    #[error("no run has been started")]
    NoRun,

    /// Normal distribution creation failed
    #[error(transparent)]
    Normal(#[from] NormalError),

    /// The worker thread could not be created
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
