//! Per-iteration optimizer parameters.
//!
//! Two things change while a run progresses:
//! 1. Early exaggeration: input affinities are multiplied by the configured
//!    factor for an initial block of iterations so clusters form and separate
//!    before fine structure is refined
//! 2. Momentum: the velocity carry-over switches from the initial to the final
//!    value at the configured iteration

use crate::Configuration;

/// Upper bound on the number of exaggerated iterations.
const MAX_EXAGGERATION_ITERS: usize = 250;

/// Optimizer parameters in effect for a single iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Fraction of the previous velocity carried into this update
    pub momentum: f64,

    /// Multiplier applied to the input affinities in the attractive term
    pub exaggeration: f64,
}

/// Number of leading iterations that use early exaggeration.
///
/// A quarter of the run, capped at 250 iterations.
#[must_use]
pub fn exaggeration_iterations(max_iterations: usize) -> usize {
    (max_iterations / 4).min(MAX_EXAGGERATION_ITERS)
}

/// Calculate the optimizer parameters for iteration `itr` (0-based).
#[must_use]
pub fn find_schedule(config: &Configuration, itr: usize) -> Schedule {
    let momentum = if itr < config.momentum_switch_iteration {
        config.momentum
    } else {
        config.final_momentum
    };

    let exaggeration = if itr < exaggeration_iterations(config.max_iterations) {
        config.exaggeration_factor
    } else {
        1.0
    };

    Schedule {
        momentum,
        exaggeration,
    }
}
