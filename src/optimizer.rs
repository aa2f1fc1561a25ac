//! Gradient descent with momentum and per-coordinate adaptive gains.
//!
//! Each coordinate keeps a gain that grows additively while successive steps
//! keep reversing direction and shrinks multiplicatively while they agree.
//! After every step the embedding is re-centred on the origin.

use crate::affinity::Affinities;
use crate::gradient::{kl_divergence, tsne_grad};
use crate::schedule::find_schedule;
use crate::Configuration;
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis, Zip};
use std::time::Instant;
use tracing::{debug, warn};

/// Smallest gain a coordinate may shrink to.
const MIN_GAIN: f64 = 0.01;

/// Why an optimization run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StopReason {
    /// The configured number of iterations completed
    MaxIterations,

    /// The most recently evaluated cost fell below the configured minimum
    MinCost,

    /// A stop was requested from outside the optimizer
    Requested,
}

/// Result of an optimization run.
#[derive(Clone, Debug)]
pub struct Outcome {
    /// Final embedding coordinates
    pub embedding: Array2<f64>,

    /// Cost of the final embedding
    pub final_cost: f64,

    /// Number of completed iterations
    pub iterations_completed: usize,

    /// Why the run ended
    pub stop_reason: StopReason,

    /// Human-readable progress log, oldest line first
    pub log: Vec<String>,
}

/// `-1`, `0` or `1` depending on the sign of `x`, with `sign(0) = 0`.
#[inline]
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Applies one gains-and-momentum step and re-centres the embedding.
///
/// # Arguments
/// * `y` - Embedding coordinates to update
/// * `grad` - Gradient for this iteration
/// * `velocity` - Previous update, overwritten with this iteration's update
/// * `gains` - Per-coordinate step multipliers
/// * `momentum` - Fraction of the previous update carried over
/// * `lr` - Learning rate
///
/// # Panics
/// * If the arrays do not all have the same shape
pub fn update_embedding_gains(
    mut y: ArrayViewMut2<f64>,
    grad: ArrayView2<f64>,
    velocity: ArrayViewMut2<f64>,
    gains: ArrayViewMut2<f64>,
    momentum: f64,
    lr: f64,
) {
    Zip::from(&mut y)
        .and(grad)
        .and(velocity)
        .and(gains)
        .par_for_each(|y, &g, u, gain| {
            let adapted = if sign(g) == sign(*u) {
                *gain * 0.8
            } else {
                *gain + 0.2
            };
            *gain = adapted.max(MIN_GAIN);
            *u = momentum * *u - lr * *gain * g;
            *y += *u;
        });

    zero_mean(y);
}

/// Subtracts the column means from `y`.
fn zero_mean(mut y: ArrayViewMut2<f64>) {
    if let Some(mean) = y.mean_axis(Axis(0)) {
        y -= &mean;
    }
}

/// Whether the cost is evaluated after iteration `iteration` (1-based).
fn evaluates_cost(config: &Configuration, iteration: usize) -> bool {
    iteration == 1
        || iteration % config.cost_interval == 0
        || iteration == config.max_iterations
}

/// Runs the optimizer until it converges, exhausts its iterations, or is
/// asked to stop.
///
/// Termination is checked at the top of every iteration, in this order: a
/// stop request, the iteration cap, then the most recent cost against
/// `min_cost`. The cost is evaluated on iteration 1, every `cost_interval`
/// iterations and on the last allowed iteration; between evaluations the
/// latest value is carried forward.
///
/// # Arguments
/// * `config` - Validated run configuration
/// * `p` - Input affinities
/// * `y` - Initial embedding, moved into the optimizer
/// * `should_stop` - Polled once per iteration
/// * `on_iteration` - Called after each completed iteration with the 1-based
///   iteration number, the embedding, the latest cost and the newest log line
pub(crate) fn optimize<S, F>(
    config: &Configuration,
    p: &Affinities,
    mut y: Array2<f64>,
    mut should_stop: S,
    mut on_iteration: F,
) -> Outcome
where
    S: FnMut() -> bool,
    F: FnMut(usize, ArrayView2<f64>, f64, &str),
{
    let start_time = Instant::now();
    let mut velocity = Array2::zeros(y.dim());
    let mut gains = Array2::ones(y.dim());
    let mut log = vec![format!(
        "Learning embedding of {} points in {} dimensions (perplexity {}, theta {})",
        y.nrows(),
        y.ncols(),
        config.perplexity,
        config.theta
    )];

    let mut completed = 0;
    let mut cost = f64::INFINITY;
    let mut last_evaluated = None;
    let mut interval_start = Instant::now();

    let stop_reason = loop {
        if should_stop() {
            break StopReason::Requested;
        }
        if completed >= config.max_iterations {
            break StopReason::MaxIterations;
        }
        if cost < config.min_cost {
            break StopReason::MinCost;
        }

        let schedule = find_schedule(config, completed);
        let grad = tsne_grad(y.view(), p, schedule.exaggeration, config.theta);
        update_embedding_gains(
            y.view_mut(),
            grad.view(),
            velocity.view_mut(),
            gains.view_mut(),
            schedule.momentum,
            config.learning_rate,
        );
        completed += 1;

        if evaluates_cost(config, completed) {
            cost = kl_divergence(y.view(), p, config.theta);
            if !cost.is_finite() {
                warn!("Cost is {cost} at iteration {completed}");
            }

            let line = format!(
                "Iteration {completed}: error is {cost} ({:.2?})",
                interval_start.elapsed()
            );
            debug!("{line}");
            log.push(line);
            last_evaluated = Some(completed);
            interval_start = Instant::now();
        }

        on_iteration(completed, y.view(), cost, log.last().map_or("", String::as_str));
    };

    // A requested stop can land between evaluations
    if last_evaluated != Some(completed) {
        cost = kl_divergence(y.view(), p, config.theta);
    }

    let elapsed = start_time.elapsed();
    log.push(format!(
        "Stopped after {completed} iterations ({stop_reason:?}), final error {cost}, total time {elapsed:.2?}"
    ));
    debug!("Elapsed time: {:.2?}", elapsed);

    Outcome {
        embedding: y,
        final_cost: cost,
        iterations_completed: completed,
        stop_reason,
        log,
    }
}
