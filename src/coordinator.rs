//! Asynchronous run lifecycle.
//!
//! A [`RunCoordinator`] owns the state shared across runs: the snapshot
//! history, the original-space distances of the latest run and its grouping.
//! Each call to [`RunCoordinator::start`] validates its inputs on the calling
//! thread, then hands the optimization to a dedicated worker thread and
//! returns a [`RunHandle`] at once.
//!
//! Run states move `Idle → Running → {Done | StopRequested → Done}` and back
//! to `Idle` once the worker is joined. Stopping is cooperative: the worker
//! checks the state at the top of every iteration, so at most one more
//! iteration completes after [`RunHandle::request_stop`]. A stopped run cannot
//! be resumed; the next run starts from a fresh random embedding.

use crate::affinity::Affinities;
use crate::distance::{check_inputs, DistanceMatrix, DistanceMetric};
use crate::export::{EmbeddingExport, Grouping, ResultSink};
use crate::fidelity::{evaluate, FidelityReport};
use crate::history::{EmbeddingSnapshot, SnapshotHistory};
use crate::optimizer::{optimize, Outcome, StopReason};
use crate::{initial_embedding, neighbor_count, Configuration, TsneError};
use bon::Builder;
use ndarray::{Array2, ArrayView1, ArrayView2};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

/// Name given to worker threads.
const WORKER_NAME: &str = "tsne-worker";

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// No run is active, or the last one has been joined
    Idle = 0,

    /// The worker is iterating
    Running = 1,

    /// A stop was requested and the worker has not yet exited
    StopRequested = 2,

    /// The worker finished and is waiting to be joined
    Done = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::StopRequested,
            3 => RunState::Done,
            _ => RunState::Idle,
        }
    }
}

/// Completion payload of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Cost of the final embedding
    pub final_cost: f64,

    /// Number of completed iterations
    pub iterations_completed: usize,

    /// Why the run ended
    pub stop_reason: StopReason,

    /// Full run log, oldest line first
    pub log: Vec<String>,
}

impl From<&Outcome> for RunSummary {
    fn from(outcome: &Outcome) -> Self {
        Self {
            final_cost: outcome.final_cost,
            iterations_completed: outcome.iterations_completed,
            stop_reason: outcome.stop_reason,
            log: outcome.log.clone(),
        }
    }
}

/// Progress notification for one completed iteration.
#[derive(Clone, Copy, Debug)]
pub struct Progress<'a> {
    /// 1-based iteration that just completed
    pub iteration: usize,

    /// Snapshot already appended to the history
    pub snapshot: &'a Arc<EmbeddingSnapshot>,

    /// Newest line of the run log
    pub log_line: &'a str,
}

/// Receives notifications from the worker thread.
///
/// Progress arrives once per completed iteration in increasing order. The
/// completion notification follows the last progress notification, after the
/// run state has become [`RunState::Done`].
pub trait RunObserver: Send + Sync {
    /// Called after each completed iteration.
    fn on_progress(&self, progress: &Progress<'_>) {
        let _ = progress;
    }

    /// Called once when the run ends.
    fn on_complete(&self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// Ignores every notification.
impl RunObserver for () {}

impl<T: RunObserver + ?Sized> RunObserver for Arc<T> {
    fn on_progress(&self, progress: &Progress<'_>) {
        (**self).on_progress(progress);
    }

    fn on_complete(&self, summary: &RunSummary) {
        (**self).on_complete(summary);
    }
}

/// Optional per-run inputs besides the feature matrix.
#[derive(Builder, Clone, Debug, Default)]
pub struct RunInput<'a> {
    /// `(n, m)` missing-value mask; `true` marks a missing cell
    pub mask: Option<ArrayView2<'a, bool>>,

    /// Per-column distance weights, length `m`
    pub weights: Option<ArrayView1<'a, f64>>,

    /// Observation grouping carried through to exports
    pub grouping: Option<Grouping>,
}

#[derive(Debug)]
struct RunControl {
    state: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: OnceLock<ThreadId>,
    summary: Mutex<Option<RunSummary>>,
}

impl RunControl {
    fn new(state: RunState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            worker: Mutex::new(None),
            worker_id: OnceLock::new(),
            summary: Mutex::new(None),
        }
    }

    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle to a started run.
///
/// Clones refer to the same run.
#[derive(Clone, Debug)]
pub struct RunHandle {
    control: Arc<RunControl>,
}

impl RunHandle {
    /// Asks the worker to stop before its next iteration.
    ///
    /// Returns `false` when the run was not running.
    pub fn request_stop(&self) -> bool {
        self.control
            .state
            .compare_exchange(
                RunState::Running as u8,
                RunState::StopRequested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Blocks until the worker has exited, then returns the run to
    /// [`RunState::Idle`].
    ///
    /// Safe to call repeatedly and from several threads. Called from the
    /// worker itself (for example inside an observer) it returns immediately.
    /// A panic raised on the worker is logged here and not propagated.
    pub fn join(&self) {
        if self.control.worker_id.get() == Some(&thread::current().id()) {
            return;
        }

        let mut worker = self.control.worker.lock();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("t-SNE worker panicked; run ended without completion");
            }
            debug!("Joined t-SNE worker");
        }

        self.control.set_state(RunState::Idle);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.control.state()
    }

    /// Completion payload, available once the run is done.
    #[must_use]
    pub fn summary(&self) -> Option<RunSummary> {
        self.control.summary.lock().clone()
    }

    fn stop_requested(&self) -> bool {
        self.state() == RunState::StopRequested
    }
}

/// Body of a worker thread.
type WorkerTask = Box<dyn FnOnce() + Send + 'static>;

/// A validated run waiting for its worker.
struct PreparedRun {
    config: Configuration,
    context: RunContext,
    y: Array2<f64>,
}

/// Inputs of the latest run needed to evaluate and export its snapshots.
#[derive(Debug)]
struct RunContext {
    distances: Arc<DistanceMatrix>,
    metric: DistanceMetric,
    grouping: Option<Grouping>,
}

/// Session object coordinating one run at a time.
///
/// Dropping the coordinator stops and joins the active run.
#[derive(Debug, Default)]
pub struct RunCoordinator {
    history: Arc<SnapshotHistory>,
    active: Option<RunHandle>,
    context: Option<RunContext>,
}

impl RunCoordinator {
    /// Creates a coordinator with an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates inputs and starts a run on a new worker thread.
    ///
    /// Features are standardized and original-space distances are computed
    /// on the calling thread; affinities and the optimization run on the
    /// worker. The previous history is replaced only once every check has
    /// passed and the worker thread exists.
    ///
    /// # Arguments
    /// * `config` - Run configuration
    /// * `features` - `(n, m)` feature matrix, one observation per row
    /// * `input` - Optional mask, column weights and grouping
    /// * `observer` - Receives progress and completion notifications
    ///
    /// # Errors
    /// * `TsneError::RunAlreadyActive` if the previous run has not been joined
    /// * `TsneError::InvalidConfiguration` if the configuration does not fit
    ///   `n` observations
    /// * `TsneError::InvalidDimensions` if the mask, weights or grouping do
    ///   not match the feature matrix
    /// * `TsneError::NegativeWeight` if a column weight is negative
    /// * `TsneError::Normal` if the initial embedding cannot be drawn
    /// * `TsneError::Spawn` if the worker thread cannot be created
    pub fn start<O>(
        &mut self,
        config: Configuration,
        features: ArrayView2<f64>,
        input: RunInput<'_>,
        observer: O,
    ) -> Result<RunHandle, TsneError>
    where
        O: RunObserver + 'static,
    {
        if self.state() != RunState::Idle {
            return Err(TsneError::RunAlreadyActive);
        }

        let n = features.nrows();
        config.validate(n)?;

        if let Some(grouping) = &input.grouping {
            if grouping.n_points() != n {
                return Err(TsneError::InvalidDimensions {
                    what: "grouping",
                    expected: vec![n],
                    actual: vec![grouping.n_points()],
                });
            }
        }
        check_inputs(features, input.mask, input.weights)?;

        let standardized = config.standardization.apply(features, input.mask);
        let distances = DistanceMatrix::build(
            standardized.view(),
            input.mask,
            input.weights,
            config.distance_metric,
        )?;
        let y = initial_embedding(n, config.output_dimensions, config.random_seed)?;

        let metric = config.distance_metric;
        let run = PreparedRun {
            config,
            context: RunContext {
                distances: Arc::new(distances),
                metric,
                grouping: input.grouping,
            },
            y,
        };
        self.launch(run, observer, |task| {
            thread::Builder::new()
                .name(WORKER_NAME.to_owned())
                .spawn(task)
        })
    }

    /// Hands a validated run to a worker created by `spawn`.
    ///
    /// The history and context of the previous run are replaced only once
    /// the worker exists.
    fn launch<O, F>(
        &mut self,
        run: PreparedRun,
        observer: O,
        spawn: F,
    ) -> Result<RunHandle, TsneError>
    where
        O: RunObserver + 'static,
        F: FnOnce(WorkerTask) -> io::Result<JoinHandle<()>>,
    {
        let PreparedRun { config, context, y } = run;
        let n = y.nrows();
        let handle = RunHandle {
            control: Arc::new(RunControl::new(RunState::Running)),
        };

        let worker = Worker {
            config,
            distances: Arc::clone(&context.distances),
            history: Arc::clone(&self.history),
            handle: handle.clone(),
        };

        let task: WorkerTask = Box::new(move || worker.run(y, &observer));
        let previous = self.history.take();
        let join_handle = match spawn(task) {
            Ok(join_handle) => join_handle,
            Err(e) => {
                self.history.restore(previous);
                handle.control.set_state(RunState::Idle);
                return Err(TsneError::Spawn(e));
            }
        };
        *handle.control.worker.lock() = Some(join_handle);
        self.context = Some(context);

        debug!("Started t-SNE run on {n} points");
        self.active = Some(handle.clone());
        Ok(handle)
    }

    /// Stops and joins any active run, then starts a new one.
    ///
    /// # Errors
    /// Same as [`start`](Self::start), except `RunAlreadyActive`.
    pub fn restart<O>(
        &mut self,
        config: Configuration,
        features: ArrayView2<f64>,
        input: RunInput<'_>,
        observer: O,
    ) -> Result<RunHandle, TsneError>
    where
        O: RunObserver + 'static,
    {
        if let Some(active) = &self.active {
            active.request_stop();
            active.join();
        }
        self.start(config, features, input, observer)
    }

    /// Snapshot history of the current or most recent run.
    #[must_use]
    pub fn history(&self) -> &Arc<SnapshotHistory> {
        &self.history
    }

    /// Handle of the current or most recent run.
    #[must_use]
    pub fn handle(&self) -> Option<&RunHandle> {
        self.active.as_ref()
    }

    /// State of the current or most recent run, `Idle` before the first.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.active.as_ref().map_or(RunState::Idle, RunHandle::state)
    }

    /// Fidelity of the snapshot stored for `iteration`.
    ///
    /// # Errors
    /// * `TsneError::NoRun` if no run has been started
    /// * `TsneError::OutOfRange` if no snapshot exists for `iteration`
    /// * `TsneError::EmptyInput` if the run has fewer than two points
    pub fn evaluate(&self, iteration: usize) -> Result<FidelityReport, TsneError> {
        let context = self.context.as_ref().ok_or(TsneError::NoRun)?;
        let snapshot = self.history.get(iteration)?;
        evaluate(&context.distances, &snapshot, context.metric)
    }

    /// Builds the export for the snapshot stored for `iteration`.
    ///
    /// # Errors
    /// Same as [`evaluate`](Self::evaluate).
    pub fn export(&self, iteration: usize) -> Result<EmbeddingExport, TsneError> {
        let context = self.context.as_ref().ok_or(TsneError::NoRun)?;
        let snapshot = self.history.get(iteration)?;
        let report = evaluate(&context.distances, &snapshot, context.metric)?;
        Ok(EmbeddingExport::new(
            &snapshot,
            context.grouping.clone(),
            report,
        ))
    }

    /// Exports `iteration` and hands it to `sink`.
    ///
    /// # Errors
    /// Same as [`evaluate`](Self::evaluate); nothing reaches the sink on
    /// error.
    pub fn save_to<S>(&self, iteration: usize, sink: &mut S) -> Result<(), TsneError>
    where
        S: ResultSink + ?Sized,
    {
        sink.accept(self.export(iteration)?);
        Ok(())
    }
}

impl Drop for RunCoordinator {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.request_stop();
            active.join();
        }
    }
}

/// Everything a worker thread owns for one run.
struct Worker {
    config: Configuration,
    distances: Arc<DistanceMatrix>,
    history: Arc<SnapshotHistory>,
    handle: RunHandle,
}

impl Worker {
    fn run<O: RunObserver>(self, y: Array2<f64>, observer: &O) {
        let _ = self.handle.control.worker_id.set(thread::current().id());
        let n = self.distances.n_points();
        let p = Affinities::from_distances(
            &self.distances,
            self.config.perplexity,
            neighbor_count(&self.config, n),
        );

        let outcome = optimize(
            &self.config,
            &p,
            y,
            || self.handle.stop_requested(),
            |iteration, positions, cost, log_line| {
                let snapshot = Arc::new(EmbeddingSnapshot::new(
                    iteration,
                    positions.to_owned(),
                    cost,
                ));
                self.history.append(Arc::clone(&snapshot));
                observer.on_progress(&Progress {
                    iteration,
                    snapshot: &snapshot,
                    log_line,
                });
            },
        );

        let summary = RunSummary::from(&outcome);
        debug!(
            "t-SNE run finished after {} iterations ({:?})",
            summary.iterations_completed, summary.stop_reason
        );

        *self.handle.control.summary.lock() = Some(summary.clone());
        self.handle.control.set_state(RunState::Done);
        observer.on_complete(&summary);
    }
}
