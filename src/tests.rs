use crate::{
    fit_transform, ConfigError, Configuration, DistanceMetric, EmbeddingExport, Grouping,
    Progress, RunCoordinator, RunHandle, RunInput, RunObserver, RunState, RunSummary,
    Standardization, StopReason, TsneError,
};
use ndarray::{Array1, Array2, ArrayView2};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Two tight clusters of six points each, far apart.
fn two_clusters() -> Array2<f64> {
    let offsets = [
        [0.0, 0.0],
        [0.3, 0.1],
        [0.1, 0.4],
        [0.4, 0.3],
        [0.2, 0.2],
        [0.5, 0.0],
    ];
    Array2::from_shape_fn((12, 2), |(i, j)| {
        let base = if i < 6 { 0.0 } else { 10.0 };
        base + offsets[i % 6][j]
    })
}

fn mean_row(y: ArrayView2<f64>, rows: std::ops::Range<usize>) -> Vec<f64> {
    let count = rows.len() as f64;
    let mut mean = vec![0.0; y.ncols()];
    for i in rows {
        for (m, v) in mean.iter_mut().zip(y.row(i)) {
            *m += v / count;
        }
    }
    mean
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt()
}

/// Whether the two halves of `two_clusters` lie further apart than either
/// is wide.
fn clusters_separate(y: ArrayView2<f64>) -> bool {
    let a = mean_row(y, 0..6);
    let b = mean_row(y, 6..12);
    let gap = distance(&a, &b);
    let spread = |rows: std::ops::Range<usize>, center: &[f64]| {
        rows.map(|i| {
            y.row(i)
                .iter()
                .zip(center)
                .map(|(v, c)| (v - c).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .fold(0.0, f64::max)
    };
    gap > spread(0..6, &a) && gap > spread(6..12, &b)
}

/// Records every notification for later inspection.
#[derive(Default)]
struct Recorder {
    iterations: Mutex<Vec<usize>>,
    log_lines: Mutex<Vec<String>>,
    completions: Mutex<Vec<(usize, RunSummary)>>,
}

impl RunObserver for Recorder {
    fn on_progress(&self, progress: &Progress<'_>) {
        assert_eq!(progress.snapshot.iteration(), progress.iteration);
        self.iterations.lock().push(progress.iteration);
        self.log_lines.lock().push(progress.log_line.to_owned());
    }

    fn on_complete(&self, summary: &RunSummary) {
        let seen = self.iterations.lock().len();
        self.completions.lock().push((seen, summary.clone()));
    }
}

/// Requests a stop from inside the worker once `at` iterations completed.
struct StopAt {
    at: usize,
    handle: Mutex<Option<RunHandle>>,
    requested_at: Mutex<Option<usize>>,
}

impl RunObserver for StopAt {
    fn on_progress(&self, progress: &Progress<'_>) {
        if progress.iteration < self.at || self.requested_at.lock().is_some() {
            return;
        }
        if let Some(handle) = self.handle.lock().as_ref() {
            assert_eq!(handle.state(), RunState::Running);
            assert!(handle.request_stop());
            // Joining from the worker itself must not block
            handle.join();
            *self.requested_at.lock() = Some(progress.iteration);
        }
    }
}

fn scenario_config() -> Configuration {
    Configuration::builder()
        .perplexity(3.0)
        .theta(0.0)
        .max_iterations(50)
        .min_cost(0.0)
        // Fifty iterations at the default rate are too coarse for twelve points
        .learning_rate(1.0)
        .random_seed(42)
        .build()
}

#[test]
fn test_configuration_builder() {
    let config = Configuration::builder()
        .perplexity(10.0)
        .output_dimensions(3)
        .random_seed(7)
        .build();

    assert_eq!(config.perplexity, 10.0);
    assert_eq!(config.output_dimensions, 3);
    assert_eq!(config.random_seed, Some(7));
    assert_eq!(config.theta, 0.5);
    assert_eq!(config.max_iterations, 5000);
    assert_eq!(config.distance_metric, DistanceMetric::Euclidean);

    // Builder defaults agree with Default
    assert_eq!(Configuration::builder().build(), Configuration::default());
}

#[test]
fn test_suggested_perplexity() {
    assert_eq!(Configuration::suggested_perplexity(12), 3.0);
    assert_eq!(Configuration::suggested_perplexity(1000), 30.0);
    assert_eq!(Configuration::suggested_perplexity(1), 0.0);
}

#[test]
fn test_validate() {
    let ok = Configuration::builder().perplexity(3.0).build();
    assert!(ok.validate(12).is_ok());

    assert!(matches!(
        ok.validate(1),
        Err(ConfigError::TooFewPoints(1))
    ));

    let cases = [
        (Configuration::builder().perplexity(-1.0).build(), "perplexity"),
        (Configuration::builder().perplexity(2.0).learning_rate(0.0).build(), "learning_rate"),
        (Configuration::builder().perplexity(2.0).max_iterations(0).build(), "max_iterations"),
        (Configuration::builder().perplexity(2.0).cost_interval(0).build(), "cost_interval"),
    ];
    for (config, expected) in cases {
        assert!(
            matches!(
                config.validate(12),
                Err(ConfigError::NonPositive { parameter }) if parameter == expected
            ),
            "{expected} was not rejected"
        );
    }

    let momentum = Configuration::builder().perplexity(2.0).momentum(1.5).build();
    assert!(matches!(
        momentum.validate(12),
        Err(ConfigError::NotInRange {
            parameter: "momentum",
            ..
        })
    ));

    let theta = Configuration::builder().perplexity(2.0).theta(-0.1).build();
    assert!(matches!(
        theta.validate(12),
        Err(ConfigError::NotInRange { parameter: "theta", .. })
    ));

    let dims = Configuration::builder().perplexity(2.0).output_dimensions(4).build();
    assert!(matches!(dims.validate(12), Err(ConfigError::Dimensions(4))));
}

#[test]
fn test_two_cluster_scenario() {
    let x = two_clusters();
    let recorder = Arc::new(Recorder::default());
    let mut coordinator = RunCoordinator::new();

    let handle = coordinator
        .start(
            scenario_config(),
            x.view(),
            RunInput::default(),
            Arc::clone(&recorder),
        )
        .unwrap();
    handle.join();

    assert_eq!(handle.state(), RunState::Idle);
    assert_eq!(coordinator.history().len(), 50);

    // One notification per iteration, in order, then completion
    let iterations = recorder.iterations.lock().clone();
    assert_eq!(iterations, (1..=50).collect::<Vec<_>>());
    let completions = recorder.completions.lock().clone();
    assert_eq!(completions.len(), 1);
    let (seen_before_completion, summary) = &completions[0];
    assert_eq!(*seen_before_completion, 50);
    assert_eq!(summary.iterations_completed, 50);
    assert_eq!(summary.stop_reason, StopReason::MaxIterations);
    assert!(summary.final_cost.is_finite());
    assert_eq!(handle.summary().as_ref(), Some(summary));

    // Log lines delivered with progress are lines of the final log
    let log_lines = recorder.log_lines.lock().clone();
    assert!(log_lines.iter().all(|line| summary.log.contains(line)));

    let report = coordinator.evaluate(50).unwrap();
    assert!(report.rank_correlation > 0.5, "{report:?}");
    assert_eq!(report.iterations_completed, 50);

    // Clusters end up apart in the embedding
    let last = coordinator.history().latest().unwrap();
    assert!(clusters_separate(last.positions()));
}

#[test]
fn test_two_cluster_scenario_at_default_learning_rate() {
    let x = two_clusters();
    let config = |max_iterations| {
        Configuration::builder()
            .perplexity(3.0)
            .theta(0.0)
            .max_iterations(max_iterations)
            .min_cost(0.0)
            .random_seed(3)
            .build()
    };
    let mut coordinator = RunCoordinator::new();

    // Fifty steps of size 200 on twelve points are too coarse to settle;
    // the run still completes with a finite cost
    let handle = coordinator
        .start(config(50), x.view(), RunInput::default(), ())
        .unwrap();
    handle.join();
    assert_eq!(coordinator.history().len(), 50);
    assert!(handle.summary().unwrap().final_cost.is_finite());

    // Given enough iterations the default rate separates the clusters
    coordinator
        .start(config(1000), x.view(), RunInput::default(), ())
        .unwrap()
        .join();
    assert_eq!(coordinator.history().len(), 1000);
    let report = coordinator.evaluate(1000).unwrap();
    assert!(report.rank_correlation > 0.5, "{report:?}");
    assert!(clusters_separate(coordinator.history().latest().unwrap().positions()));
}

#[test]
fn test_perplexity_too_large_is_rejected() {
    let x = Array2::from_shape_fn((5, 3), |(i, j)| (i * 3 + j) as f64);
    let mut coordinator = RunCoordinator::new();

    let result = coordinator.start(
        Configuration::builder().perplexity(2.0).build(),
        x.view(),
        RunInput::default(),
        (),
    );

    assert!(matches!(
        result,
        Err(TsneError::InvalidConfiguration(
            ConfigError::PerplexityTooLarge { n: 5, .. }
        ))
    ));
    assert!(coordinator.history().is_empty());
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[test]
fn test_mask_of_wrong_shape_is_rejected() {
    let x = two_clusters();
    let mask = Array2::from_elem((12, 3), false);
    let mut coordinator = RunCoordinator::new();

    let result = coordinator.start(
        scenario_config(),
        x.view(),
        RunInput::builder().mask(mask.view()).build(),
        (),
    );

    assert!(matches!(
        result,
        Err(TsneError::InvalidDimensions { what: "mask", .. })
    ));
    assert!(coordinator.handle().is_none());
}

#[test]
fn test_stop_is_honoured_within_one_iteration() {
    let x = two_clusters();
    let observer = Arc::new(StopAt {
        at: 5,
        handle: Mutex::new(None),
        requested_at: Mutex::new(None),
    });
    let mut coordinator = RunCoordinator::new();

    let config = Configuration::builder()
        .perplexity(3.0)
        .theta(0.0)
        .max_iterations(1_000_000)
        .min_cost(0.0)
        .build();
    let handle = coordinator
        .start(config, x.view(), RunInput::default(), Arc::clone(&observer))
        .unwrap();
    *observer.handle.lock() = Some(handle.clone());
    handle.join();

    let requested_at = observer.requested_at.lock().unwrap();
    let stored = coordinator.history().len();
    assert!(stored <= requested_at + 1, "{stored} > {requested_at} + 1");
    assert_eq!(handle.summary().unwrap().stop_reason, StopReason::Requested);

    // Nothing is appended after the worker has been joined
    thread::sleep(Duration::from_millis(20));
    assert_eq!(coordinator.history().len(), stored);
}

#[test]
fn test_second_run_replaces_history() {
    let x = two_clusters();
    let mut coordinator = RunCoordinator::new();

    let first = coordinator
        .start(scenario_config(), x.view(), RunInput::default(), ())
        .unwrap();

    // Not joined yet: a second start is refused
    assert!(matches!(
        coordinator.start(scenario_config(), x.view(), RunInput::default(), ()),
        Err(TsneError::RunAlreadyActive)
    ));

    first.join();
    let old = coordinator.history().get(50).unwrap();

    let config = Configuration::builder()
        .perplexity(3.0)
        .theta(0.0)
        .max_iterations(20)
        .min_cost(0.0)
        .random_seed(1)
        .build();
    let second = coordinator
        .start(config, x.view(), RunInput::default(), ())
        .unwrap();
    second.join();

    assert_eq!(coordinator.history().len(), 20);
    assert!(matches!(
        coordinator.history().get(21),
        Err(TsneError::OutOfRange {
            iteration: 21,
            available: 20
        })
    ));

    // Earlier readers keep their snapshot
    assert_eq!(old.iteration(), 50);
}

#[test]
fn test_restart_stops_active_run() {
    let x = two_clusters();
    let mut coordinator = RunCoordinator::new();

    let long = Configuration::builder()
        .perplexity(3.0)
        .theta(0.0)
        .max_iterations(1_000_000)
        .min_cost(0.0)
        .build();
    let first = coordinator
        .start(long, x.view(), RunInput::default(), ())
        .unwrap();

    let second = coordinator
        .restart(scenario_config(), x.view(), RunInput::default(), ())
        .unwrap();
    assert_eq!(first.state(), RunState::Idle);
    assert_eq!(
        first.summary().map(|s| s.stop_reason),
        Some(StopReason::Requested)
    );

    second.join();
    assert_eq!(coordinator.history().len(), 50);
}

#[test]
fn test_export_and_save() {
    let x = two_clusters();
    let labels: Vec<&str> = (0..12).map(|i| if i < 6 { "west" } else { "east" }).collect();
    let mut coordinator = RunCoordinator::new();

    let config = Configuration::builder()
        .perplexity(3.0)
        .theta(0.0)
        .max_iterations(10)
        .min_cost(0.0)
        .output_dimensions(3)
        .build();
    let input = RunInput::builder()
        .grouping(Grouping::from_labels(&labels))
        .build();
    coordinator
        .start(config, x.view(), input, ())
        .unwrap()
        .join();

    let mut sink: Vec<EmbeddingExport> = Vec::new();
    coordinator.save_to(7, &mut sink).unwrap();
    assert!(coordinator.save_to(11, &mut sink).is_err());
    assert_eq!(sink.len(), 1);

    let export = &sink[0];
    let labels: Vec<&str> = export.columns.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, ["V1", "V2", "V3"]);
    assert!(export.columns.iter().all(|c| c.values.len() == 12));
    assert!(export.columns.iter().all(|c| c.undefined.iter().all(|u| !u)));
    assert_eq!(export.report.iterations_completed, 7);

    let snapshot = coordinator.history().get(7).unwrap();
    assert_eq!(export.columns[2].values[4], snapshot.positions()[[4, 2]]);

    let grouping = export.grouping.as_ref().unwrap();
    assert_eq!(grouping.groups()[0].label, "east");
    assert_eq!(grouping.groups()[0].members, (6..12).collect::<Vec<_>>());
}

#[test]
fn test_masked_weighted_approximate_run() {
    let mut x = two_clusters();
    let mut mask = Array2::from_elem((12, 2), false);
    x[[3, 1]] = 1000.0;
    mask[[3, 1]] = true;
    let weights = Array1::from_vec(vec![1.0, 2.0]);

    let config = Configuration::builder()
        .perplexity(3.0)
        .theta(0.5)
        .max_iterations(30)
        .min_cost(0.0)
        .standardization(Standardization::ZScore)
        .distance_metric(DistanceMetric::Manhattan)
        .random_seed(3)
        .build();

    let mut coordinator = RunCoordinator::new();
    coordinator
        .start(
            config,
            x.view(),
            RunInput::builder()
                .mask(mask.view())
                .weights(weights.view())
                .build(),
            (),
        )
        .unwrap()
        .join();

    assert_eq!(coordinator.history().len(), 30);
    let report = coordinator.evaluate(30).unwrap();
    assert!((-1.0..=1.0).contains(&report.rank_correlation));
    assert!(coordinator
        .history()
        .latest()
        .unwrap()
        .positions()
        .iter()
        .all(|v| v.is_finite()));
}

#[test]
fn test_three_dimensional_approximate_run() {
    let x = two_clusters();
    let config = Configuration::builder()
        .perplexity(3.0)
        .theta(0.5)
        .output_dimensions(3)
        .max_iterations(200)
        .min_cost(0.0)
        .learning_rate(1.0)
        .random_seed(5)
        .build();

    let mut coordinator = RunCoordinator::new();
    coordinator
        .start(config, x.view(), RunInput::default(), ())
        .unwrap()
        .join();

    let last = coordinator.history().latest().unwrap();
    assert_eq!(last.positions().dim(), (12, 3));
    assert!(last.positions().iter().all(|v| v.is_finite()));
    let report = coordinator.evaluate(200).unwrap();
    assert!(report.rank_correlation > 0.5, "{report:?}");
    assert!(clusters_separate(last.positions()));
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let x = two_clusters();
    let (a, _) = fit_transform(x.view(), scenario_config()).unwrap();
    let (b, _) = fit_transform(x.view(), scenario_config()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_fit_transform() {
    let x = two_clusters();
    let config = Configuration::builder()
        .perplexity(Configuration::suggested_perplexity(12))
        .max_iterations(100)
        .random_seed(42)
        .build();

    let (embedding, summary) = fit_transform(x.view(), config).unwrap();
    assert_eq!(embedding.dim(), (12, 2));
    assert!(embedding.iter().all(|v| v.is_finite()));
    assert!(summary.iterations_completed <= 100);
    assert!(summary.log.len() >= 2);

    // Re-centred after every step
    for column in embedding.columns() {
        let scale = 1.0 + column.iter().map(|v| v.abs()).sum::<f64>();
        assert!(column.sum().abs() < 1e-9 * scale);
    }
}

#[test]
fn test_drop_stops_running_worker() {
    let x = two_clusters();
    let recorder = Arc::new(Recorder::default());
    {
        let mut coordinator = RunCoordinator::new();
        let config = Configuration::builder()
            .perplexity(3.0)
            .theta(0.0)
            .max_iterations(1_000_000)
            .min_cost(0.0)
            .build();
        coordinator
            .start(config, x.view(), RunInput::default(), Arc::clone(&recorder))
            .unwrap();
    }

    let completions = recorder.completions.lock().clone();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1.stop_reason, StopReason::Requested);
}
