use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use shared_event_bus::RecordingBus;
use shared_logging::{CaptureSink, LogLevel};
use tempfile::tempdir;

use super::*;
use crate::blend::MeanBlender;
use crate::dataset::DatasetKind;
use crate::error::ErrorKind;
use crate::pipeline::{shared, LinearRegression, MlPipeline};
use crate::testing::{
    fold_roles, foldless_roles, raw_frame, reader, CountingBlender, ScriptedTimer, StubPipeline,
};
use crate::validation::TimeSeriesSplitter;

fn linear_pipeline() -> SharedPipeline {
    shared(MlPipeline::new(vec![Box::new(LinearRegression::default())]))
}

fn memory_telemetry() -> (StackingTelemetry, Arc<CaptureSink>) {
    let sink = Arc::new(CaptureSink::new());
    let telemetry = StackingTelemetry::builder("stacking")
        .log_sink(sink.clone())
        .verbosity(3)
        .build()
        .unwrap();
    (telemetry, sink)
}

#[test]
fn two_levels_of_one_pipeline() {
    let data = RawData::from(raw_frame(100, 7));
    let roles = fold_roles();
    let mut automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![linear_pipeline()], vec![linear_pipeline()]],
    )
    .build()
    .unwrap();
    let output = automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!((output.n_rows(), output.n_cols()), (100, 1));
    let sizes: Vec<usize> = automl.levels().iter().map(Vec::len).collect();
    assert_eq!(sizes, [1, 1]);
    let stats = automl.collect_model_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats["Level_0_Pipe_0_Mod_0_LinearRegression"], 5);
    assert_eq!(stats["Level_1_Pipe_0_Mod_0_LinearRegression"], 5);
    assert!(output.data().iter().all(|value| value.is_finite()));

    let report = automl.report().unwrap();
    assert_eq!(report.levels.len(), 2);
    assert_eq!(report.levels[1].stop, Some(StopReason::LastLevel));
    assert!(report.summary().contains("levels=2"));
}

#[test]
fn multi_level_without_folds_fails_before_any_fit() {
    let data = RawData::from(raw_frame(50, 1));
    let roles = foldless_roles();
    let (first, probe) = StubPipeline::numeric(1).into_shared();
    let (second, _) = StubPipeline::numeric(1).into_shared();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![first], vec![second]])
        .build()
        .unwrap();
    let err = automl.fit_predict(FitData::new(&data, &roles)).unwrap_err();

    assert!(matches!(err, StackingError::MultiLevelWithoutFolds { levels: 2 }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(probe.fits(), 0);
    assert!(!automl.is_fitted());
}

#[test]
fn custom_splitter_allows_multiple_levels() {
    let data = RawData::from(raw_frame(100, 3));
    let roles = foldless_roles();
    let splitter = TimeSeriesSplitter::new(3);
    let mut automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![linear_pipeline()], vec![linear_pipeline()]],
    )
    .build()
    .unwrap();
    let output = automl
        .fit_predict(FitData::new(&data, &roles).cv_iter(&splitter))
        .unwrap();
    assert_eq!(output.n_rows(), 100);
    assert_eq!(automl.levels().len(), 2);
}

#[test]
fn holdout_with_multiple_levels_is_rejected() {
    let data = RawData::from(raw_frame(60, 2));
    let valid = RawData::from(raw_frame(20, 9));
    let roles = fold_roles();
    let (first, probe) = StubPipeline::numeric(1).into_shared();
    let (second, _) = StubPipeline::numeric(1).into_shared();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![first], vec![second]])
        .build()
        .unwrap();
    let err = automl
        .fit_predict(FitData::new(&data, &roles).valid(&valid))
        .unwrap_err();
    assert!(matches!(err, StackingError::MultiLevelWithHoldout { levels: 2 }));
    assert_eq!(probe.fits(), 0);
}

#[test]
fn single_level_holdout_predicts_validation_rows() {
    let data = RawData::from(raw_frame(60, 2));
    let valid = RawData::from(raw_frame(20, 9));
    let roles = fold_roles();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![linear_pipeline()]])
        .build()
        .unwrap();
    let output = automl
        .fit_predict(FitData::new(&data, &roles).valid(&valid))
        .unwrap();
    assert_eq!(output.n_rows(), 20);
    assert!(output.target().is_some());
}

#[test]
fn empty_levels_are_configuration_errors() {
    let err = AutoMl::builder(reader(DatasetKind::Numeric), Vec::new())
        .build()
        .unwrap_err();
    assert!(matches!(err, StackingError::EmptyLevels));

    let (pipe, _) = StubPipeline::numeric(1).into_shared();
    let err = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![pipe], Vec::new()])
        .build()
        .unwrap_err();
    assert!(matches!(err, StackingError::EmptyLevel { level: 1 }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn pipelines_are_named_by_position() {
    let (a, _) = StubPipeline::numeric(1).into_shared();
    let (b, _) = StubPipeline::numeric(1).into_shared();
    let (c, _) = StubPipeline::numeric(1).into_shared();
    let _automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![Arc::clone(&a), Arc::clone(&b)], vec![Arc::clone(&c)]],
    )
    .build()
    .unwrap();
    assert_eq!(a.lock().name(), "Level_0_Pipe_0");
    assert_eq!(b.lock().name(), "Level_0_Pipe_1");
    assert_eq!(c.lock().name(), "Level_1_Pipe_0");
}

#[test]
fn skip_connection_kind_mismatch_is_fatal() {
    let data = RawData::from(raw_frame(40, 4));
    let roles = fold_roles();
    let (first, _) = StubPipeline::new(DatasetKind::Sparse, 1).into_shared();
    let (second, second_probe) = StubPipeline::numeric(1).into_shared();
    let blender = CountingBlender::default();
    let calls = blender.calls();
    let (telemetry, sink) = memory_telemetry();
    let mut automl = AutoMl::builder(reader(DatasetKind::Frame), vec![vec![first], vec![second]])
        .skip_conn(true)
        .blender(blender)
        .telemetry(telemetry)
        .build()
        .unwrap();
    let err = automl.fit_predict(FitData::new(&data, &roles)).unwrap_err();

    assert!(matches!(err, StackingError::SkipConnection(_)));
    assert_eq!(err.kind(), ErrorKind::Conversion);
    assert!(err.to_string().contains("skip_conn = false"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.count("stacking.iterator.created"), 1);
    assert_eq!(second_probe.fits(), 0);
}

#[test]
fn skip_connection_appends_original_features() {
    let data = RawData::from(raw_frame(50, 5));
    let roles = fold_roles();

    let mut widths = Vec::new();
    for skip_conn in [true, false] {
        let (first, _) = StubPipeline::numeric(3).into_shared();
        let (second, probe) = StubPipeline::numeric(1).into_shared();
        let mut automl =
            AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![first], vec![second]])
                .skip_conn(skip_conn)
                .build()
                .unwrap();
        automl.fit_predict(FitData::new(&data, &roles)).unwrap();
        widths.push(probe.widths());
    }
    assert_eq!(widths, [vec![6], vec![3]]);
}

#[test]
fn skip_connection_does_not_accumulate_across_three_levels() {
    let data = RawData::from(raw_frame(50, 24));
    let roles = fold_roles();
    let (first, first_probe) = StubPipeline::numeric(3).into_shared();
    let (second, second_probe) = StubPipeline::numeric(2).into_shared();
    let (third, third_probe) = StubPipeline::numeric(1).into_shared();
    let mut automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![first], vec![second], vec![third]],
    )
    .skip_conn(true)
    .build()
    .unwrap();
    let output = automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!(output.n_rows(), 50);
    assert_eq!(first_probe.widths(), [3]);
    assert_eq!(second_probe.widths(), [3 + 3]);
    assert_eq!(third_probe.widths(), [2 + 3]);

    let fresh = RawData::from(raw_frame(15, 25));
    let predicted = automl.predict(&fresh, None).unwrap();
    assert_eq!(predicted.n_rows(), 15);
    assert_eq!(first_probe.predict_widths(), [3]);
    assert_eq!(second_probe.predict_widths(), second_probe.widths());
    assert_eq!(third_probe.predict_widths(), third_probe.widths());
}

#[test]
fn skip_connection_prediction_keeps_rows() {
    let data = RawData::from(raw_frame(80, 6));
    let roles = fold_roles();
    let mut automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![linear_pipeline(), linear_pipeline()], vec![linear_pipeline()]],
    )
    .skip_conn(true)
    .build()
    .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    let fresh = RawData::from(raw_frame(20, 11));
    let output = automl.predict(&fresh, None).unwrap();
    assert_eq!((output.n_rows(), output.n_cols()), (20, 1));
    assert!(output.data().iter().all(|value| value.is_finite()));
}

#[test]
fn timeout_on_first_pipeline_keeps_a_level() {
    let data = RawData::from(raw_frame(100, 8));
    let roles = fold_roles();
    let (a, a_probe) = StubPipeline::numeric(1).into_shared();
    let (b, b_probe) = StubPipeline::numeric(1).into_shared();
    let (c, c_probe) = StubPipeline::numeric(1).into_shared();
    let (d, d_probe) = StubPipeline::numeric(1).into_shared();
    let (telemetry, sink) = memory_telemetry();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, b, c], vec![d]])
        .timer(ScriptedTimer::exceeded_after(1))
        .telemetry(telemetry)
        .build()
        .unwrap();
    let output = automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!(output.n_rows(), 100);
    assert_eq!(automl.levels().len(), 1);
    assert_eq!(automl.levels()[0].len(), 1);
    assert_eq!(a_probe.fits(), 1);
    assert_eq!(b_probe.fits() + c_probe.fits() + d_probe.fits(), 0);
    assert_eq!(sink.count("stacking.time_limit_exceeded"), 1);
    assert_eq!(sink.count_level(LogLevel::Warn), 1);
    assert_eq!(
        automl.report().unwrap().levels[0].stop,
        Some(StopReason::TimeLimit)
    );
}

#[test]
fn weighted_mean_blend_survives_a_truncated_level() {
    let data = RawData::from(raw_frame(100, 21));
    let roles = fold_roles();
    let (a, _) = StubPipeline::numeric(1).into_shared();
    let (b, b_probe) = StubPipeline::numeric(1).into_shared();
    let (c, c_probe) = StubPipeline::numeric(1).into_shared();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, b, c]])
        .timer(ScriptedTimer::exceeded_after(1))
        .blender(MeanBlender::with_weights(vec![1.0; 3]))
        .build()
        .unwrap();
    let output = automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!(b_probe.fits() + c_probe.fits(), 0);
    assert_eq!((output.n_rows(), output.n_cols()), (100, 1));
    assert_eq!(output.features(), ["blended_prediction"]);
    assert_eq!(automl.levels()[0].len(), 1);
    assert_eq!(
        automl.report().unwrap().levels[0].stop,
        Some(StopReason::TimeLimit)
    );
    let again = automl.predict(&data, None).unwrap();
    assert_eq!(again.n_rows(), 100);
}

#[test]
fn child_timeout_ends_training_after_the_level() {
    let data = RawData::from(raw_frame(60, 12));
    let roles = fold_roles();
    let timer = PipelineTimer::unlimited();
    let budgeted = shared(
        MlPipeline::new(vec![Box::new(LinearRegression::default())])
            .with_timer(timer.task_timer(Some(Duration::ZERO))),
    );
    let (next, next_probe) = StubPipeline::numeric(1).into_shared();
    let bus = Arc::new(RecordingBus::new(32));
    let telemetry = StackingTelemetry::builder("stacking")
        .event_publisher(bus.clone())
        .build()
        .unwrap();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![budgeted], vec![next]])
        .timer(timer)
        .telemetry(telemetry)
        .build()
        .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!(automl.levels().len(), 1);
    assert_eq!(next_probe.fits(), 0);
    assert_eq!(
        automl.report().unwrap().levels[0].stop,
        Some(StopReason::ChildTimeLimit)
    );
    let limits = bus.of_kind("stacking.time_limit");
    assert_eq!(limits.len(), 1);
    assert_eq!(limits[0].payload["reason"], "child");
}

#[test]
fn remaining_budget_is_logged_per_level_and_pipeline() {
    let data = RawData::from(raw_frame(50, 23));
    let roles = fold_roles();
    let (a, _) = StubPipeline::numeric(1).into_shared();
    let (b, _) = StubPipeline::numeric(1).into_shared();
    let (telemetry, sink) = memory_telemetry();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, b]])
        .timer(PipelineTimer::new(Some(Duration::from_secs(3600))))
        .telemetry(telemetry)
        .build()
        .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    let records = sink.records();
    let left: Vec<f64> = records
        .iter()
        .filter(|r| r.key == "stacking.level.start" || r.key == "stacking.pipeline.fitted")
        .map(|r| r.field("time_left").and_then(serde_json::Value::as_f64).unwrap())
        .collect();
    assert_eq!(left.len(), 3);
    assert!(left.iter().all(|&secs| secs > 0.0 && secs <= 3600.0));

    let (a, _) = StubPipeline::numeric(1).into_shared();
    let (telemetry, sink) = memory_telemetry();
    let mut unlimited = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a]])
        .telemetry(telemetry)
        .build()
        .unwrap();
    unlimited.fit_predict(FitData::new(&data, &roles)).unwrap();
    let start = sink
        .records()
        .into_iter()
        .find(|r| r.key == "stacking.level.start")
        .unwrap();
    assert_eq!(start.field("time_left"), Some(&serde_json::Value::Null));
}

#[test]
fn single_level_builds_one_iterator_and_blends_once() {
    let data = RawData::from(raw_frame(50, 13));
    let roles = fold_roles();
    let (a, _) = StubPipeline::numeric(1).with_offset(0.5).into_shared();
    let (b, _) = StubPipeline::numeric(1).into_shared();
    let blender = CountingBlender::default();
    let calls = blender.calls();
    let (telemetry, sink) = memory_telemetry();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, Arc::clone(&b)]])
        .blender(blender)
        .telemetry(telemetry)
        .build()
        .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count("stacking.iterator.created"), 1);
    assert_eq!(automl.levels().len(), 1);
    assert!(Arc::ptr_eq(&automl.levels()[0][0], &b));
}

#[test]
fn predict_is_idempotent_and_state_checked() {
    let data = RawData::from(raw_frame(60, 14));
    let roles = fold_roles();
    let mut automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![linear_pipeline()], vec![linear_pipeline()]],
    )
    .build()
    .unwrap();
    let fresh = RawData::from(raw_frame(15, 15));
    assert!(matches!(
        automl.predict(&fresh, None),
        Err(StackingError::NotFitted)
    ));

    automl.fit_predict(FitData::new(&data, &roles)).unwrap();
    let first = automl.predict(&fresh, None).unwrap();
    let second = automl.predict(&fresh, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.n_rows(), 15);

    let err = automl.fit_predict(FitData::new(&data, &roles)).unwrap_err();
    assert!(matches!(err, StackingError::AlreadyFitted));
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn unused_features_are_pruned_from_the_reader() {
    let data = RawData::from(raw_frame(50, 16));
    let roles = fold_roles();

    let (a, _) = StubPipeline::numeric(1).with_features(&["x0"]).into_shared();
    let (b, _) = StubPipeline::numeric(1)
        .with_features(&["x1"])
        .with_offset(1.0)
        .into_shared();
    let mut best = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, b]])
        .build()
        .unwrap();
    best.fit_predict(FitData::new(&data, &roles)).unwrap();
    assert_eq!(best.collect_used_feats(), ["x0"]);
    assert_eq!(best.reader().used_features(), ["x0"]);
    assert_eq!(best.report().unwrap().pruned_features, ["x1", "x2"]);

    let (a, _) = StubPipeline::numeric(1).with_features(&["x0"]).into_shared();
    let (b, _) = StubPipeline::numeric(1).with_features(&["x1"]).into_shared();
    let mut mean = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, b]])
        .blender(MeanBlender::new())
        .build()
        .unwrap();
    mean.fit_predict(FitData::new(&data, &roles)).unwrap();
    let used = mean.collect_used_feats();
    assert!(used
        .iter()
        .all(|feature| mean.reader().used_features().contains(feature)));
    assert_eq!(mean.reader().used_features(), ["x0", "x1"]);
}

#[test]
fn model_stats_overwrite_repeated_unit_names() {
    let data = RawData::from(raw_frame(30, 17));
    let roles = fold_roles();
    let (a, _) = StubPipeline::numeric(1).with_unit("shared_unit", 3).into_shared();
    let (b, _) = StubPipeline::numeric(1).with_unit("shared_unit", 5).into_shared();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![a, b]])
        .blender(MeanBlender::new())
        .build()
        .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    let stats = automl.collect_model_stats();
    // two units, one entry: the later one wins
    assert_eq!(stats.len(), 1);
    assert_eq!(stats["shared_unit"], 5);
}

#[test]
fn lifecycle_events_are_published() {
    let data = RawData::from(raw_frame(40, 18));
    let roles = fold_roles();
    let bus = Arc::new(RecordingBus::new(64));
    let telemetry = StackingTelemetry::builder("stacking")
        .event_publisher(bus.clone())
        .verbosity(0)
        .build()
        .unwrap();
    let mut automl = AutoMl::builder(
        reader(DatasetKind::Numeric),
        vec![vec![linear_pipeline()], vec![linear_pipeline()]],
    )
    .telemetry(telemetry)
    .build()
    .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();
    automl.predict(&data, None).unwrap();

    assert_eq!(bus.of_kind("stacking.fit.started").len(), 1);
    assert_eq!(bus.of_kind("stacking.level.completed").len(), 2);
    assert_eq!(bus.of_kind("stacking.blend.completed").len(), 1);
    assert_eq!(bus.of_kind("stacking.predict.completed").len(), 1);
    assert!(bus.of_kind("stacking.time_limit").is_empty());
}

#[test]
fn orchestrator_with_events_drops_inside_async_code() {
    let data = RawData::from(raw_frame(40, 22));
    let roles = fold_roles();
    let bus = Arc::new(RecordingBus::new(64));
    let telemetry = StackingTelemetry::builder("stacking")
        .event_publisher(bus.clone())
        .build()
        .unwrap();
    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![linear_pipeline()]])
        .telemetry(telemetry)
        .build()
        .unwrap();
    automl.fit_predict(FitData::new(&data, &roles)).unwrap();
    assert_eq!(bus.of_kind("stacking.blend.completed").len(), 1);

    tokio::runtime::Runtime::new().unwrap().block_on(async move {
        let output = automl.predict(&data, None).unwrap();
        assert_eq!(output.n_rows(), 40);
        drop(automl);
    });
}

#[test]
fn from_config_logs_to_file() {
    let tmp = tempdir().unwrap();
    let log_path = tmp.path().join("stacking.log");
    let config = AutoMlConfig {
        verbose: 3,
        log_path: Some(log_path.clone()),
        blender: crate::config::BlenderConfig::Mean { weights: None },
        ..AutoMlConfig::default()
    };
    let data = RawData::from(raw_frame(40, 19));
    let roles = fold_roles();
    let mut automl = AutoMl::from_config(
        reader(DatasetKind::Numeric),
        vec![vec![linear_pipeline(), linear_pipeline()]],
        &config,
    )
    .unwrap();
    let output = automl.fit_predict(FitData::new(&data, &roles)).unwrap();

    assert_eq!(output.features(), ["blended_prediction"]);
    assert_eq!(automl.levels()[0].len(), 2);
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("stacking.level.completed"));
    assert!(content.contains("stacking.iterator.created"));
}

#[test]
fn matrix_input_needs_feature_names() {
    let frame = raw_frame(30, 20);
    let names: Vec<String> = frame.names().map(str::to_string).collect();
    let columns: Vec<&[f64]> = names.iter().map(|name| frame.column(name).unwrap()).collect();
    let matrix = ndarray::Array2::from_shape_fn((30, names.len()), |(row, col)| columns[col][row]);
    let data = RawData::from(matrix);
    let roles = fold_roles();

    let mut automl = AutoMl::builder(reader(DatasetKind::Numeric), vec![vec![linear_pipeline()]])
        .build()
        .unwrap();
    let err = automl.fit_predict(FitData::new(&data, &roles)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Collaborator);

    let output = automl
        .fit_predict(FitData::new(&data, &roles).train_features(&names))
        .unwrap();
    assert_eq!(output.n_rows(), 30);
    let inference = automl.predict(&data, Some(names.as_slice())).unwrap();
    assert_eq!(inference.n_rows(), 30);
}
