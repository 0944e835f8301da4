//! Multi-level stacking orchestrator.
//!
//! Levels of pipelines are trained in order. Each inner level's
//! out-of-fold predictions (optionally joined with the original features)
//! become the next level's training data; the last level is blended into
//! the final prediction. A global timer may cut training short between
//! pipeline fits, in which case the level being trained becomes the last.

mod level;
mod report;

use std::sync::Arc;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::blend::{BestModelSelector, Blender, LevelPredictions};
use crate::config::AutoMlConfig;
use crate::dataset::Dataset;
use crate::error::StackingError;
use crate::pipeline::SharedPipeline;
use crate::reader::{RawData, Reader, Roles};
use crate::telemetry::StackingTelemetry;
use crate::timer::{PipelineTimer, Timer};
use crate::validation::{create_validation_iterator, CvSplitter};

use level::{skip_connect, LevelRecord};

pub use level::StopReason;
pub use report::{LevelSummary, StackingReport};

/// Inputs of [`AutoMl::fit_predict`].
#[derive(Debug, Clone, Copy)]
pub struct FitData<'a> {
    train: &'a RawData,
    roles: &'a Roles,
    train_features: Option<&'a [String]>,
    cv_iter: Option<&'a dyn CvSplitter>,
    valid: Option<&'a RawData>,
    valid_features: Option<&'a [String]>,
}

impl<'a> FitData<'a> {
    /// Training data and its column roles.
    #[must_use]
    pub const fn new(train: &'a RawData, roles: &'a Roles) -> Self {
        Self {
            train,
            roles,
            train_features: None,
            cv_iter: None,
            valid: None,
            valid_features: None,
        }
    }

    /// Column names for a matrix `train`.
    #[must_use]
    pub const fn train_features(mut self, features: &'a [String]) -> Self {
        self.train_features = Some(features);
        self
    }

    /// Custom cross-validation scheme.
    #[must_use]
    pub const fn cv_iter(mut self, splitter: &'a dyn CvSplitter) -> Self {
        self.cv_iter = Some(splitter);
        self
    }

    /// Holdout validation data. Only valid with a single level.
    #[must_use]
    pub const fn valid(mut self, valid: &'a RawData) -> Self {
        self.valid = Some(valid);
        self
    }

    /// Column names for a matrix `valid`.
    #[must_use]
    pub const fn valid_features(mut self, features: &'a [String]) -> Self {
        self.valid_features = Some(features);
        self
    }
}

/// Builder for [`AutoMl`].
#[derive(Debug)]
pub struct AutoMlBuilder {
    reader: Box<dyn Reader>,
    levels: Vec<Vec<SharedPipeline>>,
    timer: Box<dyn Timer>,
    blender: Box<dyn Blender>,
    skip_conn: bool,
    telemetry: Option<StackingTelemetry>,
}

impl AutoMlBuilder {
    /// Replaces the default unlimited timer.
    #[must_use]
    pub fn timer(mut self, timer: impl Timer + 'static) -> Self {
        self.timer = Box::new(timer);
        self
    }

    /// Replaces the default [`BestModelSelector`].
    #[must_use]
    pub fn blender(mut self, blender: impl Blender + 'static) -> Self {
        self.blender = Box::new(blender);
        self
    }

    /// Appends the original features to every inner level's predictions.
    #[must_use]
    pub fn skip_conn(mut self, skip_conn: bool) -> Self {
        self.skip_conn = skip_conn;
        self
    }

    /// Attaches log and event sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: StackingTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Takes timer, blender and skip connections from `config`.
    #[must_use]
    pub fn apply_config(mut self, config: &AutoMlConfig) -> Self {
        self.timer = Box::new(config.timer());
        self.blender = config.blender.build();
        self.skip_conn = config.skip_conn;
        self
    }

    /// Validates the levels and names every pipeline `Level_<i>_Pipe_<j>`.
    pub fn build(self) -> Result<AutoMl, StackingError> {
        if self.levels.is_empty() {
            return Err(StackingError::EmptyLevels);
        }
        if let Some(level) = self.levels.iter().position(Vec::is_empty) {
            return Err(StackingError::EmptyLevel { level });
        }
        for (i, level) in self.levels.iter().enumerate() {
            for (j, pipe) in level.iter().enumerate() {
                pipe.lock().upd_model_names(&format!("Level_{i}_Pipe_{j}"));
            }
        }
        Ok(AutoMl {
            reader: self.reader,
            pending: Some(self.levels),
            levels: Vec::new(),
            timer: self.timer,
            blender: self.blender,
            skip_conn: self.skip_conn,
            telemetry: self.telemetry,
            report: None,
        })
    }
}

/// Multi-level stacking orchestrator.
#[derive(Debug)]
pub struct AutoMl {
    reader: Box<dyn Reader>,
    pending: Option<Vec<Vec<SharedPipeline>>>,
    levels: Vec<Vec<SharedPipeline>>,
    timer: Box<dyn Timer>,
    blender: Box<dyn Blender>,
    skip_conn: bool,
    telemetry: Option<StackingTelemetry>,
    report: Option<StackingReport>,
}

impl AutoMl {
    /// Starts a builder with an unlimited timer, a [`BestModelSelector`] and
    /// no skip connections.
    #[must_use]
    pub fn builder(reader: impl Reader + 'static, levels: Vec<Vec<SharedPipeline>>) -> AutoMlBuilder {
        AutoMlBuilder {
            reader: Box::new(reader),
            levels,
            timer: Box::new(PipelineTimer::unlimited()),
            blender: Box::new(BestModelSelector::default()),
            skip_conn: false,
            telemetry: None,
        }
    }

    /// Builds an orchestrator from `config`, logging to `config.log_path`
    /// when set.
    pub fn from_config(
        reader: impl Reader + 'static,
        levels: Vec<Vec<SharedPipeline>>,
        config: &AutoMlConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let mut builder = Self::builder(reader, levels).apply_config(config);
        if let Some(path) = &config.log_path {
            builder = builder.telemetry(
                StackingTelemetry::builder("stacking")
                    .log_path(path)
                    .verbosity(config.verbose)
                    .build()?,
            );
        }
        Ok(builder.build()?)
    }

    /// Attaches telemetry sinks after construction.
    pub fn set_telemetry(&mut self, telemetry: StackingTelemetry) {
        self.telemetry = Some(telemetry);
    }

    /// Trains every level and returns the blended out-of-fold prediction.
    ///
    /// Can be called once; the configured levels are replaced by the
    /// retained ones on success.
    pub fn fit_predict(&mut self, data: FitData<'_>) -> Result<Dataset, StackingError> {
        let levels = self.pending.clone().ok_or(StackingError::AlreadyFitted)?;
        let started = Instant::now();
        self.timer.start();
        self.event(
            "stacking.fit.started",
            json!({ "levels": levels.len(), "skip_conn": self.skip_conn }),
        );

        let train = self
            .reader
            .fit_read(data.train, data.train_features, data.roles)?;
        let n_levels = levels.len();
        if n_levels > 1 && train.folds().is_none() && data.cv_iter.is_none() {
            return Err(StackingError::MultiLevelWithoutFolds { levels: n_levels });
        }
        if n_levels > 1 && data.valid.is_some() {
            return Err(StackingError::MultiLevelWithHoldout { levels: n_levels });
        }
        let valid = data
            .valid
            .map(|raw| self.reader.read(raw, data.valid_features, true))
            .transpose()?;

        let mut train_valid = create_validation_iterator(train, valid, None, data.cv_iter)?;
        self.log(
            LogLevel::Debug,
            "stacking.iterator.created",
            json!({ "level": 0, "kind": train_valid.kind(), "splits": train_valid.len() }),
        );
        let original = train_valid.get_validation_data().clone();

        let mut records: Vec<LevelRecord> = Vec::with_capacity(n_levels);
        for (index, level) in levels.iter().enumerate() {
            self.log(
                LogLevel::Info,
                "stacking.level.start",
                json!({ "level": index, "pipelines": level.len(), "time_left": self.secs_left() }),
            );
            let mut pipelines = Vec::with_capacity(level.len());
            let mut parts = Vec::with_capacity(level.len());
            let mut stop = None;
            for (pipe_index, pipe) in level.iter().enumerate() {
                let (prediction, name) = {
                    let mut pipeline = pipe.lock();
                    let prediction = pipeline.fit_predict(&train_valid).map_err(|source| {
                        StackingError::Pipeline {
                            level: index,
                            pipe: pipe_index,
                            source,
                        }
                    })?;
                    (prediction, pipeline.name().to_string())
                };
                self.log(
                    LogLevel::Debug,
                    "stacking.pipeline.fitted",
                    json!({
                        "level": index,
                        "pipe": name,
                        "columns": prediction.n_cols(),
                        "time_left": self.secs_left(),
                    }),
                );
                parts.push(prediction);
                pipelines.push(Arc::clone(pipe));
                if self.timer.time_limit_exceeded() {
                    let skipped = level.len() - pipelines.len();
                    self.log(
                        LogLevel::Warn,
                        "stacking.time_limit_exceeded",
                        json!({ "level": index, "fitted": pipelines.len(), "skipped": skipped }),
                    );
                    self.event(
                        "stacking.time_limit",
                        json!({ "level": index, "reason": "global", "skipped": skipped }),
                    );
                    stop = Some(StopReason::TimeLimit);
                    break;
                }
            }
            if stop.is_none() && self.timer.child_out_of_time() {
                self.log(
                    LogLevel::Warn,
                    "stacking.child_time_limit_exceeded",
                    json!({ "level": index }),
                );
                self.event(
                    "stacking.time_limit",
                    json!({ "level": index, "reason": "child" }),
                );
                stop = Some(StopReason::ChildTimeLimit);
            }
            if stop.is_none() && index + 1 == n_levels {
                stop = Some(StopReason::LastLevel);
            }

            let record = LevelRecord {
                index,
                pipelines,
                predictions: LevelPredictions::new(parts),
                stop,
            };
            let summary = json!({
                "level": index,
                "pipelines": record.pipelines.len(),
                "final": record.is_final(),
            });
            self.log(LogLevel::Info, "stacking.level.completed", summary.clone());
            self.event("stacking.level.completed", summary);

            if !record.is_final() {
                let mut next = record.predictions.concatenated()?;
                if self.skip_conn {
                    next = skip_connect(&next, &original)?;
                }
                train_valid = create_validation_iterator(next, None, None, None)?;
                self.log(
                    LogLevel::Debug,
                    "stacking.iterator.created",
                    json!({ "level": index + 1, "kind": train_valid.kind(), "splits": train_valid.len() }),
                );
            }
            let last = record.is_final();
            records.push(record);
            if last {
                break;
            }
        }

        let (last, inner) = records.split_last().ok_or(StackingError::EmptyLevels)?;
        let (blended, retained) = self.blender.fit_predict(&last.predictions, &last.pipelines)?;
        let retained_count = retained.len();
        self.log(
            LogLevel::Info,
            "stacking.blend.completed",
            json!({ "retained": retained.len(), "columns": blended.n_cols() }),
        );
        self.event(
            "stacking.blend.completed",
            json!({ "retained": retained.len(), "rows": blended.n_rows() }),
        );

        let mut fitted: Vec<Vec<SharedPipeline>> =
            inner.iter().map(|record| record.pipelines.clone()).collect();
        fitted.push(retained);
        self.levels = fitted;
        self.pending = None;

        let pruned = self.prune_reader_features();
        self.report = Some(StackingReport::new(
            &records,
            retained_count,
            pruned,
            started.elapsed(),
        ));
        Ok(blended)
    }

    /// Predicts new data with the retained levels.
    pub fn predict(&self, data: &RawData, features: Option<&[String]>) -> Result<Dataset, StackingError> {
        if self.pending.is_some() {
            return Err(StackingError::NotFitted);
        }
        let (last, inner) = self.levels.split_last().ok_or(StackingError::NotFitted)?;
        let dataset = self.reader.read(data, features, false)?;

        let mut input = dataset.clone();
        for (index, level) in inner.iter().enumerate() {
            let mut next = predict_level(level, &input, index)?.concatenated()?;
            if self.skip_conn {
                next = skip_connect(&next, &dataset)?;
            }
            input = next;
        }
        let predictions = predict_level(last, &input, inner.len())?;
        let output = self.blender.predict(&predictions)?;
        self.event(
            "stacking.predict.completed",
            json!({ "rows": output.n_rows(), "columns": output.n_cols() }),
        );
        Ok(output)
    }

    /// Union of the input features used by every retained pipeline, in
    /// first-use order.
    #[must_use]
    pub fn collect_used_feats(&self) -> Vec<String> {
        let mut used = IndexSet::new();
        for pipe in self.levels.iter().flatten() {
            used.extend(pipe.lock().used_features().iter().cloned());
        }
        used.into_iter().collect()
    }

    /// Trained model count per trainable unit name.
    ///
    /// Units sharing a name overwrite each other; the last one wins.
    #[must_use]
    pub fn collect_model_stats(&self) -> IndexMap<String, usize> {
        let mut stats = IndexMap::new();
        for pipe in self.levels.iter().flatten() {
            for (name, count) in pipe.lock().model_counts() {
                stats.insert(name, count);
            }
        }
        stats
    }

    /// Retained levels; empty before a successful fit.
    #[must_use]
    pub fn levels(&self) -> &[Vec<SharedPipeline>] {
        &self.levels
    }

    /// Reader in use.
    #[must_use]
    pub fn reader(&self) -> &dyn Reader {
        self.reader.as_ref()
    }

    /// Summary of the last successful fit.
    #[must_use]
    pub const fn report(&self) -> Option<&StackingReport> {
        self.report.as_ref()
    }

    /// Whether `fit_predict` has succeeded.
    #[must_use]
    pub const fn is_fitted(&self) -> bool {
        self.pending.is_none()
    }

    fn prune_reader_features(&mut self) -> Vec<String> {
        let used = self.collect_used_feats();
        let unused: Vec<String> = self
            .reader
            .used_features()
            .iter()
            .filter(|feature| !used.contains(feature))
            .cloned()
            .collect();
        if !unused.is_empty() {
            self.reader.upd_used_features(&unused);
            self.log(
                LogLevel::Info,
                "stacking.features.pruned",
                json!({ "pruned": unused, "kept": self.reader.used_features().len() }),
            );
        }
        unused
    }

    /// Remaining global budget in seconds; `None` when unlimited.
    fn secs_left(&self) -> Option<f64> {
        self.timer.time_left().map(|left| left.as_secs_f64())
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(telemetry) = self.telemetry.as_ref() {
            let _ = telemetry.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: Value) {
        if let Some(telemetry) = self.telemetry.as_ref() {
            let _ = telemetry.event(event_type, payload);
        }
    }
}

fn predict_level(
    level: &[SharedPipeline],
    input: &Dataset,
    index: usize,
) -> Result<LevelPredictions, StackingError> {
    level
        .iter()
        .enumerate()
        .map(|(pipe, pipeline)| {
            pipeline
                .lock()
                .predict(input)
                .map_err(|source| StackingError::Pipeline {
                    level: index,
                    pipe,
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(LevelPredictions::new)
}

#[cfg(test)]
mod tests;
