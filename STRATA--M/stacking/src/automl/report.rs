use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::level::{LevelRecord, StopReason};
use crate::dataset::Dataset;

/// Per-level outcome of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSummary {
    /// Zero-based level index.
    pub index: usize,
    /// Names of the pipelines fitted in this level.
    pub pipelines: Vec<String>,
    /// Width of the level's concatenated predictions.
    pub prediction_columns: usize,
    /// Why the level loop ended here, if it did.
    pub stop: Option<StopReason>,
}

/// Summary of a finished `fit_predict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingReport {
    /// Levels processed, in order.
    pub levels: Vec<LevelSummary>,
    /// Pipelines kept by the blender.
    pub retained_pipelines: usize,
    /// Features pruned from the reader.
    pub pruned_features: Vec<String>,
    /// Wall-clock duration of the run in seconds.
    pub elapsed_secs: f64,
}

impl StackingReport {
    pub(crate) fn new(
        records: &[LevelRecord],
        retained_pipelines: usize,
        pruned_features: Vec<String>,
        elapsed: Duration,
    ) -> Self {
        let levels = records
            .iter()
            .map(|record| LevelSummary {
                index: record.index,
                pipelines: record
                    .pipelines
                    .iter()
                    .map(|pipe| pipe.lock().name().to_string())
                    .collect(),
                prediction_columns: record.predictions.parts().iter().map(Dataset::n_cols).sum(),
                stop: record.stop,
            })
            .collect();
        Self {
            levels,
            retained_pipelines,
            pruned_features,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    /// Renders a concise summary string.
    #[must_use]
    pub fn summary(&self) -> String {
        let stop = self
            .levels
            .last()
            .and_then(|level| level.stop)
            .map_or_else(|| "none".to_string(), |reason| reason.to_string());
        format!(
            "[Stacking] levels={} retained={} pruned={} stop={} elapsed={:.2}s",
            self.levels.len(),
            self.retained_pipelines,
            self.pruned_features.len(),
            stop,
            self.elapsed_secs
        )
    }
}
