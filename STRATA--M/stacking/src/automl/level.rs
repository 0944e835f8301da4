use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blend::LevelPredictions;
use crate::dataset::{concatenate, Dataset};
use crate::error::StackingError;
use crate::pipeline::SharedPipeline;

/// Why a level ended the level loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The global budget ran out after one of the level's fits.
    TimeLimit,
    /// A child task ran out of its own budget during the level.
    ChildTimeLimit,
    /// The level is the last configured one.
    LastLevel,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TimeLimit => "time_limit",
            Self::ChildTimeLimit => "child_time_limit",
            Self::LastLevel => "last_level",
        };
        f.write_str(label)
    }
}

/// Outcome of one trained level. Never mutated once built.
#[derive(Debug)]
pub(crate) struct LevelRecord {
    pub(crate) index: usize,
    pub(crate) pipelines: Vec<SharedPipeline>,
    pub(crate) predictions: LevelPredictions,
    pub(crate) stop: Option<StopReason>,
}

impl LevelRecord {
    pub(crate) const fn is_final(&self) -> bool {
        self.stop.is_some()
    }
}

/// Rebuilds `predictions` with the kind of `original` and appends the
/// original columns after the prediction columns.
pub(crate) fn skip_connect(predictions: &Dataset, original: &Dataset) -> Result<Dataset, StackingError> {
    let converted = original
        .from_dataset(predictions)
        .map_err(StackingError::SkipConnection)?;
    Ok(concatenate(&[converted, original.clone()])?)
}
