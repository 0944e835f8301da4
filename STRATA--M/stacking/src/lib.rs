#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Strata stacking core: multi-level stacked training with a global time
//! budget, skip connections, blending and feature pruning.

/// Stacking orchestrator and its run report.
pub mod automl;
/// Final-level blenders.
pub mod blend;
/// File-loadable settings.
pub mod config;
/// Datasets and kind conversion.
pub mod dataset;
/// Orchestrator errors.
pub mod error;
/// Prediction scoring.
pub mod metric;
/// Pipelines and learners.
pub mod pipeline;
/// Raw input readers.
pub mod reader;
/// Structured logging and event helpers.
pub mod telemetry;
/// Time budgets.
pub mod timer;
/// Validation schemes.
pub mod validation;

#[cfg(test)]
mod testing;

pub use automl::{AutoMl, AutoMlBuilder, FitData, LevelSummary, StackingReport, StopReason};
pub use blend::{BestModelSelector, BlendError, Blender, LevelPredictions, MeanBlender};
pub use config::{AutoMlConfig, BlenderConfig};
pub use dataset::{concatenate, ConversionError, Dataset, DatasetError, DatasetKind};
pub use error::{ErrorKind, StackingError};
pub use metric::Metric;
pub use pipeline::{
    shared, LinearConfig, LinearModel, LinearRegression, MlAlgo, MlPipeline, Pipeline,
    PipelineError, SharedPipeline,
};
pub use reader::{RawData, RawFrame, Reader, ReaderConfig, ReaderError, Roles, TabularReader};
pub use telemetry::{StackingTelemetry, StackingTelemetryBuilder};
pub use timer::{PipelineTimer, TaskTimer, Timer};
pub use validation::{
    create_validation_iterator, CvSplitter, FoldSplit, IteratorKind, Split, TimeSeriesSplitter,
    ValidationError, ValidationIterator,
};
