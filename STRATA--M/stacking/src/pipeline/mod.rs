//! Trainable pipelines: the units a level is made of.

/// Gradient-descent linear learner.
pub mod linear;
/// Feature subset + algorithms pipeline.
pub mod ml;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError};
use crate::validation::{ValidationError, ValidationIterator};

pub use linear::{LinearConfig, LinearModel, LinearRegression};
pub use ml::{MlAlgo, MlPipeline};

/// Errors raised by pipelines and their algorithms.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    /// The pipeline holds no algorithms.
    #[error("pipeline has no algorithms")]
    NoAlgos,
    /// Prediction requested before any model was trained.
    #[error("pipeline `{0}` has no trained models")]
    NotFitted(String),
    /// Training rows carry no target.
    #[error("training data has no target")]
    MissingTarget,
    /// Input width differs from the width seen at training time.
    #[error("expected {expected} features, got {found}")]
    FeatureCount {
        /// Width at fit time.
        expected: usize,
        /// Width of the input.
        found: usize,
    },
    /// Implementation-specific failure.
    #[error("{0}")]
    Failed(String),
    /// Dataset manipulation failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Projecting the validation scheme failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A named, stateful unit that trains on a validation scheme and predicts.
pub trait Pipeline: Send + fmt::Debug {
    /// Name assigned by [`Pipeline::upd_model_names`].
    fn name(&self) -> &str;

    /// Renames the pipeline and its trainable units under `prefix`.
    fn upd_model_names(&mut self, prefix: &str);

    /// Trains and returns predictions for the iterator's validation data.
    fn fit_predict(&mut self, train_valid: &ValidationIterator) -> Result<Dataset, PipelineError>;

    /// Predicts with the trained models.
    fn predict(&self, dataset: &Dataset) -> Result<Dataset, PipelineError>;

    /// Input features consumed by the last fit.
    fn used_features(&self) -> &[String];

    /// Trainable unit name paired with its number of trained models.
    fn model_counts(&self) -> Vec<(String, usize)>;
}

/// Handle to a pipeline owned jointly by the caller and the orchestrator.
pub type SharedPipeline = Arc<Mutex<dyn Pipeline>>;

/// Wraps a pipeline into a [`SharedPipeline`].
pub fn shared<P: Pipeline + 'static>(pipeline: P) -> SharedPipeline {
    Arc::new(Mutex::new(pipeline))
}
