use thiserror::Error;

use crate::blend::BlendError;
use crate::dataset::{ConversionError, DatasetError};
use crate::pipeline::PipelineError;
use crate::reader::ReaderError;
use crate::validation::ValidationError;

/// Coarse classification of a [`StackingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid levels or validation setup, detected before training.
    Configuration,
    /// Prediction data cannot be rebuilt as the input dataset type.
    Conversion,
    /// Operation not allowed in the current lifecycle state.
    State,
    /// A reader, pipeline, iterator or blender failed.
    Collaborator,
}

/// Errors raised by the stacking orchestrator.
#[derive(Debug, Error)]
pub enum StackingError {
    /// No levels were configured.
    #[error("no levels configured; at least one level with one pipeline is required")]
    EmptyLevels,
    /// A level holds no pipelines.
    #[error("level {level} has no pipelines")]
    EmptyLevel {
        /// Zero-based level index.
        level: usize,
    },
    /// More than one level without folds or a custom splitter.
    #[error("{levels} levels need fold ids or a custom cv splitter to produce out-of-fold predictions")]
    MultiLevelWithoutFolds {
        /// Configured level count.
        levels: usize,
    },
    /// More than one level combined with holdout validation.
    #[error("{levels} levels cannot be trained on a holdout validation set")]
    MultiLevelWithHoldout {
        /// Configured level count.
        levels: usize,
    },
    /// Skip connection requested for an incompatible input type.
    #[error("cannot convert prediction dataset to input features type; set skip_conn = false")]
    SkipConnection(#[source] ConversionError),
    /// `fit_predict` called on an already trained orchestrator.
    #[error("orchestrator is already fitted")]
    AlreadyFitted,
    /// `predict` called before a successful `fit_predict`.
    #[error("orchestrator is not fitted")]
    NotFitted,
    /// Reading raw data failed.
    #[error(transparent)]
    Reader(#[from] ReaderError),
    /// Building a validation iterator failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Combining datasets failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// The blender failed.
    #[error(transparent)]
    Blend(#[from] BlendError),
    /// A pipeline failed.
    #[error("pipeline {pipe} of level {level} failed")]
    Pipeline {
        /// Zero-based level index.
        level: usize,
        /// Zero-based pipeline index within the level.
        pipe: usize,
        /// Underlying failure.
        #[source]
        source: PipelineError,
    },
}

impl StackingError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyLevels
            | Self::EmptyLevel { .. }
            | Self::MultiLevelWithoutFolds { .. }
            | Self::MultiLevelWithHoldout { .. } => ErrorKind::Configuration,
            Self::SkipConnection(_) => ErrorKind::Conversion,
            Self::AlreadyFitted | Self::NotFitted => ErrorKind::State,
            Self::Reader(_)
            | Self::Validation(_)
            | Self::Dataset(_)
            | Self::Blend(_)
            | Self::Pipeline { .. } => ErrorKind::Collaborator,
        }
    }
}
