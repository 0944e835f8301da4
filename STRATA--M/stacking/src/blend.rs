//! Turning the last level's predictions into the final output.

use std::fmt;

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{concatenate, Dataset, DatasetError, DatasetKind};
use crate::metric::Metric;
use crate::pipeline::SharedPipeline;

/// Errors raised by blenders.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlendError {
    /// Number of prediction blocks differs from what the blender expects.
    #[error("blender expected {expected} prediction blocks, got {found}")]
    MismatchedInputs {
        /// Expected block count.
        expected: usize,
        /// Supplied block count.
        found: usize,
    },
    /// Ranking needs a target on the predictions.
    #[error("predictions carry no target to score against")]
    MissingTarget,
    /// Blocks have different widths and cannot be averaged.
    #[error("prediction block widths differ: {expected} vs {found}")]
    WidthMismatch {
        /// Width of the first block.
        expected: usize,
        /// Width of the offending block.
        found: usize,
    },
    /// Blending produced no finite value.
    #[error("blend produced no finite values")]
    NonFinite,
    /// Dataset manipulation failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Row-aligned prediction blocks of one level, one per pipeline, in
/// pipeline order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelPredictions {
    parts: Vec<Dataset>,
}

impl LevelPredictions {
    /// Wraps per-pipeline predictions.
    #[must_use]
    pub fn new(parts: Vec<Dataset>) -> Self {
        Self { parts }
    }

    /// Per-pipeline blocks.
    #[must_use]
    pub fn parts(&self) -> &[Dataset] {
        &self.parts
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether there are no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// All blocks side by side.
    pub fn concatenated(&self) -> Result<Dataset, DatasetError> {
        concatenate(&self.parts)
    }
}

/// Combines the last level's predictions and decides which of its
/// pipelines stay.
pub trait Blender: Send + fmt::Debug {
    /// Blends training-time predictions and returns the retained pipelines.
    fn fit_predict(
        &mut self,
        predictions: &LevelPredictions,
        pipes: &[SharedPipeline],
    ) -> Result<(Dataset, Vec<SharedPipeline>), BlendError>;

    /// Blends inference-time predictions of the retained pipelines.
    fn predict(&self, predictions: &LevelPredictions) -> Result<Dataset, BlendError>;
}

/// Keeps the single best-scoring pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestModelSelector {
    metric: Metric,
    #[serde(skip)]
    selected: Option<usize>,
}

impl BestModelSelector {
    /// Selector ranking by `metric`.
    #[must_use]
    pub const fn new(metric: Metric) -> Self {
        Self {
            metric,
            selected: None,
        }
    }

    /// Index of the pipeline kept by the last fit.
    #[must_use]
    pub const fn selected(&self) -> Option<usize> {
        self.selected
    }
}

impl Blender for BestModelSelector {
    fn fit_predict(
        &mut self,
        predictions: &LevelPredictions,
        pipes: &[SharedPipeline],
    ) -> Result<(Dataset, Vec<SharedPipeline>), BlendError> {
        if predictions.is_empty() || predictions.len() != pipes.len() {
            return Err(BlendError::MismatchedInputs {
                expected: pipes.len(),
                found: predictions.len(),
            });
        }
        let best = if predictions.len() == 1 {
            0
        } else {
            let mut best = (0, f64::NEG_INFINITY);
            for (index, part) in predictions.parts().iter().enumerate() {
                let target = part.target().ok_or(BlendError::MissingTarget)?;
                let score = self
                    .metric
                    .score(target, part.data())
                    .unwrap_or(f64::NEG_INFINITY);
                // strict comparison keeps the earliest pipeline on ties
                if score > best.1 {
                    best = (index, score);
                }
            }
            best.0
        };
        self.selected = Some(best);
        Ok((
            predictions.parts()[best].clone(),
            vec![SharedPipeline::clone(&pipes[best])],
        ))
    }

    fn predict(&self, predictions: &LevelPredictions) -> Result<Dataset, BlendError> {
        match predictions.parts() {
            [only] => Ok(only.clone()),
            parts => Err(BlendError::MismatchedInputs {
                expected: 1,
                found: parts.len(),
            }),
        }
    }
}

/// Weighted average of every pipeline's predictions; keeps all pipelines.
///
/// Fixed weights are positional. When fewer pipelines reach the blender
/// than weights were given, the leading weights are used and renormalised;
/// if none of them is positive the kept pipelines are weighted equally.
/// Cells where a block is not finite are averaged over the remaining blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanBlender {
    weights: Option<Vec<f64>>,
    #[serde(skip)]
    fitted: Vec<f64>,
}

impl MeanBlender {
    /// Equal-weight blender.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed per-pipeline weights.
    #[must_use]
    pub fn with_weights(weights: Vec<f64>) -> Self {
        Self {
            weights: Some(weights),
            fitted: Vec::new(),
        }
    }

    /// Normalised weights of the last fit.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.fitted
    }

    fn average(weights: &[f64], predictions: &LevelPredictions) -> Result<Dataset, BlendError> {
        let first = predictions.parts().first().ok_or(BlendError::MismatchedInputs {
            expected: weights.len(),
            found: 0,
        })?;
        if predictions.len() != weights.len() {
            return Err(BlendError::MismatchedInputs {
                expected: weights.len(),
                found: predictions.len(),
            });
        }
        let shape = first.data().dim();
        let mut sum = Array2::<f64>::zeros(shape);
        let mut mass = Array2::<f64>::zeros(shape);
        for (part, &weight) in predictions.parts().iter().zip(weights) {
            if part.n_cols() != shape.1 {
                return Err(BlendError::WidthMismatch {
                    expected: shape.1,
                    found: part.n_cols(),
                });
            }
            if part.n_rows() != shape.0 {
                return Err(DatasetError::RowMismatch {
                    expected: shape.0,
                    found: part.n_rows(),
                }
                .into());
            }
            Zip::from(&mut sum)
                .and(&mut mass)
                .and(part.data())
                .for_each(|total, seen, &value| {
                    if value.is_finite() {
                        *total += weight * value;
                        *seen += weight;
                    }
                });
        }
        let blended = Zip::from(&sum)
            .and(&mass)
            .map_collect(|&total, &seen| if seen > 0.0 { total / seen } else { f64::NAN });
        review(&blended)?;

        let names = if shape.1 == 1 {
            vec!["blended_prediction".to_string()]
        } else {
            (0..shape.1).map(|j| format!("blended_prediction_{j}")).collect()
        };
        Ok(Dataset::new(DatasetKind::Numeric, names, blended)?.with_array_attrs_from(first)?)
    }
}

impl Blender for MeanBlender {
    fn fit_predict(
        &mut self,
        predictions: &LevelPredictions,
        pipes: &[SharedPipeline],
    ) -> Result<(Dataset, Vec<SharedPipeline>), BlendError> {
        if predictions.len() != pipes.len() {
            return Err(BlendError::MismatchedInputs {
                expected: pipes.len(),
                found: predictions.len(),
            });
        }
        let raw = match &self.weights {
            // a level cut short by the time budget keeps a prefix of its pipelines
            Some(weights) if weights.len() >= pipes.len() => weights[..pipes.len()].to_vec(),
            Some(weights) => {
                return Err(BlendError::MismatchedInputs {
                    expected: weights.len(),
                    found: pipes.len(),
                })
            }
            None => vec![1.0; pipes.len()],
        };
        let fitted = if raw.iter().any(|&weight| weight > 0.0) {
            normalize_weights(&raw)
        } else {
            normalize_weights(&vec![1.0; pipes.len()])
        };
        let blended = Self::average(&fitted, predictions)?;
        self.fitted = fitted;
        Ok((blended, pipes.to_vec()))
    }

    fn predict(&self, predictions: &LevelPredictions) -> Result<Dataset, BlendError> {
        Self::average(&self.fitted, predictions)
    }
}

/// Scales weights so they add up to one; negative weights count as zero.
#[must_use]
pub fn normalize_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().map(|weight| weight.max(0.0)).sum();
    let total = total.max(1e-12);
    weights.iter().map(|weight| weight.max(0.0) / total).collect()
}

fn review(blended: &Array2<f64>) -> Result<(), BlendError> {
    if blended.is_empty() || blended.iter().any(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(BlendError::NonFinite)
    }
}
