//! Scoring functions used to rank level predictions.

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Regression metric. Scores are oriented so that higher is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Negated mean squared error.
    #[default]
    Mse,
    /// Negated mean absolute error.
    Mae,
    /// Coefficient of determination.
    R2,
}

impl Metric {
    /// Scores every prediction column against `target` and averages.
    ///
    /// Rows where either side is not finite are ignored. Returns `None` when
    /// no column has a usable row.
    #[must_use]
    pub fn score(self, target: ArrayView1<'_, f64>, predictions: ArrayView2<'_, f64>) -> Option<f64> {
        let scores: Vec<f64> = predictions
            .columns()
            .into_iter()
            .filter_map(|column| {
                let (preds, labels): (Vec<f64>, Vec<f64>) = column
                    .iter()
                    .zip(target.iter())
                    .filter(|(pred, label)| pred.is_finite() && label.is_finite())
                    .map(|(pred, label)| (*pred, *label))
                    .unzip();
                if preds.is_empty() {
                    return None;
                }
                Some(match self {
                    Self::Mse => -mean_squared_error(&preds, &labels),
                    Self::Mae => -mean_absolute_error(&preds, &labels),
                    Self::R2 => r2_score(&preds, &labels),
                })
            })
            .collect();
        if scores.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = scores.len() as f64;
        Some(scores.iter().sum::<f64>() / count)
    }
}

/// Mean squared error; zero for empty or mismatched inputs.
#[must_use]
pub fn mean_squared_error(predictions: &[f64], labels: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != labels.len() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = predictions.len() as f64;
    predictions
        .iter()
        .zip(labels)
        .map(|(pred, label)| (pred - label).powi(2))
        .sum::<f64>()
        / n
}

/// Mean absolute error; zero for empty or mismatched inputs.
#[must_use]
pub fn mean_absolute_error(predictions: &[f64], labels: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != labels.len() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = predictions.len() as f64;
    predictions
        .iter()
        .zip(labels)
        .map(|(pred, label)| (pred - label).abs())
        .sum::<f64>()
        / n
}

/// Coefficient of determination; zero when the labels are constant.
#[must_use]
pub fn r2_score(predictions: &[f64], labels: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != labels.len() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = labels.iter().sum::<f64>() / labels.len() as f64;
    let total: f64 = labels.iter().map(|label| (label - mean).powi(2)).sum();
    if total <= f64::EPSILON {
        return 0.0;
    }
    let residual: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(pred, label)| (pred - label).powi(2))
        .sum();
    1.0 - residual / total
}
