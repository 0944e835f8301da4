use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{MlAlgo, PipelineError};
use crate::dataset::{Dataset, DatasetKind};
use crate::timer::TaskTimer;
use crate::validation::ValidationIterator;

/// Gradient descent settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    /// Step size.
    pub learning_rate: f64,
    /// Full-batch passes.
    pub epochs: usize,
    /// L2 penalty on the weights.
    pub l2: f64,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 200,
            l2: 0.0,
        }
    }
}

/// Linear regression on standardised features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    weights: Array1<f64>,
    bias: f64,
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl LinearModel {
    /// Fits on every row whose features and label are all finite.
    #[must_use]
    pub fn fit(features: ArrayView2<'_, f64>, labels: ArrayView1<'_, f64>, config: &LinearConfig) -> Self {
        let width = features.ncols();
        let rows: Vec<usize> = (0..features.nrows())
            .filter(|&row| {
                labels[row].is_finite() && features.row(row).iter().all(|value| value.is_finite())
            })
            .collect();
        if rows.is_empty() {
            return Self {
                weights: Array1::zeros(width),
                bias: 0.0,
                means: Array1::zeros(width),
                scales: Array1::ones(width),
            };
        }

        let x = features.select(Axis(0), &rows);
        let y = labels.select(Axis(0), &rows);
        let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(width));
        let scales = x
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std > 1e-12 { std } else { 1.0 });
        let z = (&x - &means) / &scales;

        #[allow(clippy::cast_precision_loss)]
        let n = y.len() as f64;
        let mut weights = Array1::<f64>::zeros(width);
        let mut bias = y.mean().unwrap_or(0.0);
        for _ in 0..config.epochs {
            let error = z.dot(&weights) + bias - &y;
            let grad = z.t().dot(&error) / n + &weights * config.l2;
            weights.scaled_add(-config.learning_rate, &grad);
            bias -= config.learning_rate * error.mean().unwrap_or(0.0);
        }
        Self {
            weights,
            bias,
            means,
            scales,
        }
    }

    /// Predicts a batch; non-finite inputs count as the training mean.
    #[must_use]
    pub fn predict(&self, features: ArrayView2<'_, f64>) -> Array1<f64> {
        let mut z = (&features - &self.means) / &self.scales;
        z.mapv_inplace(|value| if value.is_finite() { value } else { 0.0 });
        z.dot(&self.weights) + self.bias
    }

    /// Input width.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.weights.len()
    }
}

/// One [`LinearModel`] per split, out-of-fold predictions, fold-averaged
/// inference.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    name: String,
    config: LinearConfig,
    models: Vec<LinearModel>,
}

impl LinearRegression {
    /// Creates an untrained algorithm.
    #[must_use]
    pub fn new(config: LinearConfig) -> Self {
        Self {
            name: "LinearRegression".into(),
            config,
            models: Vec::new(),
        }
    }

    /// Trained fold models.
    #[must_use]
    pub fn models(&self) -> &[LinearModel] {
        &self.models
    }

    fn prediction_column(&self) -> String {
        format!("{}_prediction", self.name)
    }
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self::new(LinearConfig::default())
    }
}

impl MlAlgo for LinearRegression {
    fn name(&self) -> &str {
        &self.name
    }

    fn algo_label(&self) -> &'static str {
        "LinearRegression"
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn fit_predict(
        &mut self,
        train_valid: &ValidationIterator,
        timer: Option<&TaskTimer>,
    ) -> Result<Dataset, PipelineError> {
        self.models.clear();
        let valid = train_valid.get_validation_data();
        // rows never validated stay NaN
        let mut oof = Array1::from_elem(valid.n_rows(), f64::NAN);
        for split in train_valid.iter() {
            let target = split.train.target().ok_or(PipelineError::MissingTarget)?;
            let model = LinearModel::fit(split.train.data(), target, &self.config);
            let predictions = model.predict(split.valid.data());
            for (&row, &value) in split.valid_idx.iter().zip(predictions.iter()) {
                oof[row] = value;
            }
            self.models.push(model);
            if timer.is_some_and(TaskTimer::time_limit_exceeded) {
                break;
            }
        }
        if self.models.is_empty() {
            return Err(PipelineError::NotFitted(self.name.clone()));
        }
        let dataset = Dataset::new(
            DatasetKind::Numeric,
            vec![self.prediction_column()],
            oof.insert_axis(Axis(1)),
        )?;
        Ok(dataset.with_array_attrs_from(valid)?)
    }

    fn predict(&self, dataset: &Dataset) -> Result<Dataset, PipelineError> {
        let first = self
            .models
            .first()
            .ok_or_else(|| PipelineError::NotFitted(self.name.clone()))?;
        if dataset.n_cols() != first.n_features() {
            return Err(PipelineError::FeatureCount {
                expected: first.n_features(),
                found: dataset.n_cols(),
            });
        }
        let mut total = Array1::<f64>::zeros(dataset.n_rows());
        for model in &self.models {
            total += &model.predict(dataset.data());
        }
        #[allow(clippy::cast_precision_loss)]
        let averaged = total / self.models.len() as f64;
        let prediction = Dataset::new(
            DatasetKind::Numeric,
            vec![self.prediction_column()],
            averaged.insert_axis(Axis(1)),
        )?;
        Ok(prediction.with_array_attrs_from(dataset)?)
    }

    fn n_models(&self) -> usize {
        self.models.len()
    }
}
