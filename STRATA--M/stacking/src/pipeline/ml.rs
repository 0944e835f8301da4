use std::fmt;

use super::{Pipeline, PipelineError};
use crate::dataset::{concatenate, Dataset};
use crate::timer::TaskTimer;
use crate::validation::ValidationIterator;

/// A trainable algorithm inside an [`MlPipeline`].
pub trait MlAlgo: Send + fmt::Debug {
    /// Current name, used as the prediction column prefix.
    fn name(&self) -> &str;
    /// Short algorithm label used when the pipeline renames its units.
    fn algo_label(&self) -> &'static str;
    /// Renames the algorithm.
    fn set_name(&mut self, name: String);
    /// Trains on every split and returns out-of-fold predictions.
    fn fit_predict(
        &mut self,
        train_valid: &ValidationIterator,
        timer: Option<&TaskTimer>,
    ) -> Result<Dataset, PipelineError>;
    /// Predicts with the trained models.
    fn predict(&self, dataset: &Dataset) -> Result<Dataset, PipelineError>;
    /// Number of trained models.
    fn n_models(&self) -> usize;
}

/// Optional feature subset feeding one or more algorithms whose predictions
/// are concatenated.
#[derive(Debug)]
pub struct MlPipeline {
    name: String,
    algos: Vec<Box<dyn MlAlgo>>,
    features: Option<Vec<String>>,
    used_features: Vec<String>,
    timer: Option<TaskTimer>,
}

impl MlPipeline {
    /// Pipeline over every input feature.
    #[must_use]
    pub fn new(algos: Vec<Box<dyn MlAlgo>>) -> Self {
        Self {
            name: "MlPipeline".into(),
            algos,
            features: None,
            used_features: Vec::new(),
            timer: None,
        }
    }

    /// Restricts the pipeline to `features`.
    #[must_use]
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = Some(features.into_iter().map(Into::into).collect());
        self
    }

    /// Attaches a per-fit time budget.
    #[must_use]
    pub fn with_timer(mut self, timer: TaskTimer) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Algorithms in prediction column order.
    #[must_use]
    pub fn algos(&self) -> &[Box<dyn MlAlgo>] {
        &self.algos
    }
}

impl Pipeline for MlPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn upd_model_names(&mut self, prefix: &str) {
        self.name = prefix.to_string();
        for (index, algo) in self.algos.iter_mut().enumerate() {
            let label = algo.algo_label();
            algo.set_name(format!("{prefix}_Mod_{index}_{label}"));
        }
    }

    fn fit_predict(&mut self, train_valid: &ValidationIterator) -> Result<Dataset, PipelineError> {
        if self.algos.is_empty() {
            return Err(PipelineError::NoAlgos);
        }
        let features = self
            .features
            .clone()
            .unwrap_or_else(|| train_valid.train().features().to_vec());
        let projected = train_valid.select_features(&features)?;
        if let Some(timer) = self.timer.as_mut() {
            timer.start();
        }
        let timer = self.timer.as_ref();
        let mut parts = Vec::with_capacity(self.algos.len());
        for algo in &mut self.algos {
            parts.push(algo.fit_predict(&projected, timer)?);
        }
        self.used_features = features;
        Ok(concatenate(&parts)?)
    }

    fn predict(&self, dataset: &Dataset) -> Result<Dataset, PipelineError> {
        if self.algos.is_empty() {
            return Err(PipelineError::NoAlgos);
        }
        let input = dataset.select(&self.used_features)?;
        let parts = self
            .algos
            .iter()
            .map(|algo| algo.predict(&input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(concatenate(&parts)?)
    }

    fn used_features(&self) -> &[String] {
        &self.used_features
    }

    fn model_counts(&self) -> Vec<(String, usize)> {
        self.algos
            .iter()
            .map(|algo| (algo.name().to_string(), algo.n_models()))
            .collect()
    }
}
