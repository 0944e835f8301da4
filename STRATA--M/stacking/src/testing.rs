//! Deterministic fixtures for unit tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use ndarray::Array2;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::blend::{BestModelSelector, BlendError, Blender, LevelPredictions};
use crate::dataset::{Dataset, DatasetKind};
use crate::pipeline::{Pipeline, PipelineError, SharedPipeline};
use crate::reader::{RawFrame, ReaderConfig, Roles, TabularReader};
use crate::timer::Timer;
use crate::validation::ValidationIterator;

/// `x0..x2` uniform features, `y = 2 x0 - x1 + noise`, `fold = row % 5`.
pub fn raw_frame(rows: usize, seed: u64) -> RawFrame {
    let mut rng = SmallRng::seed_from_u64(seed);
    let columns: Vec<Vec<f64>> = (0..3)
        .map(|_| (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let target = (0..rows)
        .map(|row| 2.0 * columns[0][row] - columns[1][row] + rng.gen_range(-0.05..0.05))
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let folds = (0..rows).map(|row| (row % 5) as f64).collect();
    let mut frame = RawFrame::new();
    for (index, values) in columns.into_iter().enumerate() {
        frame = frame.with_column(format!("x{index}"), values).unwrap();
    }
    frame
        .with_column("y", target)
        .unwrap()
        .with_column("fold", folds)
        .unwrap()
}

/// Target `y`, folds from the `fold` column.
pub fn fold_roles() -> Roles {
    Roles::new("y").with_folds("fold")
}

/// Target `y`; `fold` dropped so no folds exist.
pub fn foldless_roles() -> Roles {
    Roles::new("y").with_drop(["fold"])
}

/// Reader that never invents folds.
pub fn reader(kind: DatasetKind) -> TabularReader {
    TabularReader::new(ReaderConfig {
        cv: None,
        kind,
        ..ReaderConfig::default()
    })
}

/// Observation handles of a [`StubPipeline`].
#[derive(Debug, Clone, Default)]
pub struct StubProbe {
    pub fits: Arc<AtomicUsize>,
    pub input_widths: Arc<Mutex<Vec<usize>>>,
    pub predict_widths: Arc<Mutex<Vec<usize>>>,
}

impl StubProbe {
    pub fn fits(&self) -> usize {
        self.fits.load(Ordering::SeqCst)
    }

    pub fn widths(&self) -> Vec<usize> {
        self.input_widths.lock().clone()
    }

    pub fn predict_widths(&self) -> Vec<usize> {
        self.predict_widths.lock().clone()
    }
}

/// Pipeline emitting `target + offset` in `width` columns of `kind`.
#[derive(Debug)]
pub struct StubPipeline {
    name: String,
    kind: DatasetKind,
    width: usize,
    offset: f64,
    features: Option<Vec<String>>,
    unit: Option<(String, usize)>,
    used: Vec<String>,
    probe: StubProbe,
}

impl StubPipeline {
    pub fn numeric(width: usize) -> Self {
        Self::new(DatasetKind::Numeric, width)
    }

    pub fn new(kind: DatasetKind, width: usize) -> Self {
        Self {
            name: "Stub".into(),
            kind,
            width,
            offset: 0.0,
            features: None,
            unit: None,
            used: Vec::new(),
            probe: StubProbe::default(),
        }
    }

    pub const fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = Some(features.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Reports a fixed unit name and model count.
    pub fn with_unit(mut self, name: &str, models: usize) -> Self {
        self.unit = Some((name.to_string(), models));
        self
    }

    pub fn probe(&self) -> StubProbe {
        self.probe.clone()
    }

    pub fn into_shared(self) -> (SharedPipeline, StubProbe) {
        let probe = self.probe();
        (crate::pipeline::shared(self), probe)
    }

    fn output(&self, rows: usize, target: Option<ndarray::ArrayView1<'_, f64>>) -> Result<Dataset, PipelineError> {
        #[allow(clippy::cast_precision_loss)]
        let data = Array2::from_shape_fn((rows, self.width), |(row, col)| {
            target.map_or(row as f64, |target| target[row]) + self.offset + col as f64
        });
        let names = (0..self.width).map(|col| format!("{}_out_{col}", self.name)).collect();
        Ok(Dataset::new(self.kind, names, data)?)
    }
}

impl Pipeline for StubPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn upd_model_names(&mut self, prefix: &str) {
        self.name = prefix.to_string();
    }

    fn fit_predict(&mut self, train_valid: &ValidationIterator) -> Result<Dataset, PipelineError> {
        self.probe.fits.fetch_add(1, Ordering::SeqCst);
        let train = train_valid.train();
        self.probe.input_widths.lock().push(train.n_cols());
        self.used = match &self.features {
            Some(features) => train.select(features)?.features().to_vec(),
            None => train.features().to_vec(),
        };
        let valid = train_valid.get_validation_data();
        let output = self.output(valid.n_rows(), valid.target())?;
        Ok(output.with_array_attrs_from(valid)?)
    }

    fn predict(&self, dataset: &Dataset) -> Result<Dataset, PipelineError> {
        if self.used.is_empty() {
            return Err(PipelineError::NotFitted(self.name.clone()));
        }
        dataset.select(&self.used)?;
        self.probe.predict_widths.lock().push(dataset.n_cols());
        self.output(dataset.n_rows(), None)
    }

    fn used_features(&self) -> &[String] {
        &self.used
    }

    fn model_counts(&self) -> Vec<(String, usize)> {
        let (name, models) = self
            .unit
            .clone()
            .unwrap_or_else(|| (format!("{}_Mod_0_Stub", self.name), self.probe.fits()));
        vec![(name, models)]
    }
}

/// Timer whose global budget runs out on the `after`-th check.
#[derive(Debug, Default)]
pub struct ScriptedTimer {
    after: Option<usize>,
    checks: AtomicUsize,
    child: AtomicBool,
}

impl ScriptedTimer {
    pub const fn exceeded_after(checks: usize) -> Self {
        Self {
            after: Some(checks),
            checks: AtomicUsize::new(0),
            child: AtomicBool::new(false),
        }
    }
}

impl Timer for ScriptedTimer {
    fn start(&mut self) {
        self.checks.store(0, Ordering::SeqCst);
    }

    fn time_left(&self) -> Option<Duration> {
        None
    }

    fn time_limit_exceeded(&self) -> bool {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        self.after.is_some_and(|after| seen >= after)
    }

    fn child_out_of_time(&self) -> bool {
        self.child.load(Ordering::SeqCst)
    }
}

/// [`BestModelSelector`] that counts its calls.
#[derive(Debug, Default)]
pub struct CountingBlender {
    inner: BestModelSelector,
    calls: Arc<AtomicUsize>,
}

impl CountingBlender {
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Blender for CountingBlender {
    fn fit_predict(
        &mut self,
        predictions: &LevelPredictions,
        pipes: &[SharedPipeline],
    ) -> Result<(Dataset, Vec<SharedPipeline>), BlendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fit_predict(predictions, pipes)
    }

    fn predict(&self, predictions: &LevelPredictions) -> Result<Dataset, BlendError> {
        self.inner.predict(predictions)
    }
}
