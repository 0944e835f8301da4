//! Turning raw tabular input plus role annotations into [`Dataset`]s.

use std::borrow::Cow;
use std::fmt;

use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError, DatasetKind};

/// Errors raised while reading raw data.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReaderError {
    /// A column referenced by roles or used features is absent.
    #[error("missing column `{0}`")]
    MissingColumn(String),
    /// A column name was added twice.
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    /// A column's length disagrees with the frame.
    #[error("column `{column}` has {found} rows, expected {expected}")]
    RowMismatch {
        /// Column name.
        column: String,
        /// Rows in the frame.
        expected: usize,
        /// Rows in the column.
        found: usize,
    },
    /// A raw matrix was given without feature names.
    #[error("feature names are required to read a matrix with {columns} columns")]
    MissingFeatureNames {
        /// Matrix width.
        columns: usize,
    },
    /// Feature names do not match the matrix width.
    #[error("{names} feature names given for a matrix with {columns} columns")]
    FeatureNamesMismatch {
        /// Matrix width.
        columns: usize,
        /// Names supplied.
        names: usize,
    },
    /// The target has a missing or infinite value.
    #[error("target value at row {row} is not finite")]
    InvalidTarget {
        /// Offending row.
        row: usize,
    },
    /// A fold id is not a non-negative integer.
    #[error("fold value {value} at row {row} is not a non-negative integer")]
    InvalidFold {
        /// Offending row.
        row: usize,
        /// Raw value.
        value: f64,
    },
    /// `read` was called before `fit_read`.
    #[error("reader has not been fitted")]
    NotFitted,
    /// Every candidate feature was dropped.
    #[error("no usable features left after applying roles")]
    NoFeatures,
    /// Building the dataset failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Column-oriented raw table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrame {
    columns: IndexMap<String, Vec<f64>>,
}

impl RawFrame {
    /// Empty frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column; all columns must have the same length.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, ReaderError> {
        let name = name.into();
        if self.columns.contains_key(&name) {
            return Err(ReaderError::DuplicateColumn(name));
        }
        if !self.columns.is_empty() && values.len() != self.n_rows() {
            return Err(ReaderError::RowMismatch {
                column: name,
                expected: self.n_rows(),
                found: values.len(),
            });
        }
        self.columns.insert(name, values);
        Ok(self)
    }

    /// Column values by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Column names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.keys().map(String::as_str)
    }

    /// Number of rows.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.columns.values().next().map_or(0, Vec::len)
    }

    /// Number of columns.
    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }
}

/// Raw input accepted by readers.
#[derive(Debug, Clone, PartialEq)]
pub enum RawData {
    /// Named columns.
    Frame(RawFrame),
    /// Unnamed matrix; names must be passed alongside.
    Matrix(Array2<f64>),
}

impl RawData {
    /// Frame view of the input. Matrices need `names`; frames use their own
    /// column names and ignore `names`.
    pub fn to_frame(&self, names: Option<&[String]>) -> Result<Cow<'_, RawFrame>, ReaderError> {
        match self {
            Self::Frame(frame) => Ok(Cow::Borrowed(frame)),
            Self::Matrix(matrix) => {
                let names = names.ok_or(ReaderError::MissingFeatureNames {
                    columns: matrix.ncols(),
                })?;
                if names.len() != matrix.ncols() {
                    return Err(ReaderError::FeatureNamesMismatch {
                        columns: matrix.ncols(),
                        names: names.len(),
                    });
                }
                names
                    .iter()
                    .zip(matrix.columns())
                    .try_fold(RawFrame::new(), |frame, (name, column)| {
                        frame.with_column(name.clone(), column.to_vec())
                    })
                    .map(Cow::Owned)
            }
        }
    }
}

impl From<RawFrame> for RawData {
    fn from(frame: RawFrame) -> Self {
        Self::Frame(frame)
    }
}

impl From<Array2<f64>> for RawData {
    fn from(matrix: Array2<f64>) -> Self {
        Self::Matrix(matrix)
    }
}

/// Column role annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    /// Target column.
    pub target: String,
    /// Column holding fold ids.
    #[serde(default)]
    pub folds: Option<String>,
    /// Columns never used as features.
    #[serde(default)]
    pub drop: Vec<String>,
}

impl Roles {
    /// Roles with only a target.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Declares the fold column.
    #[must_use]
    pub fn with_folds(mut self, column: impl Into<String>) -> Self {
        self.folds = Some(column.into());
        self
    }

    /// Declares columns to ignore.
    #[must_use]
    pub fn with_drop<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drop.extend(columns.into_iter().map(Into::into));
        self
    }

    fn is_reserved(&self, column: &str) -> bool {
        column == self.target
            || self.folds.as_deref() == Some(column)
            || self.drop.iter().any(|dropped| dropped == column)
    }
}

/// Reads raw data into datasets and tracks which features are in use.
pub trait Reader: Send + fmt::Debug {
    /// Training-time read; infers and records the used features.
    fn fit_read(
        &mut self,
        data: &RawData,
        features: Option<&[String]>,
        roles: &Roles,
    ) -> Result<Dataset, ReaderError>;

    /// Read without touching the used-feature bookkeeping. With
    /// `add_array_attrs` the target and folds are attached when present.
    fn read(
        &self,
        data: &RawData,
        features: Option<&[String]>,
        add_array_attrs: bool,
    ) -> Result<Dataset, ReaderError>;

    /// Features currently in use.
    fn used_features(&self) -> &[String];

    /// Forgets the given features.
    fn upd_used_features(&mut self, remove: &[String]);
}

/// Options of [`TabularReader`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaderConfig {
    /// Number of random folds generated when no fold column is given.
    pub cv: Option<usize>,
    /// Seed of the fold shuffle.
    pub random_state: u64,
    /// Skip features holding a single distinct value.
    pub drop_constant: bool,
    /// Kind of the produced datasets.
    pub kind: DatasetKind,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            cv: Some(5),
            random_state: 42,
            drop_constant: true,
            kind: DatasetKind::Numeric,
        }
    }
}

/// Reader for numeric tables.
#[derive(Debug, Clone, Default)]
pub struct TabularReader {
    config: ReaderConfig,
    roles: Option<Roles>,
    used_features: Vec<String>,
    dropped_features: Vec<String>,
}

impl TabularReader {
    /// Creates a reader with the given options.
    #[must_use]
    pub fn new(config: ReaderConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Options in use.
    #[must_use]
    pub const fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Features skipped as constant during the last `fit_read`.
    #[must_use]
    pub fn dropped_features(&self) -> &[String] {
        &self.dropped_features
    }
}

impl Reader for TabularReader {
    fn fit_read(
        &mut self,
        data: &RawData,
        features: Option<&[String]>,
        roles: &Roles,
    ) -> Result<Dataset, ReaderError> {
        let frame = data.to_frame(features)?;
        let target = frame
            .column(&roles.target)
            .ok_or_else(|| ReaderError::MissingColumn(roles.target.clone()))?;
        if let Some(row) = target.iter().position(|value| !value.is_finite()) {
            return Err(ReaderError::InvalidTarget { row });
        }
        let folds = match roles.folds.as_deref() {
            Some(column) => Some(parse_folds(
                frame
                    .column(column)
                    .ok_or_else(|| ReaderError::MissingColumn(column.to_string()))?,
            )?),
            None => self
                .config
                .cv
                .map(|n_folds| random_folds(frame.n_rows(), n_folds, self.config.random_state)),
        };

        let mut used = Vec::new();
        let mut dropped = Vec::new();
        for name in frame.names().filter(|name| !roles.is_reserved(name)) {
            let constant = frame.column(name).is_some_and(is_constant);
            if self.config.drop_constant && constant {
                dropped.push(name.to_string());
            } else {
                used.push(name.to_string());
            }
        }
        if used.is_empty() {
            return Err(ReaderError::NoFeatures);
        }

        let mut dataset = build_dataset(self.config.kind, &frame, &used)?
            .with_target(Array1::from(target.to_vec()))?;
        if let Some(folds) = folds {
            dataset = dataset.with_folds(folds)?;
        }
        self.roles = Some(roles.clone());
        self.used_features = used;
        self.dropped_features = dropped;
        Ok(dataset)
    }

    fn read(
        &self,
        data: &RawData,
        features: Option<&[String]>,
        add_array_attrs: bool,
    ) -> Result<Dataset, ReaderError> {
        let roles = self.roles.as_ref().ok_or(ReaderError::NotFitted)?;
        let frame = data.to_frame(features)?;
        let mut dataset = build_dataset(self.config.kind, &frame, &self.used_features)?;
        if add_array_attrs {
            if let Some(target) = frame.column(&roles.target) {
                dataset = dataset.with_target(Array1::from(target.to_vec()))?;
            }
            if let Some(folds) = roles.folds.as_deref().and_then(|column| frame.column(column)) {
                dataset = dataset.with_folds(parse_folds(folds)?)?;
            }
        }
        Ok(dataset)
    }

    fn used_features(&self) -> &[String] {
        &self.used_features
    }

    fn upd_used_features(&mut self, remove: &[String]) {
        self.used_features
            .retain(|feature| !remove.iter().any(|removed| removed == feature));
    }
}

fn build_dataset(
    kind: DatasetKind,
    frame: &RawFrame,
    names: &[String],
) -> Result<Dataset, ReaderError> {
    let columns = names
        .iter()
        .map(|name| {
            frame
                .column(name)
                .ok_or_else(|| ReaderError::MissingColumn(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let data = Array2::from_shape_fn((frame.n_rows(), columns.len()), |(row, col)| {
        columns[col][row]
    });
    Ok(Dataset::new(kind, names.to_vec(), data)?)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_folds(values: &[f64]) -> Result<Vec<usize>, ReaderError> {
    values
        .iter()
        .enumerate()
        .map(|(row, &value)| {
            if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
                Ok(value as usize)
            } else {
                Err(ReaderError::InvalidFold { row, value })
            }
        })
        .collect()
}

fn random_folds(rows: usize, n_folds: usize, seed: u64) -> Vec<usize> {
    let n_folds = n_folds.max(1);
    let mut order: Vec<usize> = (0..rows).collect();
    order.shuffle(&mut SmallRng::seed_from_u64(seed));
    let mut folds = vec![0; rows];
    for (position, row) in order.into_iter().enumerate() {
        folds[row] = position % n_folds;
    }
    folds
}

fn is_constant(values: &[f64]) -> bool {
    let mut finite = values.iter().filter(|value| value.is_finite());
    finite
        .next()
        .map_or(true, |first| finite.all(|value| value == first))
}
