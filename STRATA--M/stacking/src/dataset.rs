//! Immutable tabular datasets passed between readers, levels and blenders.

use std::collections::HashSet;
use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Concrete storage flavour of a [`Dataset`].
///
/// The kind decides which other kinds a dataset can be rebuilt from, which is
/// what skip connections rely on when prediction columns are merged back
/// into the input features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Dense numeric matrix.
    #[default]
    Numeric,
    /// Named, frame-like columns.
    Frame,
    /// Sparse (CSR-like) numeric matrix.
    Sparse,
    /// Sequence/array features that cannot absorb plain prediction columns.
    Sequence,
}

impl DatasetKind {
    /// Whether a dataset of this kind can be rebuilt from one of `source` kind.
    #[must_use]
    pub const fn can_rebuild_from(self, source: Self) -> bool {
        matches!(
            (self, source),
            (Self::Numeric, Self::Numeric | Self::Frame | Self::Sparse)
                | (Self::Frame, Self::Numeric | Self::Frame)
                | (Self::Sparse, Self::Numeric | Self::Sparse)
                | (Self::Sequence, Self::Sequence)
        )
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Numeric => "numeric",
            Self::Frame => "frame",
            Self::Sparse => "sparse",
            Self::Sequence => "sequence",
        };
        f.write_str(label)
    }
}

/// Errors raised while building or combining datasets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatasetError {
    /// Column count does not match the number of feature names.
    #[error("dataset has {columns} columns but {names} feature names")]
    WidthMismatch {
        /// Columns in the matrix.
        columns: usize,
        /// Feature names supplied.
        names: usize,
    },
    /// Row counts of combined parts disagree.
    #[error("row mismatch: expected {expected} rows, found {found}")]
    RowMismatch {
        /// Rows of the reference part.
        expected: usize,
        /// Rows of the offending part.
        found: usize,
    },
    /// The same feature name appears twice.
    #[error("duplicate feature `{0}`")]
    DuplicateFeature(String),
    /// A requested feature is not present.
    #[error("missing feature `{0}`")]
    MissingFeature(String),
    /// Parts of different kinds were concatenated.
    #[error("cannot concatenate {found} dataset with {expected} dataset")]
    KindMismatch {
        /// Kind of the first part.
        expected: DatasetKind,
        /// Kind of the offending part.
        found: DatasetKind,
    },
    /// Nothing to concatenate.
    #[error("cannot concatenate an empty list of datasets")]
    Empty,
}

/// A dataset could not be rebuilt as another kind.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot rebuild a {into} dataset from a {from} dataset")]
pub struct ConversionError {
    /// Requested kind.
    pub into: DatasetKind,
    /// Kind of the dataset being converted.
    pub from: DatasetKind,
}

/// Row-aligned feature matrix with optional target and fold assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    kind: DatasetKind,
    features: Vec<String>,
    data: Array2<f64>,
    target: Option<Array1<f64>>,
    folds: Option<Vec<usize>>,
}

impl Dataset {
    /// Builds a dataset, checking width and name uniqueness.
    pub fn new(
        kind: DatasetKind,
        features: Vec<String>,
        data: Array2<f64>,
    ) -> Result<Self, DatasetError> {
        if data.ncols() != features.len() {
            return Err(DatasetError::WidthMismatch {
                columns: data.ncols(),
                names: features.len(),
            });
        }
        ensure_unique(&features)?;
        Ok(Self {
            kind,
            features,
            data,
            target: None,
            folds: None,
        })
    }

    /// Attaches a target column.
    pub fn with_target(mut self, target: Array1<f64>) -> Result<Self, DatasetError> {
        self.check_rows(target.len())?;
        self.target = Some(target);
        Ok(self)
    }

    /// Attaches a fold assignment.
    pub fn with_folds(mut self, folds: Vec<usize>) -> Result<Self, DatasetError> {
        self.check_rows(folds.len())?;
        self.folds = Some(folds);
        Ok(self)
    }

    /// Copies target and folds from a row-aligned template.
    pub fn with_array_attrs_from(mut self, template: &Self) -> Result<Self, DatasetError> {
        self.check_rows(template.n_rows())?;
        self.target = template.target.clone();
        self.folds = template.folds.clone();
        Ok(self)
    }

    /// Storage kind.
    #[must_use]
    pub const fn kind(&self) -> DatasetKind {
        self.kind
    }

    /// Feature names in column order.
    #[must_use]
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Feature matrix.
    #[must_use]
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Target column, if any.
    #[must_use]
    pub fn target(&self) -> Option<ArrayView1<'_, f64>> {
        self.target.as_ref().map(Array1::view)
    }

    /// Fold assignment, if any.
    #[must_use]
    pub fn folds(&self) -> Option<&[usize]> {
        self.folds.as_deref()
    }

    /// Number of rows.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of feature columns.
    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.data.ncols()
    }

    /// Column by feature name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.position(name).map(|idx| self.data.column(idx))
    }

    /// Projects onto the given features, in the given order.
    pub fn select(&self, names: &[String]) -> Result<Self, DatasetError> {
        let positions = names
            .iter()
            .map(|name| {
                self.position(name)
                    .ok_or_else(|| DatasetError::MissingFeature(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ensure_unique(names)?;
        Ok(Self {
            kind: self.kind,
            features: names.to_vec(),
            data: self.data.select(Axis(1), &positions),
            target: self.target.clone(),
            folds: self.folds.clone(),
        })
    }

    /// Subset of rows, in the given order. Indices must be in range.
    #[must_use]
    pub fn take_rows(&self, rows: &[usize]) -> Self {
        Self {
            kind: self.kind,
            features: self.features.clone(),
            data: self.data.select(Axis(0), rows),
            target: self.target.as_ref().map(|t| t.select(Axis(0), rows)),
            folds: self
                .folds
                .as_ref()
                .map(|folds| rows.iter().map(|&row| folds[row]).collect()),
        }
    }

    /// Rebuilds `other` as a dataset of this dataset's kind.
    ///
    /// Only the kind changes; columns, target and folds are taken from `other`.
    pub fn from_dataset(&self, other: &Self) -> Result<Self, ConversionError> {
        if !self.kind.can_rebuild_from(other.kind) {
            return Err(ConversionError {
                into: self.kind,
                from: other.kind,
            });
        }
        Ok(Self {
            kind: self.kind,
            ..other.clone()
        })
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|feature| feature == name)
    }

    fn check_rows(&self, found: usize) -> Result<(), DatasetError> {
        if found == self.n_rows() {
            Ok(())
        } else {
            Err(DatasetError::RowMismatch {
                expected: self.n_rows(),
                found,
            })
        }
    }
}

/// Column-wise concatenation of row-aligned datasets.
///
/// All parts must share a kind and a row count. Target and folds come from
/// the first part that carries them.
pub fn concatenate(datasets: &[Dataset]) -> Result<Dataset, DatasetError> {
    let first = datasets.first().ok_or(DatasetError::Empty)?;
    for part in &datasets[1..] {
        if part.kind != first.kind {
            return Err(DatasetError::KindMismatch {
                expected: first.kind,
                found: part.kind,
            });
        }
        first.check_rows(part.n_rows())?;
    }
    let features: Vec<String> = datasets
        .iter()
        .flat_map(|part| part.features.iter().cloned())
        .collect();
    let views: Vec<_> = datasets.iter().map(|part| part.data.view()).collect();
    let data = ndarray::concatenate(Axis(1), &views).map_err(|_| DatasetError::RowMismatch {
        expected: first.n_rows(),
        found: 0,
    })?;
    let mut combined = Dataset::new(first.kind, features, data)?;
    combined.target = datasets.iter().find_map(|part| part.target.clone());
    combined.folds = datasets.iter().find_map(|part| part.folds.clone());
    Ok(combined)
}

fn ensure_unique(names: &[String]) -> Result<(), DatasetError> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(DatasetError::DuplicateFeature(name.clone()));
        }
    }
    Ok(())
}
