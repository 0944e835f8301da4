//! Validation schemes: which rows each fit trains on and which rows it
//! predicts out of fold.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError};

/// Errors raised while building validation iterators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A custom splitter referenced a row that does not exist.
    #[error("split index {index} out of range for {rows} rows")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Rows in the training data.
        rows: usize,
    },
    /// A custom splitter produced no splits.
    #[error("cv splitter produced no splits")]
    NoSplits,
    /// Projecting the datasets failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Row indices of one train/validation pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    /// Rows used for training.
    pub train_idx: Vec<usize>,
    /// Rows predicted out of fold.
    pub valid_idx: Vec<usize>,
}

/// Caller-supplied cross-validation scheme.
pub trait CvSplitter: Send + Sync + fmt::Debug {
    /// Produces the splits for the given training data.
    fn split(&self, train: &Dataset) -> Vec<FoldSplit>;
}

/// Expanding-window splitter for time-ordered rows.
///
/// Rows are cut into `n_splits + 1` consecutive chunks; split `k` trains on
/// chunks `0..=k` and validates on chunk `k + 1`. The first chunk is never
/// validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSeriesSplitter {
    n_splits: usize,
}

impl TimeSeriesSplitter {
    /// Creates a splitter with at least one split.
    #[must_use]
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits: n_splits.max(1),
        }
    }
}

impl CvSplitter for TimeSeriesSplitter {
    fn split(&self, train: &Dataset) -> Vec<FoldSplit> {
        let rows = train.n_rows();
        let chunk = rows / (self.n_splits + 1);
        if chunk == 0 {
            return Vec::new();
        }
        (1..=self.n_splits)
            .map(|k| {
                let end = if k == self.n_splits { rows } else { (k + 1) * chunk };
                FoldSplit {
                    train_idx: (0..k * chunk).collect(),
                    valid_idx: (k * chunk..end).collect(),
                }
            })
            .collect()
    }
}

/// One materialised train/validation pair.
#[derive(Debug, Clone)]
pub struct Split {
    /// Training rows.
    pub train: Dataset,
    /// Validation rows.
    pub valid: Dataset,
    /// Positions of `valid` rows inside the iterator's validation data.
    pub valid_idx: Vec<usize>,
}

/// Which scheme an iterator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IteratorKind {
    /// Train and validate on every row.
    Dummy,
    /// Separate validation dataset.
    Holdout,
    /// Fold ids carried on the training data.
    Folds,
    /// Caller-supplied splits.
    Custom,
}

#[derive(Debug, Clone)]
enum Scheme {
    Dummy,
    Holdout(Dataset),
    Folds(usize),
    Custom(Vec<FoldSplit>),
}

/// Training data plus a validation scheme.
#[derive(Debug, Clone)]
pub struct ValidationIterator {
    train: Dataset,
    scheme: Scheme,
}

impl ValidationIterator {
    /// Training data.
    #[must_use]
    pub const fn train(&self) -> &Dataset {
        &self.train
    }

    /// Scheme in use.
    #[must_use]
    pub const fn kind(&self) -> IteratorKind {
        match &self.scheme {
            Scheme::Dummy => IteratorKind::Dummy,
            Scheme::Holdout(_) => IteratorKind::Holdout,
            Scheme::Folds(_) => IteratorKind::Folds,
            Scheme::Custom(_) => IteratorKind::Custom,
        }
    }

    /// Number of splits.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.scheme {
            Scheme::Dummy | Scheme::Holdout(_) => 1,
            Scheme::Folds(n_folds) => *n_folds,
            Scheme::Custom(splits) => splits.len(),
        }
    }

    /// Whether there is nothing to iterate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dataset whose rows receive the out-of-fold predictions: the holdout
    /// set, or the whole training data for every other scheme.
    #[must_use]
    pub const fn get_validation_data(&self) -> &Dataset {
        match &self.scheme {
            Scheme::Holdout(valid) => valid,
            _ => &self.train,
        }
    }

    /// Materialises split `index`.
    #[must_use]
    pub fn split(&self, index: usize) -> Option<Split> {
        if index >= self.len() {
            return None;
        }
        let split = match &self.scheme {
            Scheme::Dummy => {
                let all: Vec<usize> = (0..self.train.n_rows()).collect();
                Split {
                    train: self.train.clone(),
                    valid: self.train.clone(),
                    valid_idx: all,
                }
            }
            Scheme::Holdout(valid) => Split {
                train: self.train.clone(),
                valid: valid.clone(),
                valid_idx: (0..valid.n_rows()).collect(),
            },
            Scheme::Folds(_) => {
                let folds = self.train.folds().unwrap_or_default();
                let (valid_idx, train_idx): (Vec<usize>, Vec<usize>) =
                    (0..self.train.n_rows()).partition(|&row| folds.get(row) == Some(&index));
                Split {
                    train: self.train.take_rows(&train_idx),
                    valid: self.train.take_rows(&valid_idx),
                    valid_idx,
                }
            }
            Scheme::Custom(splits) => {
                let FoldSplit {
                    train_idx,
                    valid_idx,
                } = &splits[index];
                Split {
                    train: self.train.take_rows(train_idx),
                    valid: self.train.take_rows(valid_idx),
                    valid_idx: valid_idx.clone(),
                }
            }
        };
        Some(split)
    }

    /// Iterates the splits in order.
    pub fn iter(&self) -> impl Iterator<Item = Split> + '_ {
        (0..self.len()).filter_map(move |index| self.split(index))
    }

    /// Same scheme over a projection of the data onto `features`.
    pub fn select_features(&self, features: &[String]) -> Result<Self, ValidationError> {
        let scheme = match &self.scheme {
            Scheme::Holdout(valid) => Scheme::Holdout(valid.select(features)?),
            other => other.clone(),
        };
        Ok(Self {
            train: self.train.select(features)?,
            scheme,
        })
    }
}

/// Picks the validation scheme for `train`.
///
/// Priority: holdout data, then a custom splitter, then folds carried on the
/// training data (at most `n_folds` of them), otherwise a dummy scheme that
/// trains and validates on every row.
pub fn create_validation_iterator(
    train: Dataset,
    valid: Option<Dataset>,
    n_folds: Option<usize>,
    cv_iter: Option<&dyn CvSplitter>,
) -> Result<ValidationIterator, ValidationError> {
    let scheme = if let Some(valid) = valid {
        Scheme::Holdout(valid.select(train.features())?)
    } else if let Some(splitter) = cv_iter {
        let splits = splitter.split(&train);
        if splits.is_empty() {
            return Err(ValidationError::NoSplits);
        }
        let rows = train.n_rows();
        if let Some(&index) = splits
            .iter()
            .flat_map(|split| split.train_idx.iter().chain(&split.valid_idx))
            .find(|&&index| index >= rows)
        {
            return Err(ValidationError::IndexOutOfRange { index, rows });
        }
        Scheme::Custom(splits)
    } else if let Some(folds) = train.folds() {
        let available = folds.iter().max().map_or(0, |max| max + 1);
        Scheme::Folds(n_folds.map_or(available, |limit| limit.min(available)))
    } else {
        Scheme::Dummy
    };
    Ok(ValidationIterator { train, scheme })
}
