use std::path::PathBuf;
use thiserror::Error;

use super::manifest::DatasetKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A live file is missing, truncated or cannot be decoded.
    #[error("storage corruption at {path}: {reason}")]
    StorageCorruption { path: PathBuf, reason: String },

    #[error("partition '{partition}' of dataset '{dataset}' has no column '{column}'")]
    SchemaMismatch {
        dataset: String,
        partition: String,
        column: String,
    },

    #[error("dataset '{dataset}' is stored as {found:?}, not {expected:?}")]
    KindMismatch {
        dataset: String,
        expected: DatasetKind,
        found: DatasetKind,
    },

    #[error(
        "append to '{dataset}/{partition}' overlaps stored data (stored through {stored_max}, new data from {new_min})"
    )]
    Overlap {
        dataset: String,
        partition: String,
        stored_max: i64,
        new_min: i64,
    },

    #[error("encoding error: {0}")]
    Codec(String),

    #[error("invalid dataset name '{0}'")]
    InvalidName(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::StorageCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::StorageCorruption { .. })
    }
}

impl From<polars::prelude::PolarsError> for StoreError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        StoreError::Codec(e.to_string())
    }
}
