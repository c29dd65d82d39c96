use std::path::PathBuf;
use thiserror::Error;

/// Result alias for store routines.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by dataset, constants, and volume containers. Data-shaped
/// variants are fatal for a single forecast date; a multi-date run reports
/// them with their date and field context and moves on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dataset for field {field} not found at {path}")]
    MissingDataset { field: String, path: PathBuf },
    #[error("field {field}: initialization time {date} is not in the dataset")]
    MissingDate { field: String, date: i64 },
    #[error("field {field}: no forecast step at lead hour {hour}")]
    StepNotCovered { field: String, hour: i64 },
    #[error("field {field}: step offset resolves to index {index} outside 0..{len}")]
    StepOutOfRange {
        field: String,
        index: i64,
        len: usize,
    },
    #[error("{context}: expected {axis} length {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        axis: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{path}: container is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("field {field}: dataset carries variable {got}, input mapping expects {expected}")]
    VariableMismatch {
        field: String,
        expected: String,
        got: String,
    },
    #[error("volume slot out of range: {axis} index {index} not below {len}")]
    SlotOutOfRange {
        axis: &'static str,
        index: usize,
        len: usize,
    },
    #[error("constants: {message}")]
    BadConstants { message: String },
    #[error("io error on {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

pub(crate) fn io_at(path: &std::path::Path, err: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

pub(crate) fn serde_error(err: impl ToString) -> StoreError {
    StoreError::Serialization {
        message: err.to_string(),
    }
}
