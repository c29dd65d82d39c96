use thiserror::Error;

/// Result alias used throughout the core pipeline.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised while preparing model inputs.
///
/// Configuration violations (`UnknownField`, `MissingStatistic`,
/// `ChannelOrderMismatch`) are fatal for the whole run and surface before
/// any sampling starts; the data-shaped variants are fatal for a single
/// forecast date only.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// No normalization rule covers the named field.
    #[error("no normalization rule covers field {field}")]
    UnknownField { field: String },
    /// The moments table lacks an entry a rule needs.
    #[error("moments table has no entry for field {field}")]
    MissingStatistic { field: String },
    /// A stored statistic cannot parameterise its rule.
    #[error("field {field}: {stat} statistic is degenerate and cannot scale values")]
    DegenerateStatistic { field: String, stat: &'static str },
    /// A configured field is absent from the assembled channel set.
    #[error("configured field {field} is missing from the assembled channels")]
    ChannelOrderMismatch { field: String },
    /// Grid dimensions disagree with what the layout expects.
    #[error("field {field}: expected grid {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    GridMismatch {
        field: String,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    /// A grid constructor received an empty axis.
    #[error("field {field}: grids must have non-zero dimensions")]
    EmptyGrid { field: String },
    /// Every member is missing at some cell, so no statistic exists there.
    #[error("field {field} step {step}: no valid members at cell ({row}, {col})")]
    InsufficientMembers {
        field: String,
        step: usize,
        row: usize,
        col: usize,
    },
    /// Wrapper around I/O failures when persisting or restoring tables.
    #[error("io error: {message}")]
    Io { message: String },
    /// Wrapper around serde failures.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

pub(crate) fn io_error(err: std::io::Error) -> CoreError {
    CoreError::Io {
        message: err.to_string(),
    }
}

pub(crate) fn serde_error(err: impl ToString) -> CoreError {
    CoreError::Serialization {
        message: err.to_string(),
    }
}
