use thiserror::Error;

use tp_core::CoreError;
use tp_store::StoreError;

/// Result alias for sampling routines.
pub type SampleResult<T> = std::result::Result<T, SampleError>;

/// Errors that end a date's sampling. None of them can leave a partially
/// published ensemble behind: the volume is only renamed into place after
/// every member slot is filled.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The capability failed twice for one member. Never skipped; the whole
    /// date's output is withheld.
    #[error("member {member}: generative capability failed after retry: {message}")]
    SampleFailed { member: usize, message: String },
    /// The run was cancelled between members.
    #[error("sampling cancelled before member {member}")]
    Cancelled { member: usize },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
