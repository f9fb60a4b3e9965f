//! Error types for the spatiotemporal forecaster.

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while building or running the forecaster
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A positional index would fall outside the learned position table
    #[error("sequence length {len} exceeds max_seq_len {max_seq_len}")]
    SequenceTooLong { len: usize, max_seq_len: usize },

    /// Two tensors or a tensor and a layer disagree on a dimension
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Embedding method is neither `spatio-temporal` nor `temporal`
    #[error("invalid embed method `{0}` (expected `spatio-temporal` or `temporal`)")]
    InvalidEmbedMethod(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation metric handed to the scheduler is not finite
    #[error("validation metric must be finite, got {0}")]
    InvalidMetric(f64),
}
