//! Error types for `lateral`.

use thiserror::Error;

/// Errors that can occur during index construction, persistence, and search.
#[derive(Debug, Error)]
pub enum LateError {
    /// The embedding source failed or timed out; the build or search aborts cleanly.
    #[error("embedding source unavailable: {0}")]
    EncodingUnavailable(String),

    /// Training sample too small for the requested cluster count, even after degrading.
    #[error("insufficient training data: {got} samples for {wanted} clusters")]
    InsufficientTrainingData { got: usize, wanted: usize },

    /// Manifest and on-disk store disagree. Fatal; no partial recovery.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// Lookup or delete on an unknown document id.
    #[error("document {0} not found")]
    DocumentNotFound(u32),

    /// Dimension mismatch between a vector and the index.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Build was cancelled at a batch boundary; prior committed state is intact.
    #[error("build cancelled")]
    Cancelled,

    /// I/O error (file operations, disk I/O).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (bincode, serde_json).
    #[error("serialization error: {0}")]
    Persist(String),
}

impl From<bincode::Error> for LateError {
    fn from(e: bincode::Error) -> Self {
        LateError::Persist(e.to_string())
    }
}

impl From<serde_json::Error> for LateError {
    fn from(e: serde_json::Error) -> Self {
        LateError::Persist(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LateError>;
