//! Common error types for ParcelSync.

use thiserror::Error;

/// Top-level error type for ParcelSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A delta or record failed structural validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network or transport failure talking to the remote API.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compressing or decompressing a payload failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration is invalid (unknown strategy, bad threshold, ...).
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Io(_) | Error::Storage(_)
        )
    }

    /// Whether this error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
