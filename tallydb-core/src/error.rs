//! Error types for TallyDB

use thiserror::Error;

/// Result type alias for TallyDB operations
pub type Result<T> = std::result::Result<T, TallyError>;

/// TallyDB error types
#[derive(Error, Debug)]
pub enum TallyError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid block or engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record or point index outside the addressable range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Segment allocation or flush failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// On-disk state does not match the expected layout
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Database not found
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Check if error is retryable
    ///
    /// Nothing in the engine retries on its own; this only tells the caller
    /// whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TallyError::Io(_) | TallyError::Storage(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, TallyError::Corruption(_))
    }
}
