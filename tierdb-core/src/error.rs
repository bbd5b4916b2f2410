//! Error types for TierDB

use thiserror::Error;

/// Result type alias for TierDB operations
pub type Result<T> = std::result::Result<T, TierError>;

/// TierDB error types
#[derive(Error, Debug)]
pub enum TierError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Aggregation interval could not be parsed
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Backend store failure (connection, lock, timeout)
    #[error("Store error: {0}")]
    Store(String),

    /// A compaction batch lost a race with another run
    #[error("Compaction conflict: {0}")]
    Conflict(String),

    /// A batch ran past its deadline and was abandoned
    #[error("Deadline exceeded during {operation} after {elapsed_ms}ms")]
    DeadlineExceeded { operation: &'static str, elapsed_ms: u128 },

    /// Query error
    #[error("Query error: {0}")]
    Query(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TierError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TierError::Io(_)
                | TierError::Store(_)
                | TierError::Conflict(_)
                | TierError::DeadlineExceeded { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TierError::Corruption(_) | TierError::ChecksumMismatch { .. }
        )
    }

    /// Check if error was raised while validating caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, TierError::Config(_) | TierError::InvalidInterval(_))
    }
}

impl From<bincode::Error> for TierError {
    fn from(e: bincode::Error) -> Self {
        TierError::InvalidFormat(e.to_string())
    }
}
