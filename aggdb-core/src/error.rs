//! Error types for AggDB

use crate::chunk::ChunkId;
use thiserror::Error;

/// Result type alias for AggDB operations
pub type Result<T> = std::result::Result<T, AggregationError>;

/// AggDB error types
#[derive(Error, Debug)]
pub enum AggregationError {
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

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key not declared in the aggregation structure
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Measure not declared in the aggregation structure
    #[error("Unknown measure: {0}")]
    UnknownMeasure(String),

    /// Input record does not fit the declared layout
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Chunk storage failure (read, write or id allocation)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Chunk is not visible in storage
    #[error("Chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    /// Diff does not apply to the current chunk index
    #[error("Invalid diff: {0}")]
    InvalidDiff(String),

    /// Stream was abandoned by its peer
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AggregationError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, AggregationError::Io(_) | AggregationError::Storage(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            AggregationError::Corruption(_) | AggregationError::ChecksumMismatch { .. }
        )
    }

    /// Check if error was raised while validating a request
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            AggregationError::Config(_)
                | AggregationError::UnknownKey(_)
                | AggregationError::UnknownMeasure(_)
                | AggregationError::InvalidRecord(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(AggregationError::Storage("down".into()).is_retryable());
        assert!(!AggregationError::Config("bad".into()).is_retryable());
        assert!(AggregationError::UnknownKey("k".into()).is_config());
        assert!(AggregationError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
    }
}
