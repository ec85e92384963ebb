//! Error types for dualtrack-memory

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::MemoryId;

/// Long-term backend a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Vector,
    Graph,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Vector => write!(f, "vector"),
            Backend::Graph => write!(f, "graph"),
        }
    }
}

/// Errors that can occur in the memory system
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Input rejected before any state was touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// A long-term backend failed or timed out
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: Backend, reason: String },

    /// Memory not found
    #[error("Memory not found: {0}")]
    NotFound(MemoryId),

    /// Short-term store is full and nothing could be evicted
    #[error("Short-term store at capacity ({capacity})")]
    CapacityExceeded { capacity: usize },

    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Builder error
    #[error("Builder error: {0}")]
    Builder(#[from] crate::record::MemoryRecordBuilderError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a backend-unavailable error
    pub fn unavailable(backend: Backend, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the repair queue should retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Backend this error is attributed to, if any
    pub fn backend(&self) -> Option<Backend> {
        match self {
            Self::BackendUnavailable { backend, .. } => Some(*backend),
            _ => None,
        }
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_backend_failures_are_retryable() {
        assert!(MemoryError::unavailable(Backend::Vector, "timeout").is_retryable());
        assert!(!MemoryError::validation("bad").is_retryable());
        assert!(!MemoryError::NotFound(MemoryId::new()).is_retryable());
        assert!(!MemoryError::CapacityExceeded { capacity: 1 }.is_retryable());
    }

    #[test]
    fn test_backend_display() {
        let err = MemoryError::unavailable(Backend::Graph, "connection refused");
        assert_eq!(err.to_string(), "graph backend unavailable: connection refused");
        assert_eq!(err.backend(), Some(Backend::Graph));
    }
}
