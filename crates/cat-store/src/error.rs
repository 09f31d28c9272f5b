//! Error types for protocol storage

use cat_engine::StructuralError;
use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by [`ProtocolStore`](crate::ProtocolStore)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database directory could not be created
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No instance with this id is stored
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// No graph with this id is stored
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    /// An instance with this id is already stored
    #[error("Instance already exists: {0}")]
    InstanceExists(String),

    /// Another writer committed first
    #[error("Version conflict for instance '{instance_id}': expected {expected}, found {actual}")]
    VersionConflict {
        instance_id: String,
        expected: u64,
        actual: u64,
    },

    /// The stored graph no longer hashes to its recorded fingerprint
    #[error("Fingerprint mismatch for graph '{graph_id}': recorded {expected}, computed {actual}")]
    FingerprintMismatch {
        graph_id: String,
        expected: String,
        actual: String,
    },

    /// The stored graph fails validation
    #[error("Stored graph is invalid: {0}")]
    InvalidGraph(#[from] StructuralError),

    /// Rows that cannot be turned back into a graph or state
    #[error("Stored data is corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Create a corrupted data error with a message
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Whether the stored data itself is damaged
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::FingerprintMismatch { .. } | Self::InvalidGraph(_) | Self::Corrupted(_)
        )
    }
}
