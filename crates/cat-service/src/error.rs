//! Error types for the protocol service

use cat_engine::{ExecutionError, StructuralError};
use cat_store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using ServiceError
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced to callers of [`ProtocolService`](crate::ProtocolService)
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No live instance with this id
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// An instance with this id already exists
    #[error("Instance already exists: {0}")]
    InstanceExists(String),

    /// The instance stopped after a fatal fault and accepts no transitions
    #[error("Instance '{instance_id}' is halted: {reason}")]
    InstanceHalted { instance_id: String, reason: String },

    /// No earlier state is kept for this instance
    #[error("Nothing to revert for instance '{0}'")]
    NothingToRevert(String),

    /// The step source could not produce a batch
    #[error("Step source failed: {0}")]
    StepSource(String),

    /// The step batch does not form a valid protocol
    #[error("Protocol rejected: {0}")]
    Structural(#[from] StructuralError),

    /// A transition was rejected or hit corrupted data
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Persistence failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A revert snapshot could not be encoded or decoded
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServiceError {
    /// Create a step source error with a message
    pub fn step_source(msg: impl Into<String>) -> Self {
        Self::StepSource(msg.into())
    }

    /// Create a snapshot error with a message
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Whether the caller can retry or correct the request
    ///
    /// Halts, corrupted data and storage faults are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Execution(e) => e.is_recoverable(),
            Self::Store(StoreError::VersionConflict { .. }) => true,
            Self::InstanceNotFound(_)
            | Self::InstanceExists(_)
            | Self::NothingToRevert(_)
            | Self::StepSource(_)
            | Self::Structural(_) => true,
            _ => false,
        }
    }

    /// Whether a new step batch should be requested from the step source
    pub fn suggests_regeneration(&self) -> bool {
        matches!(self, Self::Structural(_))
    }
}
