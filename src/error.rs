//! Error types for Memvault

use thiserror::Error;

use crate::types::BatchOperationResult;

/// Result type alias for Memvault operations
pub type Result<T> = std::result::Result<T, MemvaultError>;

/// Main error type for Memvault
#[derive(Error, Debug)]
pub enum MemvaultError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid filter or request: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A batch whose single commit failed. The report has already been
    /// flipped to `successful = 0, failed = total`.
    #[error("Batch {} aborted: {reason}", report.operation_type)]
    BatchAborted {
        report: Box<BatchOperationResult>,
        reason: String,
    },

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl MemvaultError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// The error every lookup of an unknown memory ID produces
    pub fn memory_not_found(id: &str) -> Self {
        Self::NotFound(format!("Memory \"{}\" not found", id))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the error came from the persistence layer
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            MemvaultError::Database(_)
                | MemvaultError::Storage(_)
                | MemvaultError::Io(_)
                | MemvaultError::BatchAborted { .. }
        )
    }

    /// Whether a caller can recover by correcting the request
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemvaultError::NotFound(_)
                | MemvaultError::AlreadyExists(_)
                | MemvaultError::Validation(_)
        )
    }

    /// Get error code for the tool-call protocol
    pub fn code(&self) -> i64 {
        match self {
            MemvaultError::NotFound(_) => -32001,
            MemvaultError::Validation(_) => -32602,
            MemvaultError::AlreadyExists(_) => -32005,
            MemvaultError::LimitExceeded(_) => -32003,
            MemvaultError::BatchAborted { .. } => -32007,
            _ => -32000,
        }
    }
}
