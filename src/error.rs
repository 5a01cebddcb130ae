//! Error types for vaultsync

use thiserror::Error;

use crate::core::operations::OperationId;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Resource '{resource_id}' is locked by operation {holder}")]
    LockConflict {
        resource_id: String,
        holder: OperationId,
    },

    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Backend error during {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Operation blocked: {0}")]
    Blocked(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State error: {0}")]
    State(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CoordError {
    /// Wrap a failure coming out of the backend boundary with the name of the call.
    pub fn backend(operation: &str, err: impl std::fmt::Display) -> Self {
        CoordError::Backend {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, CoordError::LockConflict { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
