//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("unknown event '{event}' for machine {machine}")]
    UnknownEvent { machine: String, event: String },

    #[error("catalog entry not found: {0}")]
    EntryNotFound(String),

    #[error("invalid id: {0:?}")]
    InvalidId(String),

    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("core error: {0}")]
    Core(#[from] maelstrom_core::CoreError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "INTERNAL_ERROR",
            StorageError::Json(_) => "DATA_CORRUPTION",
            StorageError::MachineNotFound(_) => "MACHINE_NOT_FOUND",
            StorageError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            StorageError::UnknownEvent { .. } => "UNKNOWN_EVENT",
            StorageError::EntryNotFound(_) => "NOT_FOUND",
            StorageError::InvalidId(_) => "BAD_REQUEST",
            StorageError::Persistence { .. } => "PERSISTENCE_ERROR",
            StorageError::Core(e) => e.error_code(),
            StorageError::Task(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error was caused by the request rather than the
    /// server.
    pub fn is_client_error(&self) -> bool {
        match self {
            StorageError::MachineNotFound(_)
            | StorageError::InstanceNotFound(_)
            | StorageError::UnknownEvent { .. }
            | StorageError::EntryNotFound(_)
            | StorageError::InvalidId(_) => true,
            StorageError::Core(e) => e.is_validation(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Task(e.to_string())
    }
}
