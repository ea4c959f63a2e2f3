//! Core error types.

use thiserror::Error;

/// Errors from spec parsing, compilation and the statechart runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("invalid timeout '{value}' on state '{state}': {reason}")]
    InvalidTimeout {
        state: String,
        value: String,
        reason: String,
    },

    #[error("unknown state path: {path}")]
    UnknownState { path: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("runtime not started")]
    NotStarted,

    #[error("runtime already stopped")]
    Stopped,

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether the error was caused by the caller's input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidSpec { .. }
                | CoreError::InvalidTimeout { .. }
                | CoreError::UnknownState { .. }
                | CoreError::InvalidGuard { .. }
                | CoreError::Yaml(_)
                | CoreError::Json(_)
        )
    }

    /// Returns an error code suitable for command responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidSpec { .. } => "VALIDATION_ERROR",
            CoreError::InvalidTimeout { .. } => "VALIDATION_ERROR",
            CoreError::UnknownState { .. } => "VALIDATION_ERROR",
            CoreError::InvalidGuard { .. } => "VALIDATION_ERROR",
            CoreError::NotStarted => "RUNTIME_ERROR",
            CoreError::Stopped => "RUNTIME_ERROR",
            CoreError::Yaml(_) => "BAD_REQUEST",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}
