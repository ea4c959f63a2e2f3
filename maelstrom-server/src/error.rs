//! Server error types.

use crate::config::ConfigError;
use serde::Serialize;
use thiserror::Error;

/// Who caused a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Client,
    Server,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] maelstrom_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] maelstrom_storage::StorageError),

    #[error("agent error: {0}")]
    Agent(#[from] maelstrom_engine::AgentError),

    #[error("LLM error: {0}")]
    Llm(#[from] maelstrom_engine::LlmError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServerError {
    /// Returns an error code for command responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "INTERNAL_ERROR",
            ServerError::Json(_) => "BAD_REQUEST",
            ServerError::Core(e) => e.error_code(),
            ServerError::Storage(e) => e.error_code(),
            ServerError::Agent(e) => e.error_code(),
            ServerError::Llm(e) => e.error_code(),
            ServerError::Config(_) => "CONFIG_ERROR",
            ServerError::InvalidRequest(_) => "BAD_REQUEST",
        }
    }

    /// Classifies the error as the caller's fault or the server's.
    pub fn class(&self) -> ErrorClass {
        let client = match self {
            ServerError::Json(_) | ServerError::InvalidRequest(_) => true,
            ServerError::Core(e) => e.is_validation(),
            ServerError::Storage(e) => e.is_client_error(),
            ServerError::Agent(e) => matches!(
                e,
                maelstrom_engine::AgentError::UnknownAgent(_)
                    | maelstrom_engine::AgentError::InvalidTemplate(_)
            ),
            _ => false,
        };
        if client {
            ErrorClass::Client
        } else {
            ErrorClass::Server
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Llm(e) => e.is_retryable(),
            _ => self.class() == ErrorClass::Server && self.error_code() == "INTERNAL_ERROR",
        }
    }
}
