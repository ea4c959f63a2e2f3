//! Tool error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    NotFound(String),

    #[error("policy denied tool '{tool}': {reason}")]
    PolicyDenied { tool: String, reason: String },

    #[error("tool '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("tool '{0}' cancelled")]
    Cancelled(String),
}

impl ToolError {
    pub fn policy(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::PolicyDenied {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "TOOL_NOT_FOUND",
            ToolError::PolicyDenied { .. } => "POLICY_DENIED",
            ToolError::Timeout { .. } => "TOOL_TIMEOUT",
            ToolError::InvalidParams(_) => "INVALID_PARAMS",
            ToolError::Execution(_) => "TOOL_FAILED",
            ToolError::Cancelled(_) => "CANCELLED",
        }
    }

    /// Returns whether retrying the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }
}
