//! `bash_exec`: run a bash command.
//!
//! Redirections and `tee` pipes are rejected outright. Allow and forbid
//! lists come from tool policies and are checked by the registry before the
//! tool runs. The child is killed if the call is dropped, which is how the
//! registry's hard timeout and cancellation reach the process.

use crate::error::ToolError;
use crate::policy::SHELL_TOOL;
use crate::tool::{opt_str_param, str_param, ParamSchema, Params, Tool};
use async_trait::async_trait;
use maelstrom_core::parse_duration;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Timeout used when the caller does not give one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct BashExecTool;

impl BashExecTool {
    fn is_write(command: &str) -> bool {
        command.contains(" >")
            || command.contains('<')
            || (command.contains('|') && command.contains("tee"))
    }
}

#[async_trait]
impl Tool for BashExecTool {
    fn name(&self) -> &str {
        SHELL_TOOL
    }

    fn description(&self) -> &str {
        "Execute a bash command (sandboxed via policies, max 5s timeout)."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object()
            .required("command", "string", "Bash command.")
            .optional("timeout", "string", "Timeout e.g. \"30s\".")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let command = str_param(&params, "command")?;
        if Self::is_write(command) {
            return Err(ToolError::policy(
                SHELL_TOOL,
                "write commands not allowed (read-only)",
            ));
        }

        let timeout = match opt_str_param(&params, "timeout") {
            Some(raw) => parse_duration(raw)
                .map_err(|e| ToolError::InvalidParams(format!("invalid timeout: {}", e)))?,
            None => DEFAULT_TIMEOUT,
        };

        tracing::info!("bash_exec: {}", command);

        let child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| ToolError::Timeout {
                tool: SHELL_TOOL.to_string(),
                timeout,
            })?
            .map_err(|e| ToolError::Execution(format!("spawn bash: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Execution(format!(
                "stderr: {}\nerror: {}",
                stderr.trim(),
                output.status
            )));
        }
        Ok(Value::String(stdout))
    }
}
