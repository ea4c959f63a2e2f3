//! Filesystem tools: `read_file`, `write_file`, `list_files`.

use crate::error::ToolError;
use crate::tool::{opt_str_param, str_param, ParamSchema, Params, Tool};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().required("file_path", "string", "Absolute path to the file.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let path = str_param(&params, "file_path")?;
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolError::Execution(format!("read file: {}", e)))?;
        Ok(Value::String(data))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write string content to a file."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object()
            .required("file_path", "string", "Absolute path to the file.")
            .required("content", "string", "Content to write.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let path = str_param(&params, "file_path")?;
        let content = str_param(&params, "content")?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ToolError::Execution(format!("write file: {}", e)))?;
        Ok(Value::String("File written successfully".to_string()))
    }
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files by glob pattern."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object()
            .required("pattern", "string", "Glob pattern e.g. **/*.rs")
            .optional("path", "string", "Base directory, default cwd.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let pattern = str_param(&params, "pattern")?;
        let base = opt_str_param(&params, "path").unwrap_or(".");
        let full = Path::new(base).join(pattern).to_string_lossy().into_owned();

        let matches = tokio::task::spawn_blocking(move || -> Result<Vec<Value>, ToolError> {
            let paths =
                glob::glob(&full).map_err(|e| ToolError::InvalidParams(format!("glob: {}", e)))?;
            Ok(paths
                .filter_map(Result::ok)
                .map(|p| Value::String(p.to_string_lossy().into_owned()))
                .collect())
        })
        .await
        .map_err(|e| ToolError::Execution(format!("glob task: {}", e)))??;

        Ok(Value::Array(matches))
    }
}
