//! Builtin tools.

mod data;
mod fs;
mod http;
mod shell;

pub use data::{ParseJsonTool, ParseXmlTool, ParseYamlTool, QueryDatabaseTool, WebSearchTool};
pub use fs::{ListFilesTool, ReadFileTool, WriteFileTool};
pub use http::SendHttpRequestTool;
pub use shell::BashExecTool;

use crate::registry::ToolRegistry;

/// Registers the ten builtin tools.
pub fn register_all(registry: &ToolRegistry) {
    registry.register(ReadFileTool);
    registry.register(WriteFileTool);
    registry.register(WebSearchTool);
    registry.register(BashExecTool);
    registry.register(ListFilesTool);
    registry.register(QueryDatabaseTool);
    registry.register(SendHttpRequestTool::new());
    registry.register(ParseJsonTool);
    registry.register(ParseYamlTool);
    registry.register(ParseXmlTool);
}
