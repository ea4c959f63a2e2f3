//! Data tools: `web_search` (stub), `query_database` (mock), `parse_json`,
//! `parse_yaml`, `parse_xml` (stub).

use crate::error::ToolError;
use crate::tool::{str_param, ParamSchema, Params, Tool};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Perform a web search (stub)."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().required("query", "string", "Search query.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let query = str_param(&params, "query")?;
        Ok(Value::String(format!("stub: web search '{}'", query)))
    }
}

pub struct QueryDatabaseTool;

impl QueryDatabaseTool {
    /// Table named after the first `from` keyword.
    fn table(query: &str) -> Option<String> {
        let lower = query.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        words
            .windows(2)
            .find(|w| w[0] == "from")
            .map(|w| w[1].trim_end_matches(';').trim().to_string())
    }
}

#[async_trait]
impl Tool for QueryDatabaseTool {
    fn name(&self) -> &str {
        "query_database"
    }

    fn description(&self) -> &str {
        "Execute a SQL-like query on a mock database."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().required("query", "string", "SQL query string.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let query = str_param(&params, "query")?;
        match Self::table(query).as_deref() {
            Some("users") => Ok(json!([
                {"id": 1, "name": "Alice"},
                {"id": 2, "name": "Bob"},
            ])),
            _ => Ok(json!([])),
        }
    }
}

pub struct ParseJsonTool;

#[async_trait]
impl Tool for ParseJsonTool {
    fn name(&self) -> &str {
        "parse_json"
    }

    fn description(&self) -> &str {
        "Parse a JSON string into an object."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().required("json", "string", "JSON string.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let text = str_param(&params, "json")?;
        let parsed: serde_json::Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| ToolError::Execution(format!("json unmarshal: {}", e)))?;
        Ok(Value::Object(parsed))
    }
}

pub struct ParseYamlTool;

#[async_trait]
impl Tool for ParseYamlTool {
    fn name(&self) -> &str {
        "parse_yaml"
    }

    fn description(&self) -> &str {
        "Parse a YAML string into an object."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().required("yaml", "string", "YAML string.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let text = str_param(&params, "yaml")?;
        let parsed: serde_json::Map<String, Value> = serde_yaml::from_str(text)
            .map_err(|e| ToolError::Execution(format!("yaml unmarshal: {}", e)))?;
        Ok(Value::Object(parsed))
    }
}

pub struct ParseXmlTool;

/// Bytes of input echoed back by the XML stub.
const XML_PREVIEW: usize = 100;

#[async_trait]
impl Tool for ParseXmlTool {
    fn name(&self) -> &str {
        "parse_xml"
    }

    fn description(&self) -> &str {
        "Parse an XML string (stub)."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().required("xml", "string", "XML string.")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let text = str_param(&params, "xml")?;
        let bytes = &text.as_bytes()[..text.len().min(XML_PREVIEW)];
        Ok(Value::String(format!(
            "Parsed XML: {}",
            String::from_utf8_lossy(bytes)
        )))
    }
}
