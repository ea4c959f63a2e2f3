//! The `Tool` trait and the schema it advertises to the LLM.

use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Tool parameters: a JSON object.
pub type Params = Map<String, Value>;

/// One property of a parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamProperty {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// JSON-schema object describing a tool's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(rename = "type")]
    pub kind: String,

    pub properties: BTreeMap<String, ParamProperty>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl ParamSchema {
    pub fn object() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    /// Adds a required property.
    pub fn required(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.required.push(name.to_string());
        self.optional(name, kind, description)
    }

    /// Adds an optional property.
    pub fn optional(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.properties.insert(
            name.to_string(),
            ParamProperty {
                kind: kind.to_string(),
                description: description.to_string(),
            },
        );
        self
    }
}

/// A tool as described to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: ParamSchema,
}

/// An executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> ParamSchema;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters(),
        }
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError>;
}

/// Reads a required string parameter.
pub fn str_param<'a>(params: &'a Params, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParams(format!("{} must be string", key)))
}

/// Reads an optional string parameter; missing or non-string is `None`.
pub fn opt_str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}
