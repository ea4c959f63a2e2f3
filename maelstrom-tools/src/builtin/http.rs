//! `send_http_request`: plain HTTP client tool.

use crate::error::ToolError;
use crate::tool::{opt_str_param, str_param, ParamSchema, Params, Tool};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AGENT: &str = "Maelstrom-Tool/1.0";

pub struct SendHttpRequestTool {
    client: reqwest::Client,
}

impl SendHttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SendHttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SendHttpRequestTool {
    fn name(&self) -> &str {
        "send_http_request"
    }

    fn description(&self) -> &str {
        "Send an HTTP request to a URL."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object()
            .required("url", "string", "Target URL.")
            .optional("method", "string", "HTTP method (default: GET).")
            .optional("body", "string", "Request body (JSON).")
    }

    async fn execute(&self, params: Params) -> Result<Value, ToolError> {
        let url = str_param(&params, "url")?;
        let method = opt_str_param(&params, "method").unwrap_or("GET");
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| ToolError::InvalidParams(format!("invalid method '{}'", method)))?;

        let mut request = self
            .client
            .request(method, url)
            .timeout(REQUEST_TIMEOUT)
            .header(USER_AGENT, AGENT);
        if let Some(body) = opt_str_param(&params, "body") {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("http request: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("read response: {}", e)))?;

        let status_line = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };

        Ok(json!({
            "status_code": status.as_u16(),
            "status": status_line,
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url() {
        let result = SendHttpRequestTool::new().execute(Params::new()).await;
        assert!(matches!(result, Err(ToolError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let mut params = Params::new();
        params.insert("url".into(), Value::String("http://127.0.0.1:1/".into()));
        let result = SendHttpRequestTool::new().execute(params).await;
        assert!(matches!(result, Err(ToolError::Execution(_))));
    }
}
