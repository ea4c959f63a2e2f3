//! LLM transport.
//!
//! A single-turn "prompt in, text out" call against Anthropic, OpenAI or
//! OpenRouter. The caller is a trait so actions can be driven by a scripted
//! model in tests.

use crate::config::ResolvedConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com";
pub const OPENAI_ENDPOINT: &str = "https://api.openai.com";
pub const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Connection settings for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub endpoint: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl LlmConfig {
    /// Builds call settings from a resolved config. The endpoint is the
    /// configured base URL or the provider's public API.
    pub fn from_resolved(resolved: &ResolvedConfig) -> Self {
        let endpoint = resolved
            .base_url
            .clone()
            .unwrap_or_else(|| default_endpoint(&resolved.provider).to_string());
        Self {
            provider: resolved.provider.clone(),
            model: resolved.model.clone(),
            api_key: resolved.api_key.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            temperature: resolved.temperature,
            max_tokens: resolved.max_tokens,
        }
    }
}

fn default_endpoint(provider: &str) -> &'static str {
    match provider {
        "openai" => OPENAI_ENDPOINT,
        "openrouter" => OPENROUTER_ENDPOINT,
        _ => ANTHROPIC_ENDPOINT,
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no content in response")]
    EmptyResponse,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn error_code(&self) -> &'static str {
        match self {
            LlmError::UnsupportedProvider(_) => "LLM_UNSUPPORTED_PROVIDER",
            LlmError::Status { .. } => "LLM_HTTP_ERROR",
            LlmError::EmptyResponse => "LLM_EMPTY_RESPONSE",
            LlmError::Transport(_) => "LLM_TRANSPORT_ERROR",
            LlmError::Cancelled => "LLM_CANCELLED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Transport(_) => true,
            _ => false,
        }
    }
}

/// Sends one prompt and returns the model's text reply.
#[async_trait]
pub trait LlmCaller: Send + Sync {
    async fn call(&self, config: &LlmConfig, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// reqwest-backed caller.
#[derive(Debug, Clone)]
pub struct HttpLlmCaller {
    client: reqwest::Client,
}

impl Default for HttpLlmCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpLlmCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Uses a caller-supplied client, e.g. one with a request timeout.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a client with an overall request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post(&self, request: reqwest::RequestBuilder) -> Result<String, LlmError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl LlmCaller for HttpLlmCaller {
    async fn call(&self, config: &LlmConfig, prompt: &str) -> Result<String, LlmError> {
        let payload = ChatRequest {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        match config.provider.as_str() {
            "anthropic" => {
                let request = self
                    .client
                    .post(format!("{}/v1/messages", config.endpoint))
                    .header("x-api-key", &config.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&payload);
                let body = self.post(request).await?;
                let parsed: AnthropicResponse =
                    serde_json::from_str(&body).map_err(|_| LlmError::EmptyResponse)?;
                parsed
                    .content
                    .into_iter()
                    .next()
                    .and_then(|block| block.text)
                    .ok_or(LlmError::EmptyResponse)
            }
            "openai" | "openrouter" => {
                let url = if config.provider == "openai" {
                    format!("{}/v1/chat/completions", config.endpoint)
                } else {
                    format!("{}/api/v1/chat/completions", config.endpoint)
                };
                let mut request = self
                    .client
                    .post(url)
                    .bearer_auth(&config.api_key)
                    .json(&payload);
                if config.provider == "openrouter" {
                    request = request
                        .header("HTTP-Referer", "https://github.com/maelstrom")
                        .header("X-Title", "Maelstrom");
                }
                let body = self.post(request).await?;
                let parsed: OpenAiResponse =
                    serde_json::from_str(&body).map_err(|_| LlmError::EmptyResponse)?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .ok_or(LlmError::EmptyResponse)
            }
            other => Err(LlmError::UnsupportedProvider(other.to_string())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigResolver;
    use serde_json::json;

    #[test]
    fn test_endpoint_selection() {
        let resolver = ConfigResolver::default();
        let config = LlmConfig::from_resolved(&resolver.resolve(None, None, None));
        assert_eq!(config.endpoint, ANTHROPIC_ENDPOINT);

        let machine = json!({"llm": {"provider": "openrouter"}});
        let config = LlmConfig::from_resolved(&resolver.resolve(Some(&machine), None, None));
        assert_eq!(config.endpoint, OPENROUTER_ENDPOINT);

        let machine = json!({"llm": {"provider": "openai", "base_url": "http://127.0.0.1:1/"}});
        let config = LlmConfig::from_resolved(&resolver.resolve(Some(&machine), None, None));
        assert_eq!(config.endpoint, "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        let machine = json!({"llm": {"provider": "carrier-pigeon"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), None, None);
        let err = HttpLlmCaller::new()
            .call(&LlmConfig::from_resolved(&resolved), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::UnsupportedProvider(_)));
        assert_eq!(err.error_code(), "LLM_UNSUPPORTED_PROVIDER");
    }

    #[test]
    fn test_payload_shape() {
        let payload = ChatRequest {
            model: "m",
            max_tokens: 10,
            temperature: 0.5,
            messages: [ChatMessage {
                role: "user",
                content: "hello",
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            json!({
                "model": "m",
                "max_tokens": 10,
                "temperature": 0.5,
                "messages": [{"role": "user", "content": "hello"}],
            })
        );
    }

    #[test]
    fn test_response_parsing() {
        let anthropic: AnthropicResponse =
            serde_json::from_str(r#"{"content": [{"type": "text", "text": "{}"}]}"#).unwrap();
        assert_eq!(anthropic.content[0].text.as_deref(), Some("{}"));

        let openai: OpenAiResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"role": "assistant", "content": "ok"}}]}"#)
                .unwrap();
        assert_eq!(openai.choices[0].message.content.as_deref(), Some("ok"));
    }

    #[test]
    fn test_retryable() {
        let err = LlmError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(!LlmError::EmptyResponse.is_retryable());
    }
}
