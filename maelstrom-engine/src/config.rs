//! LLM configuration hierarchy.
//!
//! An action's effective LLM settings are read from up to three `llm`
//! fragments. Scalars take the first value found in action, machine, guard
//! order, then the application default. Tool policies and allowed actions are
//! read from the machine fragment only.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Application-wide LLM defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmDefaults {
    pub model: String,
    pub provider: String,
    pub base_url: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Literal key or `env:NAME`.
    pub api_key: String,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20240620".to_string(),
            provider: "anthropic".to_string(),
            base_url: None,
            temperature: 0.7,
            max_tokens: 4096,
            api_key: String::new(),
        }
    }
}

impl LlmDefaults {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("MAELSTROM_DEFAULT_MODEL") {
            self.model = model;
        }

        if let Ok(provider) = std::env::var("MAELSTROM_DEFAULT_PROVIDER") {
            self.provider = provider;
        }

        if let Ok(url) = std::env::var("MAELSTROM_DEFAULT_BASE_URL") {
            self.base_url = (!url.is_empty()).then_some(url);
        }

        if let Ok(temp) = std::env::var("MAELSTROM_DEFAULT_TEMPERATURE") {
            if let Ok(t) = temp.parse() {
                self.temperature = t;
            }
        }

        if let Ok(max) = std::env::var("MAELSTROM_DEFAULT_MAX_TOKENS") {
            if let Ok(n) = max.parse() {
                self.max_tokens = n;
            }
        }

        if let Ok(key) = std::env::var("MAELSTROM_DEFAULT_API_KEY") {
            self.api_key = key;
        }
    }
}

/// Effective LLM settings for one action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub model: String,
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tool_policies: Vec<String>,
    pub allowed_actions: Vec<String>,
}

impl ResolvedConfig {
    /// JSON form used in catalog listings.
    pub fn to_json(&self) -> Value {
        json!({
            "model": self.model,
            "provider": self.provider,
            "api_key": self.api_key,
            "base_url": self.base_url,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "tool_policies": self.tool_policies,
            "allowed_actions": self.allowed_actions,
        })
    }
}

/// Resolves LLM settings against the application defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    defaults: LlmDefaults,
}

impl ConfigResolver {
    pub fn new(defaults: LlmDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &LlmDefaults {
        &self.defaults
    }

    /// Resolves settings from the machine, action and guard fragments. Each
    /// fragment is a map whose `llm` key holds the settings.
    pub fn resolve(
        &self,
        machine: Option<&Value>,
        action: Option<&Value>,
        guard: Option<&Value>,
    ) -> ResolvedConfig {
        let machine_llm = llm_map(machine);
        let levels = [llm_map(action), machine_llm, llm_map(guard)];

        let model = first_string(&levels, "model").unwrap_or(&self.defaults.model);
        let provider = first_string(&levels, "provider").unwrap_or(&self.defaults.provider);
        let api_key = first_string(&levels, "api_key").unwrap_or(&self.defaults.api_key);
        let base_url = levels
            .iter()
            .flatten()
            .find_map(|llm| llm.get("base_url").and_then(Value::as_str).filter(|s| !s.is_empty()))
            .map(str::to_string)
            .or_else(|| self.defaults.base_url.clone());
        let temperature = levels
            .iter()
            .flatten()
            .find_map(|llm| llm.get("temperature").and_then(as_float))
            .unwrap_or(self.defaults.temperature);
        let max_tokens = levels
            .iter()
            .flatten()
            .find_map(|llm| llm.get("max_tokens").and_then(as_count))
            .unwrap_or(self.defaults.max_tokens);

        ResolvedConfig {
            model: model.to_string(),
            provider: provider.to_string(),
            api_key: resolve_api_key(api_key),
            base_url,
            temperature,
            max_tokens,
            tool_policies: string_list(machine_llm, "tool_policies"),
            allowed_actions: string_list(machine_llm, "allowed_actions"),
        }
    }
}

fn llm_map(fragment: Option<&Value>) -> Option<&Map<String, Value>> {
    fragment?.get("llm")?.as_object()
}

fn first_string<'a>(levels: &[Option<&'a Map<String, Value>>], key: &str) -> Option<&'a str> {
    levels
        .iter()
        .flatten()
        .find_map(|llm| llm.get(key).and_then(Value::as_str))
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) if !s.is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_list(llm: Option<&Map<String, Value>>, key: &str) -> Vec<String> {
    llm.and_then(|m| m.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `env:NAME` reads the variable (empty if unset); anything else is literal.
fn resolve_api_key(raw: &str) -> String {
    match raw.strip_prefix("env:") {
        Some(name) if !name.is_empty() => std::env::var(name).unwrap_or_default(),
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let resolved = ConfigResolver::default().resolve(None, None, None);
        assert_eq!(resolved.model, "claude-3-5-sonnet-20240620");
        assert_eq!(resolved.provider, "anthropic");
        assert_eq!(resolved.temperature, 0.7);
        assert_eq!(resolved.max_tokens, 4096);
        assert_eq!(resolved.base_url, None);
        assert!(resolved.tool_policies.is_empty());
    }

    #[test]
    fn test_precedence_action_machine_guard() {
        let machine = json!({"llm": {"model": "m-model", "provider": "openai", "temperature": 0.2}});
        let action = json!({"llm": {"model": "a-model"}});
        let guard = json!({"llm": {"model": "g-model", "max_tokens": 99, "provider": "g"}});

        let resolved =
            ConfigResolver::default().resolve(Some(&machine), Some(&action), Some(&guard));
        assert_eq!(resolved.model, "a-model");
        assert_eq!(resolved.provider, "openai");
        assert_eq!(resolved.temperature, 0.2);
        assert_eq!(resolved.max_tokens, 99);
    }

    #[test]
    fn test_string_encoded_numbers() {
        let machine = json!({"llm": {"temperature": "0.25", "max_tokens": "512"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), None, None);
        assert_eq!(resolved.temperature, 0.25);
        assert_eq!(resolved.max_tokens, 512);

        let action = json!({"llm": {"temperature": "warm"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), Some(&action), None);
        assert_eq!(resolved.temperature, 0.25);
    }

    #[test]
    fn test_lists_from_machine_only() {
        let machine = json!({"llm": {"tool_policies": ["rate_limit: 2/min", 7, "cost: 1"]}});
        let action = json!({"llm": {"tool_policies": ["ignored"], "allowed_actions": ["x"]}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), Some(&action), None);
        assert_eq!(resolved.tool_policies, vec!["rate_limit: 2/min", "cost: 1"]);
        assert!(resolved.allowed_actions.is_empty());
    }

    #[test]
    fn test_base_url_skips_empty() {
        let action = json!({"llm": {"base_url": ""}});
        let machine = json!({"llm": {"base_url": "http://localhost:9000"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), Some(&action), None);
        assert_eq!(resolved.base_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_api_key_from_env() {
        std::env::set_var("MAELSTROM_TEST_RESOLVER_KEY", "sk-test");
        let machine = json!({"llm": {"api_key": "env:MAELSTROM_TEST_RESOLVER_KEY"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), None, None);
        assert_eq!(resolved.api_key, "sk-test");

        let machine = json!({"llm": {"api_key": "env:MAELSTROM_TEST_UNSET_KEY_XYZ"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), None, None);
        assert_eq!(resolved.api_key, "");

        let machine = json!({"llm": {"api_key": "literal"}});
        let resolved = ConfigResolver::default().resolve(Some(&machine), None, None);
        assert_eq!(resolved.api_key, "literal");
    }

    #[test]
    fn test_resolutions_do_not_alias() {
        let resolver = ConfigResolver::default();
        let machine = json!({"llm": {"tool_policies": ["cost: 1"]}});
        let strict = json!({"llm": {"model": "judge", "temperature": 0.0}});
        let loose = json!({"llm": {"model": "scout", "max_tokens": 64}});

        let mut first = resolver.resolve(Some(&machine), None, Some(&strict));
        let second = resolver.resolve(Some(&machine), None, Some(&loose));
        assert_eq!(first.model, "judge");
        assert_eq!(second.model, "scout");
        assert_eq!(first.max_tokens, 4096);
        assert_eq!(second.temperature, 0.7);

        first.tool_policies.push("rate_limit: 1/min".to_string());
        first.model.push_str("-changed");
        first.temperature = 1.5;
        assert_eq!(second.tool_policies, vec!["cost: 1"]);
        assert_eq!(second.model, "scout");
        assert_eq!(second.temperature, 0.7);
        assert_eq!(second.max_tokens, 64);

        let again = resolver.resolve(Some(&machine), None, Some(&strict));
        assert_eq!(again.model, "judge");
        assert_eq!(again.tool_policies, vec!["cost: 1"]);
        assert_eq!(again.temperature, 0.0);
    }

    #[test]
    fn test_to_json() {
        let json = ConfigResolver::default().resolve(None, None, None).to_json();
        assert_eq!(json["provider"], "anthropic");
        assert_eq!(json["base_url"], Value::Null);
        assert_eq!(json["tool_policies"], json!([]));
    }
}
