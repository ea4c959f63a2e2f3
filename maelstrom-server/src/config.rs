//! Application configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MAELSTROM_CONFIG)
//! 3. Environment variables

use maelstrom_engine::{LlmDefaults, DEFAULT_MAX_AGENTS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory layout.
    pub storage: StorageConfig,
    /// Application-wide LLM defaults.
    pub llm: LlmDefaults,
    /// LLM transport settings.
    pub transport: TransportConfig,
    /// Agent pool settings.
    pub agents: AgentsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MAELSTROM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.storage.apply_env_overrides();
        self.llm.apply_env_overrides();
        self.transport.apply_env_overrides();
        self.agents.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.registry_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.registry_dir must not be empty".to_string(),
            ));
        }
        if self.storage.instances_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.instances_dir must not be empty".to_string(),
            ));
        }
        if self.agents.max_agents == 0 {
            return Err(ConfigError::ValidationError(
                "agents.max_agents must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "llm.temperature {} out of range 0..=2",
                self.llm.temperature
            )));
        }
        Ok(())
    }
}

/// Directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of workflow YAML files.
    pub registry_dir: PathBuf,
    /// Directory of durable instance files.
    pub instances_dir: PathBuf,
    /// Directory of agent templates.
    pub agents_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            registry_dir: PathBuf::from("./yaml"),
            instances_dir: PathBuf::from("./data/instances"),
            agents_dir: PathBuf::from("./agents"),
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("MAELSTROM_REGISTRY_DIR") {
            self.registry_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("MAELSTROM_INSTANCES_DIR") {
            self.instances_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("MAELSTROM_AGENTS_DIR") {
            self.agents_dir = PathBuf::from(dir);
        }
    }
}

/// LLM transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Overall request timeout in seconds (0 = none).
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
        }
    }
}

impl TransportConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("MAELSTROM_LLM_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.request_timeout_secs = secs;
            }
        }
    }

    /// Returns the request timeout, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Agent pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Maximum number of hired agents.
    pub max_agents: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_agents: DEFAULT_MAX_AGENTS,
        }
    }
}

impl AgentsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("MAELSTROM_MAX_AGENTS") {
            if let Ok(n) = max.parse() {
                self.max_agents = n;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
