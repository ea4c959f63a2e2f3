//! Agent pool behind the `hire_agent:` and `retire_agent:` system actions.

use async_trait::async_trait;
use maelstrom_core::{compile, CompiledMachine, CoreError, GuardOnly, MachineSpec};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_AGENTS: usize = 5;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("max agents reached: {0}")]
    MaxAgents(usize),

    #[error("agent not found: {0}")]
    UnknownAgent(String),

    #[error("invalid template name: {0}")]
    InvalidTemplate(String),

    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {template}: {source}")]
    Compile {
        template: String,
        #[source]
        source: CoreError,
    },
}

impl AgentError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AgentError::MaxAgents(_) => "MAX_AGENTS",
            AgentError::UnknownAgent(_) => "AGENT_NOT_FOUND",
            AgentError::InvalidTemplate(_) => "BAD_REQUEST",
            AgentError::Io { .. } => "INTERNAL_ERROR",
            AgentError::Compile { .. } => "VALIDATION_ERROR",
        }
    }
}

/// Hires and retires agents on behalf of system actions.
#[async_trait]
pub trait AgentHirer: Send + Sync {
    /// Hires an agent from a template and returns its id.
    async fn hire_agent(&self, template: &str) -> Result<String, AgentError>;

    async fn retire_agent(&self, id: &str) -> Result<(), AgentError>;
}

struct Agent {
    template: String,
    machine: CompiledMachine,
}

/// Listing entry for a hired agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub template: String,
    pub initial: String,
}

/// Agents compiled from `<agents_dir>/<template>.yaml`, keyed by UUID.
pub struct AgentPool {
    agents_dir: PathBuf,
    max_agents: usize,
    agents: RwLock<BTreeMap<String, Arc<Agent>>>,
}

impl AgentPool {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self::with_max_agents(agents_dir, DEFAULT_MAX_AGENTS)
    }

    pub fn with_max_agents(agents_dir: impl Into<PathBuf>, max_agents: usize) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            max_agents,
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Hired agents ordered by id.
    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents
            .read()
            .iter()
            .map(|(id, agent)| AgentInfo {
                id: id.clone(),
                template: agent.template.clone(),
                initial: agent.machine.initial_path().unwrap_or_default(),
            })
            .collect()
    }

    fn template_path(&self, template: &str) -> Result<PathBuf, AgentError> {
        let valid = !template.is_empty()
            && template
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !template.starts_with('.');
        if !valid {
            return Err(AgentError::InvalidTemplate(template.to_string()));
        }
        Ok(self.agents_dir.join(format!("{}.yaml", template)))
    }
}

#[async_trait]
impl AgentHirer for AgentPool {
    async fn hire_agent(&self, template: &str) -> Result<String, AgentError> {
        if self.len() >= self.max_agents {
            return Err(AgentError::MaxAgents(self.max_agents));
        }

        let path = self.template_path(template)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AgentError::Io { path, source })?;

        let machine = MachineSpec::from_yaml(&text)
            .and_then(|spec| compile(Arc::new(spec), &GuardOnly))
            .map_err(|source| AgentError::Compile {
                template: template.to_string(),
                source,
            })?;

        let mut agents = self.agents.write();
        if agents.len() >= self.max_agents {
            return Err(AgentError::MaxAgents(self.max_agents));
        }
        let id = Uuid::new_v4().to_string();
        agents.insert(
            id.clone(),
            Arc::new(Agent {
                template: template.to_string(),
                machine,
            }),
        );
        tracing::info!("Hired agent {} from template {}", id, template);
        Ok(id)
    }

    async fn retire_agent(&self, id: &str) -> Result<(), AgentError> {
        match self.agents.write().remove(id) {
            Some(agent) => {
                tracing::info!("Retired agent {} ({})", id, agent.template);
                Ok(())
            }
            None => Err(AgentError::UnknownAgent(id.to_string())),
        }
    }
}
