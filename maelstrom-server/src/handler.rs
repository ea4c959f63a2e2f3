//! Command handlers.
//!
//! One JSON object per line in, one JSON object per line out. Requests carry
//! an `op` tag and an optional `id` that is echoed back.

use crate::config::Config;
use crate::error::ServerError;
use maelstrom_core::EventRecord;
use maelstrom_engine::{
    AgentHirer, AgentPool, ConfigResolver, HttpLlmCaller, LlmCaller, Resolution,
};
use maelstrom_storage::{Catalog, InstanceManager, InstanceStore};
use maelstrom_tools::ToolRegistry;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListMachines,
    ListSpecs,
    ImportSpec {
        filename: String,
    },
    DeactivateSpec {
        filename: String,
    },
    RemoveSpec {
        filename: String,
    },
    CreateInstance {
        machine: String,
        #[serde(default)]
        context: Value,
    },
    SendEvent {
        machine: String,
        instance: String,
        #[serde(rename = "type")]
        event_type: String,
        #[serde(default)]
        data: Value,
    },
    DescribeInstance {
        machine: String,
        instance: String,
    },
    DeleteInstance {
        machine: String,
        instance: String,
    },
    ListTools,
    ListAgents,
    HireAgent {
        template: String,
    },
    RetireAgent {
        id: String,
    },
}

/// Command handler.
pub struct CommandHandler {
    manager: Arc<InstanceManager>,
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentPool>,
}

impl CommandHandler {
    pub fn new(
        manager: Arc<InstanceManager>,
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentPool>,
    ) -> Self {
        Self {
            manager,
            tools,
            agents,
        }
    }

    /// Wires every component from configuration and imports the registry
    /// directory.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let tools = Arc::new(ToolRegistry::with_builtin());
        let agents = Arc::new(AgentPool::with_max_agents(
            &config.storage.agents_dir,
            config.agents.max_agents,
        ));
        let llm: Arc<dyn LlmCaller> = match config.transport.request_timeout() {
            Some(timeout) => Arc::new(HttpLlmCaller::with_timeout(timeout)?),
            None => Arc::new(HttpLlmCaller::new()),
        };
        let hirer: Arc<dyn AgentHirer> = agents.clone();

        let resolution = Resolution::new(ConfigResolver::new(config.llm.clone()), tools.clone())
            .with_llm(llm)
            .with_hirer(hirer);
        let catalog = Arc::new(Catalog::new(
            &config.storage.registry_dir,
            Arc::new(resolution),
        ));
        catalog.scan()?;

        let store = Arc::new(InstanceStore::open(&config.storage.instances_dir)?);
        let manager = Arc::new(InstanceManager::new(catalog, store)?);

        tracing::info!(
            "Loaded {} machines, {} tools",
            manager.catalog().machine_ids().len(),
            tools.len()
        );
        Ok(Self::new(manager, tools, agents))
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Cancels in-flight actions.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    /// Handles one request line and returns the response object.
    pub async fn handle_line(&self, line: &str) -> Value {
        let mut envelope: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return error_response(None, &ServerError::Json(e)),
        };
        let id = envelope.as_object_mut().and_then(|map| map.remove("id"));

        let request = match serde_json::from_value::<Request>(envelope) {
            Ok(request) => request,
            Err(e) => {
                let err = ServerError::InvalidRequest(e.to_string());
                return error_response(id, &err);
            }
        };

        match self.handle(request).await {
            Ok(result) => {
                let mut response = json!({"ok": true, "result": result});
                if let Some(id) = id {
                    response["id"] = id;
                }
                response
            }
            Err(e) => {
                if e.class() == crate::error::ErrorClass::Server {
                    tracing::error!("Request failed: {}", e);
                } else {
                    tracing::debug!("Request rejected: {}", e);
                }
                error_response(id, &e)
            }
        }
    }

    /// Executes a decoded request.
    pub async fn handle(&self, request: Request) -> Result<Value, ServerError> {
        let catalog = self.manager.catalog();
        match request {
            Request::ListMachines => Ok(json!({ "machines": catalog.machine_ids() })),
            Request::ListSpecs => Ok(serde_json::to_value(catalog.list())?),
            Request::ImportSpec { filename } => {
                catalog.import(&filename)?;
                Ok(json!({ "imported": filename }))
            }
            Request::DeactivateSpec { filename } => {
                catalog.deactivate(&filename)?;
                Ok(json!({ "deactivated": filename }))
            }
            Request::RemoveSpec { filename } => {
                catalog.remove(&filename)?;
                Ok(json!({ "removed": filename }))
            }
            Request::CreateInstance { machine, context } => {
                let created = self.manager.create(&machine, context).await?;
                Ok(serde_json::to_value(created)?)
            }
            Request::SendEvent {
                machine,
                instance,
                event_type,
                data,
            } => {
                let status = self
                    .manager
                    .deliver(&machine, &instance, EventRecord::new(event_type, data))
                    .await?;
                Ok(serde_json::to_value(status)?)
            }
            Request::DescribeInstance { machine, instance } => {
                let status = self.manager.describe(&machine, &instance).await?;
                Ok(serde_json::to_value(status)?)
            }
            Request::DeleteInstance { machine, instance } => {
                let deleted = self.manager.delete(&machine, &instance).await?;
                Ok(json!({ "deleted": deleted }))
            }
            Request::ListTools => Ok(serde_json::to_value(self.tools.list())?),
            Request::ListAgents => Ok(serde_json::to_value(self.agents.list())?),
            Request::HireAgent { template } => {
                let id = self.agents.hire_agent(&template).await?;
                Ok(json!({ "id": id }))
            }
            Request::RetireAgent { id } => {
                self.agents.retire_agent(&id).await?;
                Ok(json!({ "retired": id }))
            }
        }
    }
}

fn error_response(id: Option<Value>, err: &ServerError) -> Value {
    let mut response = json!({
        "ok": false,
        "error": {
            "code": err.error_code(),
            "class": err.class(),
            "message": err.to_string(),
        },
    });
    if let Some(id) = id {
        response["id"] = id;
    }
    response
}
