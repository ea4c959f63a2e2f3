//! Tool registry with policy enforcement.
//!
//! Every call goes through [`ToolRegistry::execute`]: unknown tools are
//! rejected, policies are enforced before the tool runs, and the tool itself
//! runs under a hard timeout and the caller's cancellation token.

use crate::builtin;
use crate::error::ToolError;
use crate::policy::{ToolPolicy, SHELL_TOOL};
use crate::rate_limit::RateLimiters;
use crate::tool::{Params, Tool, ToolSchema};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Ceiling on a single tool call.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    limiters: RateLimiters,
    hard_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            limiters: RateLimiters::new(),
            hard_timeout: HARD_TIMEOUT,
        }
    }

    /// Creates a registry holding the builtin tools.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        builtin::register_all(&registry);
        registry
    }

    /// Overrides the hard timeout.
    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = timeout;
        self
    }

    /// Registers a tool, replacing any tool with the same name.
    pub fn register(&self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.write().insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Schemas of all tools, sorted by name.
    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.read().values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Enforces policies for a call without running it.
    pub fn enforce(&self, name: &str, policy: &ToolPolicy, params: &Params) -> Result<(), ToolError> {
        if let Some(limit) = policy.rate_limit {
            if !self.limiters.get(name, limit).try_acquire() {
                return Err(ToolError::policy(
                    name,
                    format!("rate limit exceeded: {}/min", limit),
                ));
            }
        }

        tracing::info!("Tool cost {}: {:.4}", name, policy.cost);

        if name == SHELL_TOOL {
            policy.check_command(params)?;
        }
        Ok(())
    }

    /// Runs a tool under policies, the hard timeout and cancellation.
    pub async fn execute<S: AsRef<str>>(
        &self,
        name: &str,
        params: Params,
        policies: &[S],
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let policy = ToolPolicy::parse(policies);
        self.enforce(name, &policy, &params)?;

        let start = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled(name.to_string())),
            res = tokio::time::timeout(self.hard_timeout, tool.execute(params)) => match res {
                Ok(res) => res,
                Err(_) => Err(ToolError::Timeout {
                    tool: name.to_string(),
                    timeout: self.hard_timeout,
                }),
            },
        };

        let elapsed = start.elapsed().as_millis();
        match &result {
            Ok(_) => tracing::info!("Tool {} ok in {}ms", name, elapsed),
            Err(e) => tracing::warn!("Tool {} failed in {}ms: {}", name, elapsed, e),
        }
        result
    }
}
