//! Tool policies.
//!
//! Policies are `key:value` strings from the machine's `llm.tool_policies`:
//!
//! - `rate_limit: N/min` - at most N calls per minute per (tool, N)
//! - `cost: 0.05` - cost weight, logged only (default 0.01)
//! - `allowed: ls,cat` - allowed leading commands (`bash_exec` only)
//! - `forbidden: rm,sudo` - forbidden substrings (`bash_exec` only)
//!
//! Unknown keys and malformed entries are ignored.

use crate::error::ToolError;
use crate::tool::Params;
use serde_json::Value;
use std::collections::BTreeSet;

/// Name of the tool the command policies apply to.
pub const SHELL_TOOL: &str = "bash_exec";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolPolicy {
    pub rate_limit: Option<u32>,
    pub cost: f64,
    pub allowed: BTreeSet<String>,
    pub forbidden: BTreeSet<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            rate_limit: None,
            cost: Self::DEFAULT_COST,
            allowed: BTreeSet::new(),
            forbidden: BTreeSet::new(),
        }
    }
}

impl ToolPolicy {
    pub const DEFAULT_COST: f64 = 0.01;

    /// Parses policy entries. Later entries override earlier scalars; lists
    /// accumulate.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut policy = Self::default();

        for entry in entries {
            let entry = entry.as_ref();
            let Some(idx) = entry.find(':').filter(|i| *i > 0) else {
                continue;
            };
            let key = entry[..idx].trim();
            let value = entry[idx + 1..].trim();

            match key {
                "rate_limit" => {
                    if let Some(n) = value
                        .strip_suffix("/min")
                        .and_then(|n| n.trim().parse::<u32>().ok())
                    {
                        policy.rate_limit = (n > 0).then_some(n);
                    }
                }
                "cost" => {
                    if let Ok(cost) = value.parse::<f64>() {
                        policy.cost = cost;
                    }
                }
                "allowed" => policy.allowed.extend(split_list(value)),
                "forbidden" => policy.forbidden.extend(split_list(value)),
                _ => {}
            }
        }

        policy
    }

    /// Checks a `bash_exec` command against the allow and forbid lists.
    pub fn check_command(&self, params: &Params) -> Result<(), ToolError> {
        let command = match params.get("command") {
            None => return Err(ToolError::policy(SHELL_TOOL, "missing 'command'")),
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(ToolError::policy(SHELL_TOOL, "'command' must be string")),
        };
        let Some(program) = command.split_whitespace().next() else {
            return Err(ToolError::policy(SHELL_TOOL, "empty command"));
        };

        if !self.allowed.is_empty() && !self.allowed.contains(program) {
            return Err(ToolError::policy(
                SHELL_TOOL,
                format!("command '{}' not allowed, allowed={:?}", program, self.allowed),
            ));
        }
        if let Some(bad) = self.forbidden.iter().find(|f| command.contains(f.as_str())) {
            return Err(ToolError::policy(
                SHELL_TOOL,
                format!("forbidden '{}' in command '{}'", bad, command),
            ));
        }
        Ok(())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
