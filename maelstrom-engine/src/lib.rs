//! # maelstrom-engine
//!
//! Binds machine specs to behaviour.
//!
//! This crate provides:
//! - The LLM config hierarchy (`ConfigResolver`)
//! - The LLM transport (`LlmCaller`, `HttpLlmCaller`)
//! - Action classification and binding (`Resolution`)
//! - The tool-use loop
//! - The agent pool used by system actions

pub mod actions;
pub mod agents;
pub mod config;
pub mod llm;
pub mod tool_loop;

pub use actions::{merge_patch, ActionSpec, Classified, Resolution, SystemCall};
pub use agents::{AgentError, AgentHirer, AgentInfo, AgentPool, DEFAULT_MAX_AGENTS};
pub use config::{ConfigResolver, LlmDefaults, ResolvedConfig};
pub use llm::{HttpLlmCaller, LlmCaller, LlmConfig, LlmError};
pub use tool_loop::{ToolLoopAction, ToolLoopSpec, DEFAULT_MAX_ITER};
