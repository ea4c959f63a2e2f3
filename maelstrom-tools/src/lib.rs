//! # maelstrom-tools
//!
//! Tools that workflow actions can call through the LLM tool-use loop.
//!
//! This crate provides:
//! - The `Tool` trait and tool schemas
//! - `ToolRegistry` with policy enforcement, hard timeout and cancellation
//! - Tool policies and per-minute rate limiting
//! - Ten builtin tools

pub mod builtin;
pub mod error;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod tool;

pub use error::ToolError;
pub use policy::ToolPolicy;
pub use rate_limit::{RateLimiter, RateLimiters};
pub use registry::{ToolRegistry, HARD_TIMEOUT};
pub use tool::{ParamProperty, ParamSchema, Params, Tool, ToolSchema};
