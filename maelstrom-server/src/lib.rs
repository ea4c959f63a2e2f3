//! # maelstrom-server
//!
//! Command server for maelstrom.
//!
//! This crate provides:
//! - Layered configuration (defaults, YAML file, environment)
//! - Component wiring from configuration
//! - JSON-lines command handling over any async reader and writer
//! - Error classification for responses

pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use config::{AgentsConfig, Config, ConfigError, StorageConfig, TransportConfig};
pub use error::{ErrorClass, ServerError};
pub use handler::{CommandHandler, Request};
pub use server::{Server, ServerStats};
