//! maelstrom - statechart workflow engine
//!
//! Reads JSON commands from stdin, one per line, and writes one JSON response
//! per line to stdout. Logs go to stderr.

use maelstrom_server::{CommandHandler, Config, Server};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Stdout carries responses, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load configuration (from file if MAELSTROM_CONFIG is set, then env overrides)
    let config_path = std::env::var("MAELSTROM_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting maelstrom");
    tracing::info!("  Registry directory: {}", config.storage.registry_dir.display());
    tracing::info!("  Instances directory: {}", config.storage.instances_dir.display());
    tracing::info!("  Agents directory: {}", config.storage.agents_dir.display());
    tracing::info!(
        "  Default LLM: {} ({})",
        config.llm.model,
        config.llm.provider
    );

    let handler = Arc::new(CommandHandler::from_config(&config)?);
    let server = Arc::new(Server::new(handler));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping...");
        shutdown_server.shutdown();
    });

    server
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;

    tracing::info!("Stopped");
    Ok(())
}
