//! JSON-lines server.
//!
//! Each input line is handled on its own task. Responses are written in
//! completion order, one per line, so callers match them by `id`.

use crate::error::ServerError;
use crate::handler::CommandHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the response channel.
const RESPONSE_CHANNEL_CAPACITY: usize = 256;

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

pub struct Server {
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(handler: Arc<CommandHandler>) -> Self {
        Self {
            handler,
            stats: Arc::new(ServerStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reads requests until EOF or shutdown, then waits for in-flight
    /// requests and flushes their responses.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), ServerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(RESPONSE_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut lines = reader.lines();
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

                    let handler = self.handler.clone();
                    let stats = self.stats.clone();
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        let response = handler.handle_line(&line).await;
                        if response["ok"] != true {
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                        if tx.send(response.to_string()).await.is_err() {
                            tracing::warn!("Response dropped: writer closed");
                        }
                    });
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Stopping request intake");
                    self.handler.shutdown();
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Request task failed: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Request task failed: {}", e);
            }
        }
        drop(tx);

        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
        }
    }

    /// Signals the server to stop and cancels in-flight actions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}
