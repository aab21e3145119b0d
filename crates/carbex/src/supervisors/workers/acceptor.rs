//! 🚪 The Acceptor — the bouncer at the door of port 2003.
//!
//! 🎬 *[a SYN arrives. the bouncer nods. a handler is spawned. the bouncer
//! is already looking at the next SYN before the first guest sits down.]*
//!
//! One loop, for the whole life of the process: accept, spawn a handler, go
//! back to accepting. Handlers are spawned on a [`TaskTracker`] so shutdown can
//! wait for every one of them to finish enqueueing what it already read.
//!
//! 💀 An accept error is fatal. Without the accept loop there is no ingestion,
//! and a bridge that silently stopped listening is worse than one that died loudly.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::Worker;
use super::connection_handler::ConnectionHandler;
use crate::app_config::ListenerConfig;
use crate::queue::IngestionQueue;
use crate::stats::PipelineStats;

/// 🔌 Bind the inbound listener. Failure here is a startup failure, full stop.
pub(crate) async fn bind(listener_config: &ListenerConfig) -> Result<TcpListener> {
    let bind_addr = listener_config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await.with_context(|| {
        format!(
            "💀 Could not bind the listener to '{bind_addr}'. Something else already owns the port, \
             the port needs privileges we don't have, or the address isn't one of ours."
        )
    })?;
    Ok(listener)
}

/// 🚪 Owns the listener and spawns a [`ConnectionHandler`] per connection.
#[derive(Debug)]
pub(crate) struct Acceptor {
    listener: TcpListener,
    queue: IngestionQueue,
    stats: Arc<PipelineStats>,
    max_line_bytes: usize,
    cancel: CancellationToken,
    handlers: TaskTracker,
}

impl Acceptor {
    pub(crate) fn new(
        listener: TcpListener,
        queue: IngestionQueue,
        stats: Arc<PipelineStats>,
        max_line_bytes: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listener,
            queue,
            stats,
            max_line_bytes,
            cancel,
            handlers: TaskTracker::new(),
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("🚪 Acceptor asked to stop. No new connections past this point.");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context(
                        "💀 The listener failed to accept a connection. Without the accept loop \
                         nothing gets ingested, so the whole bridge is going down with it.",
                    )?;
                    self.stats.connection_opened();
                    debug!(%peer, "🔌 Connection accepted");

                    let handler = ConnectionHandler::new(
                        stream,
                        peer,
                        self.queue.clone(),
                        Arc::clone(&self.stats),
                        self.max_line_bytes,
                        self.cancel.clone(),
                    );
                    self.handlers.spawn(handler.run());
                }
            }
        }
    }
}

impl Worker for Acceptor {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            if let Ok(addr) = self.listener.local_addr() {
                info!("📡 Listening for carbon lines on {addr}");
            }
            let outcome = self.accept_loop().await;
            if let Err(ref err) = outcome {
                error!("💀 Accept loop died: {err:#}");
                // -- handlers only stop on cancel or EOF; tell them the party is over
                self.cancel.cancel();
            }

            // 🧹 Wait for every handler to finish what it already read.
            self.handlers.close();
            debug!(
                "⏳ Waiting on {} connection handlers to wrap up",
                self.handlers.len()
            );
            self.handlers.wait().await;
            info!("🚪 All connection handlers are done");
            outcome
        })
    }
}
