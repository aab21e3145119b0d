//! 🎬 *[camera pans across a rack of blinking switches]*
//! 🎬 "In a world where ten thousand hosts never stop talking..."
//! 🎬 "One supervisor decides when everyone goes home."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor module — part middle manager, part helicopter parent.
//! It starts the acceptor, the indexers and the stats reporter, then sits
//! there waiting for one of three things: a signal, a dead acceptor, or a
//! dead indexer. Whichever comes first, it runs the shutdown in order:
//!
//! 1. cancel the token: the acceptor stops, handlers stop reading
//! 2. wait for the acceptor, which waits for every handler to finish enqueueing
//! 3. close the queue
//! 4. wait for the indexers to drain it, flush the last partial batch, close their sinks
//! 5. print the scoreboard
//!
//! ⚠️ The workers stay private to this module. Nobody outside starts or stops
//! them directly; they go through the supervisor or not at all. 🔒

mod workers;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::SinkBackend;
use crate::queue::IngestionQueue;
use crate::stats::PipelineStats;
use workers::{Acceptor, IndexerWorker, StatsWorker, Worker};

/// 📦 The Supervisor: owns the config and the scoreboard, lends both to the workers.
pub(crate) struct Supervisor {
    app_config: AppConfig,
    stats: Arc<PipelineStats>,
}

/// 🚨 What woke the supervisor up.
enum Trigger {
    Shutdown,
    Acceptor(Result<()>),
    Indexer(Result<()>),
}

impl Supervisor {
    pub(crate) fn new(app_config: AppConfig) -> Self {
        Self {
            app_config,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// 📊 A handle on the scoreboard, for whoever wants to peek.
    #[cfg(test)]
    pub(crate) fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// 🚀 Build the sink, bind the port, run until `shutdown` resolves or something fatal happens.
    pub(crate) async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let sink = SinkBackend::from_config(&self.app_config.sink_config)
            .await
            .context("💀 Could not set up the sink. No backend, no bridge.")?;
        let listener = workers::bind(&self.app_config.listener).await?;
        self.run_with(listener, sink, shutdown).await
    }

    /// 🧵 Unleash the workers on an already-bound listener and an already-built sink.
    pub(crate) async fn run_with(
        self,
        listener: TcpListener,
        sink: SinkBackend,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let runtime = &self.app_config.runtime;
        let queue = IngestionQueue::new(runtime.max_pending);
        let cancel = CancellationToken::new();

        let mut indexers: FuturesUnordered<JoinHandle<Result<()>>> = (0..runtime
            .indexer_concurrency)
            .map(|id| {
                IndexerWorker::new(
                    id,
                    queue.clone(),
                    sink.clone(),
                    runtime.clone(),
                    Arc::clone(&self.stats),
                )
                .start()
            })
            .collect();

        let mut acceptor = Acceptor::new(
            listener,
            queue.clone(),
            Arc::clone(&self.stats),
            self.app_config.listener.max_line_bytes,
            cancel.clone(),
        )
        .start();

        let reporter = runtime.stats_interval().map(|every| {
            StatsWorker::new(Arc::clone(&self.stats), queue.clone(), every, cancel.clone()).start()
        });

        info!(
            "🚀 carbex is up: {} indexers, queue holds {} datapoints, batches of up to {}",
            runtime.indexer_concurrency, runtime.max_pending, runtime.max_batch_docs
        );

        // -- 🛋️ the long wait
        let trigger = tokio::select! {
            _ = shutdown => Trigger::Shutdown,
            joined = &mut acceptor => Trigger::Acceptor(settle(joined, "acceptor")),
            Some(joined) = indexers.next() => Trigger::Indexer(settle(joined, "indexer")),
        };

        let mut failure: Option<anyhow::Error> = None;
        // -- a finished JoinHandle must not be polled again
        let mut acceptor_finished = false;
        match trigger {
            Trigger::Shutdown => info!("🛑 Shutdown requested. Draining what we have."),
            Trigger::Acceptor(outcome) => {
                acceptor_finished = true;
                record(
                    &mut failure,
                    outcome.and_then(|()| Err(anyhow!("💀 The acceptor stopped without being asked"))),
                );
            }
            Trigger::Indexer(outcome) => {
                // -- nobody may be left to make room; don't let handlers wait on a queue that won't drain
                queue.close();
                record(
                    &mut failure,
                    outcome.and_then(|()| Err(anyhow!("💀 An indexer stopped without being asked"))),
                );
            }
        }

        cancel.cancel();

        if !acceptor_finished {
            // -- wait for the handlers, but if indexers start dying meanwhile, stop waiting on queue space
            let outcome = loop {
                tokio::select! {
                    joined = &mut acceptor => break settle(joined, "acceptor"),
                    Some(joined) = indexers.next() => {
                        queue.close();
                        record(&mut failure, settle(joined, "indexer"));
                    }
                }
            };
            record(&mut failure, outcome);
        }

        queue.close();
        while let Some(joined) = indexers.next().await {
            record(&mut failure, settle(joined, "indexer"));
        }

        if let Some(reporter) = reporter {
            record(&mut failure, settle(reporter.await, "stats reporter"));
        }

        info!("📊 Final tally:\n{}", self.stats.render_table());
        match failure {
            Some(err) => Err(err),
            None => {
                info!("✅ carbex shut down cleanly");
                Ok(())
            }
        }
    }
}

/// 🧅 Flatten a task's join result into one `Result`.
fn settle(joined: Result<Result<()>, JoinError>, who: &str) -> Result<()> {
    joined.with_context(|| format!("💀 The {who} task panicked"))?
}

/// 📝 Keep the first failure for the caller, log the rest so they aren't lost.
fn record(failure: &mut Option<anyhow::Error>, outcome: Result<()>) {
    if let Err(err) = outcome {
        if failure.is_some() {
            error!("💀 Another failure during shutdown: {err:#}");
        } else {
            *failure = Some(err);
        }
    }
}

/// 🛑 Resolves on Ctrl-C, or on SIGTERM where there is such a thing.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("⚠️ Could not listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("⚠️ Could not listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("🛑 Ctrl-C received"),
        _ = terminate => info!("🛑 SIGTERM received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{ListenerConfig, RuntimeConfig, SinkConfig};
    use crate::backends::in_mem::InMemorySink;
    use crate::common::IndexRequest;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_config(runtime: RuntimeConfig) -> AppConfig {
        AppConfig {
            listener: ListenerConfig {
                bind_address: "127.0.0.1".into(),
                port: 0,
                max_line_bytes: 1024,
            },
            sink_config: SinkConfig::InMemory,
            runtime,
        }
    }

    fn quick_runtime() -> RuntimeConfig {
        RuntimeConfig {
            max_pending: 64,
            indexer_concurrency: 2,
            max_batch_docs: 100,
            flush_interval_ms: 20,
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 5,
            stats_interval_secs: 0,
            ..RuntimeConfig::default()
        }
    }

    struct Harness {
        addr: SocketAddr,
        stats: Arc<PipelineStats>,
        shutdown: oneshot::Sender<()>,
        running: JoinHandle<Result<()>>,
    }

    async fn launch(runtime: RuntimeConfig, sink: InMemorySink) -> Result<Harness> {
        let config = test_config(runtime);
        let listener = workers::bind(&config.listener).await?;
        let addr = listener.local_addr()?;
        let supervisor = Supervisor::new(config);
        let stats = supervisor.stats();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(supervisor.run_with(
            listener,
            SinkBackend::InMemory(sink),
            async move {
                let _ = shutdown_rx.await;
            },
        ));
        Ok(Harness {
            addr,
            stats,
            shutdown,
            running,
        })
    }

    async fn send(addr: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut client = TcpStream::connect(addr).await?;
        client.write_all(payload).await?;
        client.shutdown().await?;
        Ok(())
    }

    /// ⏳ Poll until the sink holds `count` documents, or give up after five seconds.
    async fn wait_for(sink: &InMemorySink, count: usize) -> Vec<IndexRequest> {
        for _ in 0..500 {
            let received = sink.received().await;
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("💀 sink never reached {count} documents");
    }

    async fn stop(harness: Harness) -> Result<()> {
        let _ = harness.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(5), harness.running).await??
    }

    #[tokio::test]
    async fn the_one_where_one_line_becomes_one_document() -> Result<()> {
        let sink = InMemorySink::recording();
        let harness = launch(quick_runtime(), sink.clone()).await?;

        send(harness.addr, b"server.cpu.load 0.42 1700000000\n").await?;
        let received = wait_for(&sink, 1).await;
        stop(harness).await?;

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].document_id, "server.cpu.load_1700000000");
        assert_eq!(received[0].datapoint.value(), 0.42);
        assert_eq!(sink.received().await.len(), 1, "exactly one, even after the drain");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_bad_line_is_skipped_and_the_good_line_lands() -> Result<()> {
        let sink = InMemorySink::recording();
        let harness = launch(quick_runtime(), sink.clone()).await?;
        let stats = Arc::clone(&harness.stats);

        send(
            harness.addr,
            b"bad.metric notanumber 1700000000\ngood.metric 1.0 1700000001\n",
        )
        .await?;
        let received = wait_for(&sink, 1).await;
        stop(harness).await?;

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].document_id, "good.metric_1700000001");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.documents_indexed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_many_clients_talk_at_once_and_nobody_is_lost() -> Result<()> {
        let sink = InMemorySink::recording();
        let harness = launch(quick_runtime(), sink.clone()).await?;

        let mut clients = Vec::new();
        for client in 0..8 {
            let addr = harness.addr;
            clients.push(tokio::spawn(async move {
                let payload: String = (0..50)
                    .map(|i| format!("client{client}.metric {i} {i}\n"))
                    .collect();
                send(addr, payload.as_bytes()).await
            }));
        }
        for client in clients {
            client.await??;
        }

        let received = wait_for(&sink, 400).await;
        stop(harness).await?;
        assert_eq!(received.len(), 400);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_shutdown_flushes_the_partial_batch() -> Result<()> {
        let sink = InMemorySink::recording();
        let runtime = RuntimeConfig {
            // -- nobody flushes on a timer during this test; only the drain can save us
            flush_interval_ms: 60_000,
            indexer_concurrency: 1,
            ..quick_runtime()
        };
        let harness = launch(runtime, sink.clone()).await?;
        let stats = Arc::clone(&harness.stats);

        send(harness.addr, b"a 1 1\nb 2 2\nc 3 3\n").await?;
        for _ in 0..500 {
            if stats.snapshot().datapoints_enqueued == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().datapoints_enqueued, 3);

        stop(harness).await?;
        assert_eq!(sink.received().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_hiccup_is_retried_not_fatal() -> Result<()> {
        let sink = InMemorySink::failing(2);
        let harness = launch(quick_runtime(), sink.clone()).await?;
        let stats = Arc::clone(&harness.stats);

        send(harness.addr, b"hiccup 1 1\n").await?;
        wait_for(&sink, 1).await;
        stop(harness).await?;

        assert_eq!(stats.snapshot().bulk_retries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dead_backend_takes_the_process_down() -> Result<()> {
        let sink = InMemorySink::failing(usize::MAX);
        let runtime = RuntimeConfig {
            max_retries: 2,
            ..quick_runtime()
        };
        let harness = launch(runtime, sink.clone()).await?;

        send(harness.addr, b"doomed 1 1\n").await?;
        // -- no shutdown signal: the indexer's failure alone must end the run
        let outcome = tokio::time::timeout(Duration::from_secs(5), harness.running).await??;

        let err = outcome.unwrap_err();
        assert!(format!("{err:#}").contains("after 2 retries"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dead_indexer_does_not_strand_a_blocked_client() -> Result<()> {
        let sink = InMemorySink::failing(usize::MAX);
        let runtime = RuntimeConfig {
            max_pending: 1,
            indexer_concurrency: 1,
            max_batch_docs: 1,
            max_retries: 1,
            ..quick_runtime()
        };
        let harness = launch(runtime, sink.clone()).await?;
        let stats = Arc::clone(&harness.stats);

        // -- 200 lines into a queue of one: the handler spends most of its life waiting on space
        let addr = harness.addr;
        let client = tokio::spawn(async move {
            let payload: String = (0..200).map(|i| format!("stuck.metric {i} {i}\n")).collect();
            // -- the server may hang up mid-write; that's the point
            let _ = send(addr, payload.as_bytes()).await;
        });

        // -- no shutdown signal: the queue closing under the handler must unstick everything
        let outcome = tokio::time::timeout(Duration::from_secs(5), harness.running)
            .await
            .expect("💀 run_with hung with a handler parked on a full queue")?;
        client.await?;

        let err = outcome.unwrap_err();
        assert!(
            format!("{err:#}").contains("gave up on a batch of 1 documents after 1 retries"),
            "unexpected error: {err:#}"
        );
        assert_eq!(sink.calls(), 2, "one try plus one retry, then nothing");
        assert!(stats.snapshot().datapoints_enqueued < 200);
        Ok(())
    }
}
