//! 🎬 *[a queue fills with datapoints. somewhere, a cluster waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗑️ The IndexerWorker — patient, tireless, and deeply unbothered by the chaos
//! happening upstream. It pulls a batch. It stamps every datapoint into an
//! `IndexRequest`. It bulk-upserts. It asks no questions.
//!
//! When the backend says no, it waits and tries again, a little longer each
//! time. When the backend keeps saying no, it stops pretending and returns an
//! error, and the supervisor takes the whole process down with it. One hiccup
//! is survivable. A backend that is gone for good is not something a queue in
//! RAM can paper over. 🦆

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::Worker;
use crate::app_config::RuntimeConfig;
use crate::backends::{Sink, SinkBackend};
use crate::common::IndexRequest;
use crate::queue::IngestionQueue;
use crate::stats::PipelineStats;

/// 🗑️ Drains the queue into a sink, one bulk request at a time.
#[derive(Debug)]
pub(crate) struct IndexerWorker {
    id: usize,
    queue: IngestionQueue,
    sink: SinkBackend,
    runtime: RuntimeConfig,
    stats: Arc<PipelineStats>,
}

impl IndexerWorker {
    pub(crate) fn new(
        id: usize,
        queue: IngestionQueue,
        sink: SinkBackend,
        runtime: RuntimeConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            id,
            queue,
            sink,
            runtime,
            stats,
        }
    }

    /// 🔄 Upsert one batch, retrying with exponential backoff.
    ///
    /// Safe to repeat: document ids are derived from the data, so a batch that
    /// half-landed before the error lands the same way the second time.
    async fn index_with_retry(&mut self, requests: &[IndexRequest]) -> Result<()> {
        let max_retries = self.runtime.max_retries;
        let ceiling = self.runtime.retry_backoff_max();
        let mut backoff = self.runtime.retry_backoff();
        let mut attempt = 0u32;

        loop {
            match self.sink.bulk_upsert(requests).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    self.stats.bulk_retry();
                    warn!(
                        worker = self.id,
                        attempt,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "⚠️ Bulk upsert of {} documents failed, backing off: {err:#}",
                        requests.len()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, ceiling);
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "💀 Indexer {} gave up on a batch of {} documents after {} retries. \
                             The backend has been unhappy for too long to keep pretending.",
                            self.id,
                            requests.len(),
                            max_retries
                        )
                    });
                }
            }
        }
    }
}

/// ⏫ Double it, but never past the ceiling.
fn next_backoff(current: Duration, ceiling: Duration) -> Duration {
    current.saturating_mul(2).min(ceiling)
}

impl Worker for IndexerWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(worker = self.id, "📥 Indexer started draining the queue");
            let max_size = self.runtime.max_batch_docs;
            let max_wait = self.runtime.flush_interval();

            // -- `None` only once the queue is closed AND empty, so the last partial
            // -- batch still goes out before we leave
            while let Some(batch) = self.queue.dequeue_batch(max_size, max_wait).await {
                if batch.is_empty() {
                    continue;
                }
                let requests: Vec<IndexRequest> =
                    batch.into_iter().map(IndexRequest::new).collect();
                trace!(worker = self.id, "🪣 Indexing a batch of {}", requests.len());

                self.index_with_retry(&requests).await?;
                self.stats.batch_indexed(requests.len());
            }

            debug!(worker = self.id, "🏁 Queue closed and drained. Closing the sink.");
            self.sink
                .close()
                .await
                .with_context(|| format!("💀 Indexer {} failed to close its sink", self.id))?;
            Ok(())
        })
    }
}
