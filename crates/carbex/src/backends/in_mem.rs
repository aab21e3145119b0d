//! # 🧠 The In-Memory Sink
//!
//! 🎬 No cluster. No network. No heartbeat. No mortgage on the line.
//! A dry run sink: it counts every `IndexRequest` the pipeline hands it and
//! then lets it go. Tests build a recording flavour that also keeps the
//! requests in a `Vec` behind a `Mutex` behind an `Arc`, so they can look at
//! exactly what would have been sent.
//!
//! It can also be told to fail. Not out of spite. Out of science: the retry
//! path deserves an audience too. 🦆
//!
//! ⚠️ This is NOT durable. When the process exits, the datapoints go with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backends::Sink;
use crate::common::IndexRequest;

/// 📦 A sink that counts everything and, when recording, forgets nothing.
///
/// Clone-able because tests need to peek inside after handing a clone to the
/// pipeline. Every clone shares the same counters, the same recording (if
/// any) and the same failure budget.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemorySink {
    // 🔒 `None` unless built by `recording()`, so a dry run never grows
    recorded: Option<Arc<Mutex<Vec<IndexRequest>>>>,
    documents: Arc<AtomicU64>,
    failures_remaining: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl InMemorySink {
    /// Counting only. This is what `sink_config = "InMemory"` gets.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 📼 A sink that also keeps every stored request for later inspection.
    #[cfg(test)]
    pub(crate) fn recording() -> Self {
        Self {
            recorded: Some(Arc::default()),
            ..Self::default()
        }
    }

    /// 💥 A recording sink whose next `failures` calls to `bulk_upsert` return an error.
    #[cfg(test)]
    pub(crate) fn failing(failures: usize) -> Self {
        let sink = Self::recording();
        sink.failures_remaining.store(failures, Ordering::SeqCst);
        sink
    }

    /// 🔍 Everything that made it in, in arrival order. Retried batches that
    /// failed first are not in here, because failing means nothing was stored.
    /// Always empty for a sink that isn't recording.
    #[cfg(test)]
    pub(crate) async fn received(&self) -> Vec<IndexRequest> {
        match &self.recorded {
            Some(recorded) => recorded.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// 🔢 Documents accepted so far, recording or not.
    #[cfg(test)]
    pub(crate) fn documents(&self) -> u64 {
        self.documents.load(Ordering::SeqCst)
    }

    /// 🔢 How many times `bulk_upsert` was called, failures included.
    #[cfg(test)]
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn bulk_upsert(&mut self, requests: &[IndexRequest]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // -- take one failure off the budget if there is any left
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!(
                "💀 In-memory sink was told to fail, and it is nothing if not obedient ({} documents turned away)",
                requests.len()
            );
        }

        let total = self
            .documents
            .fetch_add(requests.len() as u64, Ordering::SeqCst)
            + requests.len() as u64;
        // 🔒 The Mutex is load-bearing. Several indexer workers share this Vec.
        if let Some(recorded) = &self.recorded {
            recorded.lock().await.extend_from_slice(requests);
        }
        debug!(
            "🧠 In-memory sink swallowed {} documents ({} so far)",
            requests.len(),
            total
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!("🗑️ In-memory sink closed. It lives in RAM. There was nothing to close.");
        Ok(())
    }
}
