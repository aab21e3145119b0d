//! 📊 The StatsWorker — reads the scoreboard out loud every `stats_interval_secs`.
//!
//! It logs totals plus what changed since last time, so "is it ingesting?" can
//! be answered with `grep` instead of a dashboard. It stops when shutdown starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Worker;
use crate::queue::IngestionQueue;
use crate::stats::{PipelineStats, StatsSnapshot};

/// 📈 What changed between two snapshots taken `every` apart.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IntervalSummary {
    docs_per_sec: f64,
    new_decode_errors: u64,
}

impl IntervalSummary {
    fn between(previous: &StatsSnapshot, current: &StatsSnapshot, every: Duration) -> Self {
        // -- a zero interval can't happen from config, but dividing by it still shouldn't
        let secs = every.as_secs_f64().max(f64::EPSILON);
        let docs_delta = current
            .documents_indexed
            .saturating_sub(previous.documents_indexed);
        Self {
            docs_per_sec: docs_delta as f64 / secs,
            new_decode_errors: current.decode_errors.saturating_sub(previous.decode_errors),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StatsWorker {
    stats: Arc<PipelineStats>,
    queue: IngestionQueue,
    every: Duration,
    cancel: CancellationToken,
}

impl StatsWorker {
    pub(crate) fn new(
        stats: Arc<PipelineStats>,
        queue: IngestionQueue,
        every: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stats,
            queue,
            every,
            cancel,
        }
    }

    fn report(&self, previous: &StatsSnapshot, current: &StatsSnapshot) {
        let summary = IntervalSummary::between(previous, current, self.every);
        info!(
            connections_active = current.connections_active(),
            lines_received = current.lines_received,
            decode_errors = current.decode_errors,
            documents_indexed = current.documents_indexed,
            bulk_retries = current.bulk_retries,
            queue_depth = self.queue.len(),
            "📊 {:.1} docs/s over the last {:?} ({} new decode errors)",
            summary.docs_per_sec,
            self.every,
            summary.new_decode_errors,
        );
    }
}

impl Worker for StatsWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // -- the first tick is immediate and there's nothing to say yet
            ticker.tick().await;

            let mut previous = self.stats.snapshot();
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("📊 Stats reporter signing off");
                        return Ok(());
                    }
                    _ = ticker.tick() => {
                        let current = self.stats.snapshot();
                        self.report(&previous, &current);
                        previous = current;
                    }
                }
            }
        })
    }
}
