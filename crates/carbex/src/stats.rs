// AI
//! 📊 stats.rs — "Is it ingesting?" — every on-call engineer, every night, forever.
//!
//! 🚀 Lock-free counters shared by every handler and indexer, plus a comfy-table
//! rendering for the shutdown summary. No locks, no allocations on the hot path,
//! just `fetch_add` and vibes.
//!
//! ⚠️ Counters are `Relaxed`. They're for humans reading logs, not for
//! synchronizing anything. If you start making decisions off these, stop. 🦆

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

/// 📈 The scoreboard. One per process, shared via `Arc`.
#[derive(Debug)]
pub struct PipelineStats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    lines_received: AtomicU64,
    decode_errors: AtomicU64,
    datapoints_enqueued: AtomicU64,
    batches_indexed: AtomicU64,
    documents_indexed: AtomicU64,
    bulk_retries: AtomicU64,
    started_at: Instant,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            datapoints_enqueued: AtomicU64::new(0),
            batches_indexed: AtomicU64::new(0),
            documents_indexed: AtomicU64::new(0),
            bulk_retries: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

/// 📸 A frozen copy of the counters, safe to compare and print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub lines_received: u64,
    pub decode_errors: u64,
    pub datapoints_enqueued: u64,
    pub batches_indexed: u64,
    pub documents_indexed: u64,
    pub bulk_retries: u64,
}

impl StatsSnapshot {
    /// 🔌 Connections currently open.
    pub fn connections_active(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn datapoint_enqueued(&self) {
        self.datapoints_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn batch_indexed(&self, documents: usize) {
        self.batches_indexed.fetch_add(1, Ordering::Relaxed);
        self.documents_indexed
            .fetch_add(documents as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn bulk_retry(&self) {
        self.bulk_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            datapoints_enqueued: self.datapoints_enqueued.load(Ordering::Relaxed),
            batches_indexed: self.batches_indexed.load(Ordering::Relaxed),
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            bulk_retries: self.bulk_retries.load(Ordering::Relaxed),
        }
    }

    /// 🍽️ Render the scoreboard as a two-column table for the shutdown log line.
    pub fn render_table(&self) -> String {
        let snapshot = self.snapshot();
        let uptime_secs = self.uptime().as_secs_f64();
        let docs_per_sec = if uptime_secs > 0.0 {
            snapshot.documents_indexed as f64 / uptime_secs
        } else {
            0.0
        };

        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["carbex", "total"]);

        let rows: [(&str, String); 9] = [
            ("connections opened", format_number(snapshot.connections_opened)),
            ("connections active", format_number(snapshot.connections_active())),
            ("lines received", format_number(snapshot.lines_received)),
            ("decode errors", format_number(snapshot.decode_errors)),
            ("datapoints enqueued", format_number(snapshot.datapoints_enqueued)),
            ("batches indexed", format_number(snapshot.batches_indexed)),
            ("documents indexed", format_number(snapshot.documents_indexed)),
            ("bulk retries", format_number(snapshot.bulk_retries)),
            ("docs/s (lifetime)", format!("{docs_per_sec:.2}")),
        ];
        for (label, value) in rows {
            table.add_row(vec![
                Cell::new(label),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        }
        table.to_string()
    }
}

/// 🔢 "1000000" → "1,000,000". The three people who read logs closely say thanks.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}
