// ai
//! 📦 Common data structures — the building blocks of carbex
//!
//! ---
//!
//! 🎬 COLD OPEN — INT. MONITORING RACK — 3:47 AM
//!
//! A collectd agent somewhere types `server.cpu.load 0.42 1700000000` and hits
//! enter. It does this every ten seconds. It has done this for four years. It
//! has never once been thanked. Tonight, a `Datapoint` is born from that line,
//! and an `IndexRequest` will carry it into Elasticsearch. Nobody will clap.
//!
//! 🦆
//!
//! This module defines the two humble structs that ride the pipeline:
//! - [`Datapoint`]: one decoded metric observation. Immutable. Born in the decoder.
//! - [`IndexRequest`]: a datapoint dressed up for the backend, with an idempotent
//!   document id and the wall-clock moment it was submitted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// 📈 One metric observation: name, value, and the second it happened.
///
/// Constructed only by [`crate::decoder::decode_line`], which is the bouncer
/// that checks every field at the door. After that, nobody mutates it. Fields
/// are private so the invariant survives contact with the rest of the crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    metric: String,
    timestamp: i32,
    value: f64,
}

impl Datapoint {
    /// 🏗️ Crate-private so only the decoder hands these out.
    pub(crate) fn new(metric: String, value: f64, timestamp: i32) -> Self {
        Self {
            metric,
            timestamp,
            value,
        }
    }

    /// 🏷️ The metric path, e.g. `server.cpu.load`.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// ⏱️ Seconds since the epoch, as the client sent it.
    pub fn timestamp(&self) -> i32 {
        self.timestamp
    }

    /// 📊 The measured value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// 🔑 `metric + "_" + timestamp`.
    ///
    /// Same metric, same second, same id — so a re-sent line overwrites its
    /// twin instead of cloning it. The value is deliberately not part of the id.
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.metric, self.timestamp)
    }
}

/// 📬 A datapoint wrapped for the bulk-upsert call.
///
/// Lives for exactly one dispatch: built by an indexer worker right before the
/// sink call, dropped after the backend says yes (or after the retries give up).
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRequest {
    pub document_id: String,
    pub index_time: DateTime<Utc>,
    pub datapoint: Datapoint,
}

/// 🧾 The `_source` body that lands in the index. Borrowed, serialized, gone.
#[derive(Debug, Serialize)]
pub(crate) struct IndexDocument<'a> {
    metric: &'a str,
    ts: i32,
    value: f64,
    indexed_at: String,
}

impl IndexRequest {
    /// 🏗️ Stamp a datapoint with its id and the current wall-clock time.
    pub fn new(datapoint: Datapoint) -> Self {
        Self::at(datapoint, Utc::now())
    }

    /// 🕰️ Same as [`IndexRequest::new`] but with a caller-provided clock reading.
    pub fn at(datapoint: Datapoint, index_time: DateTime<Utc>) -> Self {
        Self {
            document_id: datapoint.document_id(),
            index_time,
            datapoint,
        }
    }

    /// 🧾 Borrow the request as the document body the backend stores.
    pub(crate) fn document(&self) -> IndexDocument<'_> {
        IndexDocument {
            metric: self.datapoint.metric(),
            ts: self.datapoint.timestamp(),
            value: self.datapoint.value(),
            indexed_at: self.index_time.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
