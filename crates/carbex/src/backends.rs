//! 🔌 Backends — where the datapoints finally leave the building.
//!
//! 🚰 The indexer workers hold a [`SinkBackend`] and call `bulk_upsert` on it.
//! What happens next is the backend's business: an HTTP POST to `/_bulk`, or a
//! `Vec::push` into RAM for the tests. The pipeline does not know and does not ask.
//!
//! 🎭 Pattern: trait → concrete impls (ElasticsearchSink, InMemorySink) → enum dispatch.
//! No trait objects, no vtables, just a match the branch predictor eats for breakfast.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use anyhow::Result;
use async_trait::async_trait;

use crate::app_config::SinkConfig;
use crate::common::IndexRequest;

pub(crate) mod elasticsearch;
pub(crate) mod in_mem;

/// 🕳️ The one thing the pipeline needs from a backend: take these documents, upsert them.
///
/// # Contract 📜
/// - `bulk_upsert` is idempotent per `document_id`. Sending the same batch twice
///   must leave the index exactly as sending it once. That is what makes retry safe.
/// - `Ok(())` means every document is either stored or permanently rejected
///   (and the rejection was logged). `Err` means "try again later".
/// - `close` releases whatever the sink holds. Call it. Always.
#[async_trait]
pub(crate) trait Sink: std::fmt::Debug {
    /// 📡 Upsert a batch. One call, one round trip.
    async fn bulk_upsert(&mut self, requests: &[IndexRequest]) -> Result<()>;
    /// 🗑️ Flush, finalize, and release.
    async fn close(&mut self) -> Result<()>;
}

/// 🎭 The many faces of a Sink. Cloneable so every indexer worker gets its own
/// handle while the expensive bits (HTTP pool, shared Vec) stay shared.
#[derive(Debug, Clone)]
pub(crate) enum SinkBackend {
    Elasticsearch(elasticsearch::ElasticsearchSink),
    InMemory(in_mem::InMemorySink),
}

impl SinkBackend {
    /// 🔧 Build the sink the config asks for. Elasticsearch gets pinged here, so an
    /// unreachable cluster fails startup instead of the first batch.
    pub(crate) async fn from_config(sink_config: &SinkConfig) -> Result<Self> {
        Ok(match sink_config {
            SinkConfig::Elasticsearch(es_config) => Self::Elasticsearch(
                elasticsearch::ElasticsearchSink::new(es_config.clone()).await?,
            ),
            SinkConfig::InMemory => Self::InMemory(in_mem::InMemorySink::new()),
        })
    }
}

#[async_trait]
impl Sink for SinkBackend {
    async fn bulk_upsert(&mut self, requests: &[IndexRequest]) -> Result<()> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.bulk_upsert(requests).await,
            SinkBackend::InMemory(sink) => sink.bulk_upsert(requests).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.close().await,
            SinkBackend::InMemory(sink) => sink.close().await,
        }
    }
}
