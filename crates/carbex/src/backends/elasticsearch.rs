//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 3:47 AM
//!
//! The dashboard glows amber. Somewhere, ten thousand hosts are each sending a
//! line every ten seconds, and every one of those lines ends up here, waiting
//! to be POSTed to `/_bulk`. The cluster is yellow. It is always yellow.
//!
//! 🚀 This module turns a slice of [`IndexRequest`]s into one NDJSON bulk body,
//! ships it, and reads the response closely enough to know whether to retry.
//! It does not retry on its own. Retries belong to the indexer worker.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, error, trace};

use crate::backends::Sink;
use crate::common::IndexRequest;

pub(crate) mod bulk;

// 📡 ElasticsearchSinkConfig — "It's just Elasticsearch", she said, before the cluster went red.
// 🔧 auth is tri-modal: username+password, api_key, or "I hope anonymous works".
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSinkConfig {
    /// 📡 Hostname or IP of any node that speaks HTTP.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 🔒 `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key — the velvet rope variant of authentication. Wins over basic auth.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 📦 Target index for every datapoint.
    #[serde(default = "default_index")]
    pub index: String,
    /// 🏚️ Mapping type for clusters older than 7.x. Leave unset on anything modern.
    #[serde(default)]
    pub doc_type: Option<String>,
    /// 🫁 gzip the bulk body. Metric lines compress absurdly well.
    #[serde(default)]
    pub compress_requests: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    9200
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_index() -> String {
    "carbon-es".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ElasticsearchSinkConfig {
    /// 🧭 `scheme://host:port`, no trailing slash.
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.scheme,
            self.host.trim_end_matches('/'),
            self.port
        )
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            !self.host.trim().is_empty(),
            "💀 sink_config.Elasticsearch.host is empty. We need somewhere to send the documents."
        );
        ensure!(
            !self.index.trim().is_empty(),
            "💀 sink_config.Elasticsearch.index is empty. Documents need a home."
        );
        ensure!(
            self.scheme == "http" || self.scheme == "https",
            "💀 sink_config.Elasticsearch.scheme must be 'http' or 'https', got '{}'",
            self.scheme
        );
        Ok(())
    }
}

/// 📡 The sink side of the Elasticsearch backend: render, POST, inspect. No buffering.
///
/// Cloning shares the `reqwest::Client` connection pool, so each indexer worker
/// gets its own handle without opening its own sockets from scratch.
#[derive(Debug, Clone)]
pub(crate) struct ElasticsearchSink {
    client: reqwest::Client,
    sink_config: ElasticsearchSinkConfig,
    bulk_url: String,
}

#[async_trait]
impl Sink for ElasticsearchSink {
    /// 📡 One batch in, one `_bulk` request out.
    async fn bulk_upsert(&mut self, requests: &[IndexRequest]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let body = bulk::render_bulk_body(
            requests,
            &self.sink_config.index,
            self.sink_config.doc_type.as_deref(),
        )?;
        debug!(
            "📡 Sending {} documents ({} bytes) to /_bulk",
            requests.len(),
            body.len()
        );
        self.submit_bulk_request(body).await.context(
            "💀 The bulk submission stumbled at the finish line. The NDJSON was rendered with love, \
             and the HTTP layer said 'nah.' Check connectivity. Check your cluster.",
        )
    }

    /// 🗑️ Nothing to flush — we don't buffer. The connection pool says goodbye on drop.
    async fn close(&mut self) -> Result<()> {
        debug!("🗑️ Elasticsearch sink closing — no buffer to flush, just vibes to release");
        Ok(())
    }
}

impl ElasticsearchSink {
    /// 🚀 Stand up a new `ElasticsearchSink`, fully wired and ready to receive documents.
    ///
    /// 1. Builds the `reqwest::Client` (10s connect timeout, configurable request timeout).
    /// 2. Pings the cluster root with a GET. If that fails, we fail loudly here
    ///    rather than quietly 50,000 datapoints later.
    ///
    /// The index is not checked: `_bulk` auto-creates it on clusters that allow that,
    /// and on clusters that don't, the first batch will say so clearly enough.
    pub(crate) async fn new(config: ElasticsearchSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a missing TLS cert or a cursed system OpenSSL. Either way: tragic.")?;

        let base_url = config.base_url();
        let bulk_url = format!("{base_url}/_bulk");
        let sink = Self {
            client,
            sink_config: config,
            bulk_url,
        };

        // -- 📡 Connectivity ping — "Hello? Is this thing on?" — a developer, gesturing at a cluster.
        let response = sink
            .authorize(sink.client.get(&base_url))
            .send()
            .await
            .with_context(|| {
                format!("💀 Could not reach Elasticsearch at '{base_url}'. Is it running? Is the port right?")
            })?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "💀 Elasticsearch at '{}' answered the ping with '{}'. Check credentials and URL.",
                base_url,
                status
            );
        }
        debug!("✅ Elasticsearch at '{}' is home and answering", base_url);

        Ok(sink)
    }

    /// 🔒 API key wins over basic auth. This is not a democracy.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.sink_config.api_key {
            request.header(AUTHORIZATION, format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.sink_config.username {
            request.basic_auth(username, self.sink_config.password.as_ref())
        } else {
            request
        }
    }

    /// 📡 Fire the `_bulk` POST and decide what the response means.
    ///
    /// - transport error or non-2xx → `Err` (retry the batch)
    /// - 2xx with throttled (429) or 5xx items → `Err` (retry the batch; ids keep it idempotent)
    /// - 2xx with only other item failures → log them at `error`, `Ok` (retrying won't fix a bad mapping)
    async fn submit_bulk_request(&self, body: Vec<u8>) -> Result<()> {
        let mut request = self
            .client
            .post(&self.bulk_url)
            // ⚠️ application/x-ndjson, not application/json. ES is particular about this.
            .header(CONTENT_TYPE, "application/x-ndjson");

        let body = if self.sink_config.compress_requests {
            request = request.header(CONTENT_ENCODING, "gzip");
            gzip(&body)?
        } else {
            body
        };

        let response = self
            .authorize(request)
            .body(body)
            .send()
            .await
            .context("💀 The bulk request never made it to Elasticsearch. The network responded with what can only be described as 'not vibing with it.'")?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .context("💀 Elasticsearch answered, but the body got lost on the way back.")?;
        if !status.is_success() {
            bail!(
                "💀 The bulk request arrived, but Elasticsearch said '{}'. The body of the response read: '{}'.",
                status,
                response_body
            );
        }

        let verdict = bulk::inspect_bulk_response(&response_body)?;
        if verdict.retryable > 0 {
            bail!(
                "💀 {} documents in the bulk request were throttled or hit a server error (first reason: {}). The whole batch goes back for another round.",
                verdict.retryable,
                verdict.first_reason.as_deref().unwrap_or("unknown")
            );
        }
        if verdict.rejected > 0 {
            error!(
                "💀 Elasticsearch permanently rejected {} documents (first reason: {}). Retrying will not help, so they are dropped.",
                verdict.rejected,
                verdict.first_reason.as_deref().unwrap_or("unknown")
            );
        }
        trace!("🚀 Bulk request landed — documents have left the building, Elvis-style");
        Ok(())
    }
}

/// 🫁 Squish the bulk body. Metric names repeat a lot; gzip loves that.
fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::fast());
    encoder
        .write_all(body)
        .context("💀 gzip refused to eat the bulk body")?;
    encoder
        .finish()
        .context("💀 gzip could not finish the bulk body")
}
