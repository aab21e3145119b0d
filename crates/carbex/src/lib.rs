//! 🦆 carbex — carbon plaintext lines in, Elasticsearch documents out.
//!
//! 🚀 Clients connect over TCP and send `<metric> <value> <timestamp>\n`, forever.
//! Every line is decoded, queued, batched, and bulk-upserted with a
//! deterministic `_id` so a replayed line overwrites instead of duplicating.
//!
//! The pieces, leaves first:
//! - [`decoder`]: one line in, one [`common::Datapoint`] (or a reason why not) out
//! - [`queue`]: the bounded queue every connection pushes into; full means "wait"
//! - `backends`: where batches land (Elasticsearch, or RAM)
//! - `supervisors`: the acceptor, connection handlers, indexers, and the shutdown choreography

pub mod app_config;
mod backends;
pub mod common;
pub mod decoder;
pub mod queue;
pub mod stats;
mod supervisors;

use anyhow::Result;

use crate::app_config::AppConfig;
use crate::supervisors::{Supervisor, shutdown_signal};

/// 🚀 Run the bridge until Ctrl-C / SIGTERM, or until something fatal happens.
///
/// `Ok(())` after a graceful drain. `Err` for a startup failure (bad sink,
/// port taken), a dead accept loop, or a backend that stayed down past every retry.
pub async fn run(app_config: AppConfig) -> Result<()> {
    Supervisor::new(app_config).run(shutdown_signal()).await
}
