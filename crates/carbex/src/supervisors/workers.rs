//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all
//! the credit in the sprint retro.
//!
//! 🚀 Four kinds of minion live here:
//! - [`Acceptor`]: answers the door, hands every guest a `ConnectionHandler`
//! - `ConnectionHandler`: reads lines, decodes them, shoves datapoints in the queue
//! - [`IndexerWorker`]: pulls batches out of the queue and bulk-upserts them
//! - [`StatsWorker`]: clears its throat every so often and reads the scoreboard aloud
//!
//! ⚠️ "If you're reading this, the code review went poorly." 🦆

use anyhow::Result;
use tokio::task::JoinHandle;

mod acceptor;
mod connection_handler;
mod indexer_worker;
mod stats_worker;

pub(crate) use acceptor::{Acceptor, bind};
pub(crate) use indexer_worker::IndexerWorker;
pub(crate) use stats_worker::StatsWorker;

/// 🏗️ A background worker, that does work. duh.
///
/// 🎯 Hand it everything it needs up front, call `start`, get a handle back.
/// The handle resolves when the worker is done for good: `Ok` for a clean
/// exit, `Err` when something happened that the whole process should hear about.
pub(crate) trait Worker {
    /// 🚀 Start the worker. Returns a JoinHandle because we trust
    /// but verify. Mostly verify. Okay, we don't trust at all.
    fn start(self) -> JoinHandle<Result<()>>;
}
