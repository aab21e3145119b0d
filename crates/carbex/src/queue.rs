// ai
//! 🚰 The Ingestion Queue — the one and only shared mutable thing in carbex.
//!
//! 🎬 *[many connections push. a few indexers pull. one queue keeps the peace.]*
//!
//! Built on a bounded `async_channel`, which is MPMC, FIFO, and already does
//! the locking so we don't have to. Every datapoint handed to [`IngestionQueue::enqueue`]
//! comes out of exactly one [`IngestionQueue::dequeue_batch`]. Not zero. Not two.
//!
//! 🧠 Knowledge graph:
//! - Full queue → `enqueue` parks the connection handler. That is the backpressure:
//!   a slow backend slows the TCP readers instead of eating the heap.
//! - `dequeue_batch` grabs up to `max_size` items, waiting at most `max_wait`
//!   for stragglers. Partial batches are fine. Late batches are not.
//! - `close` stops new sends; receivers still drain what's left. That's the
//!   graceful-shutdown handshake with the indexers. 🦆

use std::time::Duration;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use tokio::time::{Instant, timeout_at};

use crate::common::Datapoint;

/// 🚰 Cloneable handle to the bounded datapoint queue.
///
/// Every clone talks to the same channel. Handlers get one, indexers get one,
/// the supervisor keeps one to close it at shutdown.
#[derive(Debug, Clone)]
pub struct IngestionQueue {
    tx: Sender<Datapoint>,
    rx: Receiver<Datapoint>,
}

/// 💀 The queue was closed while we were trying to put something in it.
#[derive(Debug, thiserror::Error)]
#[error("ingestion queue is closed")]
pub struct QueueClosed;

impl IngestionQueue {
    /// 🏗️ A queue that holds at most `max_pending` datapoints.
    ///
    /// `max_pending` must be at least one; config validation makes sure of it
    /// before we get here, because a zero-capacity channel is a different animal.
    pub fn new(max_pending: usize) -> Self {
        let (tx, rx) = async_channel::bounded(max_pending.max(1));
        Self { tx, rx }
    }

    /// 📥 Put one datapoint in line. Waits while the queue is full.
    pub async fn enqueue(&self, datapoint: Datapoint) -> Result<(), QueueClosed> {
        self.tx.send(datapoint).await.map_err(|_| QueueClosed)
    }

    /// 📤 Take up to `max_size` datapoints, oldest first.
    ///
    /// Returns as soon as `max_size` are collected, or when `max_wait` runs out
    /// with whatever has arrived (possibly nothing). Returns `None` only once the
    /// queue is closed AND empty, which is the indexers' cue to go home.
    pub async fn dequeue_batch(
        &self,
        max_size: usize,
        max_wait: Duration,
    ) -> Option<Vec<Datapoint>> {
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_size.min(4096));

        while batch.len() < max_size {
            // -- ⚡ fast path: whatever is already sitting there, grab it without a timer
            match self.rx.try_recv() {
                Ok(datapoint) => {
                    batch.push(datapoint);
                    continue;
                }
                Err(async_channel::TryRecvError::Closed) => break,
                Err(async_channel::TryRecvError::Empty) => {}
            }

            // -- ⏳ slow path: wait for the next arrival, but never past the deadline.
            // -- Dropping a pending `recv` loses nothing, so the timeout is safe.
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(datapoint)) => batch.push(datapoint),
                Ok(Err(_closed)) => break,
                Err(_elapsed) => break,
            }
        }

        if batch.is_empty() && self.rx.is_closed() && self.rx.is_empty() {
            return None;
        }
        Some(batch)
    }

    /// 🔒 Stop accepting new datapoints. Already-queued ones can still be dequeued.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    /// 📏 How many datapoints are waiting right now.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// 📐 The configured `max_pending`.
    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_line;
    use std::sync::Arc;

    fn dp(line: &str) -> Datapoint {
        decode_line(line).expect("💀 test fixtures should decode")
    }

    #[tokio::test]
    async fn the_one_where_the_batch_is_full_before_the_timer_even_blinks() -> Result<()> {
        let queue = IngestionQueue::new(16);
        for i in 0..5 {
            queue.enqueue(dp(&format!("m {i} {i}"))).await?;
        }

        let batch = queue
            .dequeue_batch(3, Duration::from_secs(30))
            .await
            .expect("💀 queue is open");
        let timestamps: Vec<i32> = batch.iter().map(Datapoint::timestamp).collect();
        assert_eq!(timestamps, vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_three_is_a_crowd_and_also_a_partial_batch() -> Result<()> {
        let queue = IngestionQueue::new(16);
        for i in 0..3 {
            queue.enqueue(dp(&format!("m 1.0 {i}"))).await?;
        }

        let started = Instant::now();
        let batch = queue
            .dequeue_batch(10, Duration::from_millis(200))
            .await
            .expect("💀 queue is open");

        assert_eq!(batch.len(), 3, "all three, not fewer");
        let waited = started.elapsed();
        assert!(
            waited >= Duration::from_millis(200) && waited < Duration::from_millis(250),
            "waits out max_wait, and not much longer: {waited:?}"
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_an_empty_open_queue_returns_an_empty_batch() {
        let queue = IngestionQueue::new(4);
        let batch = queue.dequeue_batch(10, Duration::from_millis(50)).await;
        assert_eq!(batch, Some(vec![]));
    }

    #[tokio::test]
    async fn the_one_where_capacity_k_means_the_k_plus_first_waits() -> Result<()> {
        let queue = IngestionQueue::new(2);
        queue.enqueue(dp("m 1 1")).await?;
        queue.enqueue(dp("m 1 2")).await?;
        assert_eq!(queue.len(), 2);

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(dp("m 1 3")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "third enqueue must park on a full queue");
        assert!(queue.len() <= queue.capacity());

        let first = queue
            .dequeue_batch(1, Duration::from_millis(10))
            .await
            .expect("💀 queue is open");
        assert_eq!(first.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("💀 freed slot should release the producer")
            .expect("💀 producer task panicked")?;
        assert_eq!(queue.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_closing_still_lets_the_leftovers_out() -> Result<()> {
        let queue = IngestionQueue::new(8);
        queue.enqueue(dp("m 1 1")).await?;
        queue.enqueue(dp("m 1 2")).await?;
        queue.close();

        assert!(queue.enqueue(dp("m 1 3")).await.is_err());
        let leftovers = queue
            .dequeue_batch(10, Duration::from_secs(5))
            .await
            .expect("💀 two items should still be there");
        assert_eq!(leftovers.len(), 2);
        assert_eq!(queue.dequeue_batch(10, Duration::from_secs(5)).await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_many_producers_and_consumers_lose_nothing() -> Result<()> {
        const PRODUCERS: i32 = 8;
        const PER_PRODUCER: i32 = 500;

        let queue = IngestionQueue::new(32);
        let mut producers = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    queue
                        .enqueue(dp(&format!("p{producer} 1.0 {seq}")))
                        .await
                        .expect("💀 queue closed under a producer");
                }
            }));
        }

        let collected = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            let collected = Arc::clone(&collected);
            consumers.push(tokio::spawn(async move {
                while let Some(batch) = queue.dequeue_batch(17, Duration::from_millis(20)).await {
                    // -- one lock per batch keeps each batch's internal order intact in the log
                    collected.lock().await.push(batch);
                }
            }));
        }

        for producer in producers {
            producer.await?;
        }
        queue.close();
        for consumer in consumers {
            consumer.await?;
        }

        let batches = collected.lock().await;
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, (PRODUCERS * PER_PRODUCER) as usize, "no loss, no dupes");

        // -- 🎯 inside any single batch, one producer's datapoints must keep their send order
        for batch in batches.iter() {
            for producer in 0..PRODUCERS {
                let name = format!("p{producer}");
                let seqs: Vec<i32> = batch
                    .iter()
                    .filter(|d| d.metric() == name)
                    .map(Datapoint::timestamp)
                    .collect();
                assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{name} reordered: {seqs:?}");
            }
        }
        Ok(())
    }
}
