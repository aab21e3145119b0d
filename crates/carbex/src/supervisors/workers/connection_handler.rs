//! 🔌 The Connection Handler — one per client, owns its socket and its buffer.
//!
//! 🎬 *[a collectd agent connects. it will not say hello. it will send lines,
//! forever, until a router reboots somewhere.]*
//!
//! Read bytes into a `BytesMut`, find newlines with `memchr`, decode each line,
//! enqueue the good ones, complain about the bad ones, keep reading.
//!
//! Rules of the house:
//! - A bad line costs one `warn!`, never the connection.
//! - Blank lines cost nothing. Clients send them. We've stopped asking why.
//! - A line over `max_line_bytes` is reported once and skipped up to its newline,
//!   so one runaway client can't balloon our memory.
//! - EOF is a clean close. Whatever was left unterminated gets one last decode.
//! - Read errors get a `warn!` and the connection is dropped. Nobody else notices.
//! - A full queue makes `enqueue` wait. That wait IS the backpressure. 🦆

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::decoder::{DecodeError, decode_bytes};
use crate::queue::{IngestionQueue, QueueClosed};
use crate::stats::PipelineStats;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// 🔌 Reads one connection to the end (or to shutdown).
///
/// Generic over the stream so tests can feed it a `tokio::io::duplex` instead
/// of a real socket.
#[derive(Debug)]
pub(crate) struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    queue: IngestionQueue,
    stats: Arc<PipelineStats>,
    max_line_bytes: usize,
    cancel: CancellationToken,
    buf: BytesMut,
    // -- true while skipping the tail of a line that already blew past the cap
    discarding: bool,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + Unpin + Send,
{
    pub(crate) fn new(
        stream: S,
        peer: SocketAddr,
        queue: IngestionQueue,
        stats: Arc<PipelineStats>,
        max_line_bytes: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer,
            queue,
            stats,
            max_line_bytes,
            cancel,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            discarding: false,
        }
    }

    /// 🚀 Run until EOF, a read error, shutdown, or the queue closing underneath us.
    pub(crate) async fn run(mut self) {
        let peer = self.peer;
        match self.pump().await {
            Ok(()) => debug!(%peer, "👋 Connection closed"),
            Err(err) if err.downcast_ref::<QueueClosed>().is_some() => {
                debug!(%peer, "🔒 Queue closed while this connection still had lines, hanging up")
            }
            Err(err) => warn!(%peer, "⚠️ Dropping connection after read error: {err:#}"),
        }
        self.stats.connection_closed();
    }

    async fn pump(&mut self) -> Result<()> {
        loop {
            self.drain_complete_lines().await?;

            let read = tokio::select! {
                _ = self.cancel.cancelled() => {
                    trace!(peer = %self.peer, "🛑 Shutdown while waiting on the socket");
                    return Ok(());
                }
                read = self.stream.read_buf(&mut self.buf) => read.context("💀 Reading from the client socket failed")?,
            };

            if read == 0 {
                // -- EOF: the last line doesn't owe us a newline
                if !self.discarding && !self.buf.is_empty() {
                    let tail = self.buf.split();
                    self.handle_line(&tail).await?;
                }
                return Ok(());
            }
        }
    }

    /// ✂️ Peel off every newline-terminated line currently in the buffer.
    async fn drain_complete_lines(&mut self) -> Result<(), QueueClosed> {
        loop {
            let Some(newline_at) = memchr::memchr(b'\n', &self.buf) else {
                // -- no newline yet; if the partial line is already too big, stop hoarding it
                if content_len(&self.buf) > self.max_line_bytes {
                    if !self.discarding {
                        self.report_line_too_long();
                        self.discarding = true;
                    }
                    self.buf.clear();
                }
                return Ok(());
            };

            let line = self.buf.split_to(newline_at + 1);
            if self.discarding {
                // -- that newline ends the runaway line; we're back in business
                self.discarding = false;
                continue;
            }
            if content_len(&line[..newline_at]) > self.max_line_bytes {
                self.report_line_too_long();
                continue;
            }
            self.handle_line(&line[..newline_at]).await?;
        }
    }

    async fn handle_line(&self, raw: &[u8]) -> Result<(), QueueClosed> {
        let Some(decoded) = decode_bytes(raw) else {
            return Ok(());
        };
        self.stats.line_received();

        match decoded {
            Ok(datapoint) => {
                self.queue.enqueue(datapoint).await?;
                self.stats.datapoint_enqueued();
            }
            Err(err) => self.report_decode_error(&err),
        }
        Ok(())
    }

    fn report_line_too_long(&self) {
        self.stats.line_received();
        self.report_decode_error(&DecodeError::LineTooLong {
            max_line_bytes: self.max_line_bytes,
        });
    }

    fn report_decode_error(&self, err: &DecodeError) {
        self.stats.decode_error();
        warn!(peer = %self.peer, "⚠️ Skipping line: {err}");
    }
}

/// 📏 Length of a line as far as the cap is concerned: a CRLF's `\r` is line
/// ending, not content.
fn content_len(line: &[u8]) -> usize {
    line.strip_suffix(b"\r").unwrap_or(line).len()
}
