//! A live connection to the peer.
//!
//! Owns the engine tasks, the inbox, the outbox and the pushback buffer. All
//! waits take `&mut self`, so exactly one logical waiter consumes bytes at a
//! time.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::engine::{Chunk, ChunkKind, EngineChannels, HexFmt, IoEngine};
use super::link::{Endpoint, Transport};
use super::pushback::PushbackBuffer;
use super::timing::{Deadline, Probe, ProbeClock};
use crate::core::{LinkError, LinkResult};

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Engine running, waits allowed.
    Open,
    /// The reader reported a transport failure; every wait fails.
    Failed(String),
    /// Closed by the host.
    Closed,
}

/// A connected, flow-controlled byte channel.
#[derive(Debug)]
pub struct Connection {
    description: String,
    phase: ConnectionPhase,
    engine: IoEngine,
    inbox: mpsc::Receiver<Chunk>,
    outbox: mpsc::Sender<Bytes>,
    pushback: PushbackBuffer,
}

impl Connection {
    /// Connect to `endpoint` and start the engine.
    pub async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> LinkResult<Self> {
        let transport = Transport::open(endpoint, connect_timeout).await?;
        Ok(Self::from_transport(transport))
    }

    /// Start the engine on an already connected transport.
    pub fn from_transport(transport: Transport) -> Self {
        let description = transport.description().to_string();
        let (engine, EngineChannels { inbox, outbox }) = IoEngine::spawn(transport);
        info!(peer = %description, "connection open");
        Self {
            description,
            phase: ConnectionPhase::Open,
            engine,
            inbox,
            outbox,
            pushback: PushbackBuffer::new(),
        }
    }

    /// Start the engine on any duplex stream.
    pub fn from_stream<S>(stream: S, description: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_transport(Transport::from_stream(stream, description))
    }

    /// Description of the underlying transport.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current phase.
    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    /// Check if the connection still accepts waits and writes.
    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }

    /// Bytes currently parked in the pushback buffer.
    pub fn pushback_len(&self) -> usize {
        self.pushback.len()
    }

    fn ensure_open(&self) -> LinkResult<()> {
        match &self.phase {
            ConnectionPhase::Open => Ok(()),
            ConnectionPhase::Failed(reason) => Err(LinkError::ReaderFailed(reason.clone())),
            ConnectionPhase::Closed => Err(LinkError::Closed),
        }
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Queue raw bytes for the writer.
    pub async fn send(&mut self, data: impl Into<Bytes>) -> LinkResult<()> {
        self.ensure_open()?;
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        trace!(len = data.len(), "queue");
        self.outbox.send(data).await.map_err(|_| LinkError::Closed)
    }

    /// Queue a single control byte.
    pub async fn send_byte(&mut self, byte: u8) -> LinkResult<()> {
        self.send(Bytes::copy_from_slice(&[byte])).await
    }

    /// Queue `text` followed by a newline.
    pub async fn send_line(&mut self, text: &str) -> LinkResult<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.send(line).await
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Wait up to `wait` for the next data chunk.
    ///
    /// `Ok(None)` means nothing arrived. An error chunk moves the connection
    /// to [`ConnectionPhase::Failed`].
    async fn next_chunk(&mut self, wait: Duration) -> LinkResult<Option<Bytes>> {
        self.ensure_open()?;
        match tokio::time::timeout(wait, self.inbox.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(chunk)) => match chunk.kind() {
                ChunkKind::Data => Ok(Some(chunk.into_bytes())),
                ChunkKind::Error => {
                    let reason = chunk
                        .error_message()
                        .unwrap_or_else(|| "transport error".to_string());
                    debug!(peer = %self.description, %reason, "reader failed");
                    self.phase = ConnectionPhase::Failed(reason.clone());
                    Err(LinkError::ReaderFailed(reason))
                }
            },
            Ok(None) => {
                self.phase = ConnectionPhase::Failed("reader task stopped".to_string());
                Err(LinkError::Closed)
            }
        }
    }

    /// Wait for `byte`, discarding anything before it.
    ///
    /// Bytes after the match stay buffered for the next wait.
    pub async fn wait_for_byte(&mut self, byte: u8, timeout: Duration) -> LinkResult<()> {
        self.scan(byte, timeout, None, &format!("byte 0x{byte:02X}"))
            .await
    }

    /// Wait for `target`, re-sending the probe byte on its schedule.
    ///
    /// The first probe is sent immediately. `expected` names the target in a
    /// timeout error.
    pub async fn scan(
        &mut self,
        target: u8,
        timeout: Duration,
        probe: Option<Probe>,
        expected: &str,
    ) -> LinkResult<()> {
        self.ensure_open()?;
        let deadline = Deadline::after(timeout);

        if let Some(skipped) = self.pushback.consume_through(target) {
            trace!(byte = target, skipped, "matched in pushback");
            return Ok(());
        }
        let mut skipped = self.pushback.take_all().len();
        let mut clock = probe.map(ProbeClock::start);

        loop {
            if let Some(byte) = clock.as_mut().and_then(ProbeClock::poll_due) {
                self.send_byte(byte).await?;
            }

            let mut wait = deadline.next_poll();
            if let Some(clock) = &clock {
                wait = wait.min(clock.until_next());
            }

            if let Some(chunk) = self.next_chunk(wait).await? {
                match chunk.iter().position(|b| *b == target) {
                    Some(index) => {
                        skipped += index;
                        self.pushback.extend(&chunk[index + 1..]);
                        trace!(byte = target, skipped, "matched");
                        return Ok(());
                    }
                    None => {
                        trace!(data = %HexFmt(&chunk), "discarded while scanning");
                        skipped += chunk.len();
                    }
                }
            }

            if deadline.is_expired() {
                debug!(%expected, skipped, "scan timed out");
                return Err(LinkError::HandshakeTimeout {
                    expected: expected.to_string(),
                    waited: deadline.elapsed(),
                });
            }
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// On timeout the bytes that did arrive go back to the pushback buffer
    /// and the call fails with [`LinkError::ShortRead`].
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> LinkResult<Vec<u8>> {
        self.ensure_open()?;
        let deadline = Deadline::after(timeout);
        let mut out = self.pushback.take(n);

        while out.len() < n {
            let chunk = match self.next_chunk(deadline.next_poll()).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.pushback.unread(&out);
                    return Err(e);
                }
            };
            if let Some(chunk) = chunk {
                let need = n - out.len();
                if chunk.len() > need {
                    out.extend_from_slice(&chunk[..need]);
                    self.pushback.extend(&chunk[need..]);
                } else {
                    out.extend_from_slice(&chunk);
                }
            }

            if out.len() < n && deadline.is_expired() {
                let received = out.len();
                self.pushback.unread(&out);
                debug!(expected = n, received, "short read");
                return Err(LinkError::ShortRead {
                    expected: n,
                    received,
                });
            }
        }
        Ok(out)
    }

    /// Wait for the byte sequence `text`.
    ///
    /// Returns everything consumed up to and including the match; bytes after
    /// it stay buffered. On timeout nothing is consumed.
    pub async fn wait_for_text(&mut self, text: &[u8], timeout: Duration) -> LinkResult<Vec<u8>> {
        self.ensure_open()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = Deadline::after(timeout);
        let mut seen = self.pushback.take_all();

        loop {
            if let Some(index) = find(&seen, text) {
                let end = index + text.len();
                self.pushback.unread(&seen[end..]);
                seen.truncate(end);
                return Ok(seen);
            }

            match self.next_chunk(deadline.next_poll()).await {
                Ok(Some(chunk)) => seen.extend_from_slice(&chunk),
                Ok(None) => {}
                Err(e) => {
                    self.pushback.unread(&seen);
                    return Err(e);
                }
            }

            if deadline.is_expired() && find(&seen, text).is_none() {
                self.pushback.unread(&seen);
                return Err(LinkError::HandshakeTimeout {
                    expected: format!("text {:?}", String::from_utf8_lossy(text)),
                    waited: deadline.elapsed(),
                });
            }
        }
    }

    /// Take every byte already received without waiting.
    pub fn drain_received(&mut self) -> LinkResult<Vec<u8>> {
        self.ensure_open()?;
        let mut out = self.pushback.take_all();
        loop {
            match self.inbox.try_recv() {
                Ok(chunk) if chunk.kind() == ChunkKind::Data => out.extend_from_slice(chunk.bytes()),
                Ok(chunk) => {
                    let reason = chunk
                        .error_message()
                        .unwrap_or_else(|| "transport error".to_string());
                    self.phase = ConnectionPhase::Failed(reason.clone());
                    if out.is_empty() {
                        return Err(LinkError::ReaderFailed(reason));
                    }
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.phase = ConnectionPhase::Failed("reader task stopped".to_string());
                    if out.is_empty() {
                        return Err(LinkError::Closed);
                    }
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Drop leading occurrences of `byte` from the pushback buffer.
    pub fn discard_leading(&mut self, byte: u8) -> usize {
        self.pushback.discard_leading(byte)
    }

    /// Drop `byte`s until some other byte arrives, which stays buffered.
    ///
    /// Returns how many were dropped. Running out of time is not an error
    /// here; the read that follows reports it.
    pub async fn skip_leading(&mut self, byte: u8, timeout: Duration) -> LinkResult<usize> {
        self.ensure_open()?;
        let deadline = Deadline::after(timeout);
        let mut skipped = 0;
        loop {
            skipped += self.pushback.discard_leading(byte);
            if !self.pushback.is_empty() || deadline.is_expired() {
                return Ok(skipped);
            }
            if let Some(chunk) = self.next_chunk(deadline.next_poll()).await? {
                self.pushback.extend(&chunk);
            }
        }
    }

    /// Stop both engine tasks and close the transport. Idempotent.
    pub async fn close(&mut self) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        self.phase = ConnectionPhase::Closed;
        self.engine.shutdown().await;
        self.inbox.close();
        self.pushback.clear();
        info!(peer = %self.description, "connection closed");
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
