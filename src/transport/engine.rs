//! Background I/O engine.
//!
//! One reader task publishes [`Chunk`]s into the inbox; one writer task
//! drains the outbox onto the wire. Both stop when the shared
//! [`CancellationToken`] fires.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::link::{Transport, TransportReader, TransportWriter};
use super::timing::constants;

/// Kind of inbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Bytes received from the peer.
    Data,
    /// The transport failed; the payload is the error message. Always last.
    Error,
}

/// One inbox entry, produced only by the reader task.
#[derive(Debug, Clone)]
pub struct Chunk {
    kind: ChunkKind,
    bytes: Bytes,
    received_at: Instant,
}

impl Chunk {
    fn data(bytes: Vec<u8>) -> Self {
        Self {
            kind: ChunkKind::Data,
            bytes: Bytes::from(bytes),
            received_at: Instant::now(),
        }
    }

    fn error(message: String) -> Self {
        Self {
            kind: ChunkKind::Error,
            bytes: Bytes::from(message),
            received_at: Instant::now(),
        }
    }

    /// Entry kind.
    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Payload.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume into the payload.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// When the reader produced this entry.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Error text for [`ChunkKind::Error`] entries.
    pub fn error_message(&self) -> Option<String> {
        match self.kind {
            ChunkKind::Error => Some(String::from_utf8_lossy(&self.bytes).into_owned()),
            ChunkKind::Data => None,
        }
    }
}

/// Handles to the two engine tasks.
#[derive(Debug)]
pub struct IoEngine {
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Channel ends handed to the connection.
#[derive(Debug)]
pub struct EngineChannels {
    /// Reader → consumer.
    pub inbox: mpsc::Receiver<Chunk>,
    /// Consumer → writer.
    pub outbox: mpsc::Sender<Bytes>,
}

impl IoEngine {
    /// Spawn the reader and writer tasks for `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(transport: Transport) -> (Self, EngineChannels) {
        let (inbox_tx, inbox) = mpsc::channel(constants::INBOX_CAPACITY);
        let (outbox, outbox_rx) = mpsc::channel(constants::OUTBOX_CAPACITY);
        let cancel = CancellationToken::new();

        let (read_half, write_half) = transport.into_split();
        let reader = tokio::spawn(reader_loop(read_half, inbox_tx, cancel.clone()));
        let writer = tokio::spawn(writer_loop(write_half, outbox_rx, cancel.clone()));

        let engine = Self {
            cancel,
            reader: Some(reader),
            writer: Some(writer),
        };
        (engine, EngineChannels { inbox, outbox })
    }

    /// Check whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel both tasks and wait for them, aborting any that overrun
    /// [`SHUTDOWN_TIMEOUT`](constants::SHUTDOWN_TIMEOUT). Idempotent.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for (name, slot) in [("reader", &mut self.reader), ("writer", &mut self.writer)] {
            if let Some(handle) = slot.take() {
                join_bounded(name, handle, constants::SHUTDOWN_TIMEOUT).await;
            }
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn join_bounded(name: &str, mut handle: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(())) => debug!(task = name, "engine task stopped"),
        Ok(Err(e)) => warn!(task = name, error = %e, "engine task ended abnormally"),
        Err(_) => {
            warn!(task = name, "engine task did not stop in time, aborting");
            handle.abort();
        }
    }
}

async fn reader_loop(
    mut reader: TransportReader,
    inbox: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read(constants::READ_CHUNK_SIZE, constants::POLL_INTERVAL) => read,
        };

        let chunk = match read {
            Ok(bytes) if bytes.is_empty() => continue,
            Ok(bytes) => {
                trace!(len = bytes.len(), data = %HexFmt(&bytes), "rx");
                Chunk::data(bytes)
            }
            Err(e) => {
                debug!(error = %e, "transport read failed, reader stopping");
                Chunk::error(e.to_string())
            }
        };
        let is_error = chunk.kind() == ChunkKind::Error;

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = inbox.send(chunk) => sent.is_ok(),
        };
        if !delivered || is_error {
            break;
        }
    }
    trace!("reader loop exited");
}

async fn writer_loop(
    mut writer: TransportWriter,
    mut outbox: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = outbox.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        trace!(len = payload.len(), data = %HexFmt(&payload), "tx");
        if let Err(e) = writer.write(&payload).await {
            warn!(error = %e, len = payload.len(), "transport write failed");
        }
    }

    if let Err(e) = writer.close().await {
        debug!(error = %e, "transport shutdown failed");
    }
    trace!("writer loop exited");
}

/// Uppercase hex rendering for log fields.
pub(crate) struct HexFmt<'a>(pub(crate) &'a [u8]);

impl std::fmt::Display for HexFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
