//! Per-command flow-control state machine.
//!
//! ```text
//! Idle ─await_ready─▶ AwaitingReady ─READY─▶ PeerReady ─start─▶ Started
//!                                                │                 │
//!                                                └──────submit─────┴─▶ InFlight
//! InFlight ─await_completion─▶ Responding ─read_frame─▶ Idle
//! ```
//!
//! Any failure, including a call made in the wrong phase, moves the
//! transaction to `Failed`; a failed transaction accepts no further calls.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::control::ControlByte;
use crate::codec::{LatencyRecord, ResponseHeader};
use crate::core::constants::{LATENCY_RECORD_SIZE, TPM_HEADER_SIZE};
use crate::core::{LinkError, LinkResult};
use crate::transport::{Connection, Deadline, Probe};

/// Transaction phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// Nothing sent yet.
    Idle,
    /// Scanning for READY.
    AwaitingReady,
    /// READY observed.
    PeerReady,
    /// START acknowledged.
    Started,
    /// Frame written, waiting for completion.
    InFlight,
    /// Completion READY observed; response bytes follow.
    Responding,
    /// A step failed.
    Failed,
}

/// One command exchange over a borrowed connection.
#[derive(Debug)]
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    name: &'static str,
    phase: TransactionPhase,
}

impl<'c> Transaction<'c> {
    /// Begin a transaction named `name` (used in errors and logs).
    pub fn begin(conn: &'c mut Connection, name: &'static str) -> Self {
        Self {
            conn,
            name,
            phase: TransactionPhase::Idle,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    fn require(&mut self, allowed: &[TransactionPhase], call: &str) -> LinkResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let err = LinkError::SequenceError(format!(
            "{}: {call} not allowed in phase {:?}",
            self.name, self.phase
        ));
        self.phase = TransactionPhase::Failed;
        Err(err)
    }

    fn settle<T>(&mut self, result: LinkResult<T>, next: TransactionPhase) -> LinkResult<T> {
        self.phase = if result.is_ok() {
            next
        } else {
            TransactionPhase::Failed
        };
        result
    }

    /// Wait for READY, sending SYNC on the probe schedule if given.
    ///
    /// After a probed READY, further READY bytes already buffered answer the
    /// same probes and are dropped.
    pub async fn await_ready(&mut self, timeout: Duration, probe: Option<Probe>) -> LinkResult<()> {
        self.require(&[TransactionPhase::Idle], "await_ready")?;
        self.phase = TransactionPhase::AwaitingReady;

        let probed = probe.is_some();
        let result = self
            .conn
            .scan(
                ControlByte::Ready.as_u8(),
                timeout,
                probe,
                ControlByte::Ready.name(),
            )
            .await;
        if result.is_ok() && probed {
            let dropped = self.conn.discard_leading(ControlByte::Ready.as_u8());
            if dropped > 0 {
                trace!(dropped, "discarded duplicate READY bytes");
            }
        }
        self.settle(result, TransactionPhase::PeerReady)
    }

    /// Send START and wait for its ACK. Not retried.
    pub async fn start(&mut self, ack_timeout: Duration) -> LinkResult<()> {
        self.require(&[TransactionPhase::PeerReady], "start")?;
        let result = async {
            self.conn.send_byte(ControlByte::Start.as_u8()).await?;
            self.conn
                .scan(
                    ControlByte::Ack.as_u8(),
                    ack_timeout,
                    None,
                    ControlByte::Ack.name(),
                )
                .await
        }
        .await;
        self.settle(result, TransactionPhase::Started)
    }

    /// Write the command frame.
    pub async fn submit(&mut self, frame: &Bytes) -> LinkResult<()> {
        self.require(
            &[TransactionPhase::PeerReady, TransactionPhase::Started],
            "submit",
        )?;
        debug!(command = self.name, len = frame.len(), "submit");
        let result = self.conn.send(frame.clone()).await;
        self.settle(result, TransactionPhase::InFlight)
    }

    /// Wait for the READY that marks command completion (no probing).
    pub async fn await_completion(&mut self, timeout: Duration) -> LinkResult<()> {
        self.require(&[TransactionPhase::InFlight], "await_completion")?;
        let result = self
            .conn
            .scan(
                ControlByte::Ready.as_u8(),
                timeout,
                None,
                ControlByte::Ready.name(),
            )
            .await;
        self.settle(result, TransactionPhase::Responding)
    }

    /// Read the latency record and the READY that follows it.
    ///
    /// Late READY bytes answering earlier SYNC probes are dropped first.
    pub async fn read_latency(&mut self, timeout: Duration) -> LinkResult<LatencyRecord> {
        self.require(&[TransactionPhase::Responding], "read_latency")?;
        let name = self.name;
        let result = async {
            let deadline = Deadline::after(timeout);
            self.skip_stale_ready(deadline.remaining()).await?;
            let raw = self
                .conn
                .read_exact(LATENCY_RECORD_SIZE, deadline.remaining())
                .await?;
            let record =
                LatencyRecord::parse(&raw).map_err(|e| LinkError::malformed(name, e))?;
            self.conn
                .scan(
                    ControlByte::Ready.as_u8(),
                    deadline.remaining(),
                    None,
                    ControlByte::Ready.name(),
                )
                .await?;
            Ok::<_, LinkError>(record)
        }
        .await;
        self.settle(result, TransactionPhase::Responding)
    }

    /// Read a complete response frame (header, then `size - 10` body bytes).
    ///
    /// A tag never starts with READY, so leading READY bytes are dropped.
    /// Sizes beyond the device buffer fail before any body byte is read.
    /// The frame is returned undecoded; the transaction returns to `Idle`.
    pub async fn read_frame(&mut self, timeout: Duration) -> LinkResult<Bytes> {
        self.require(&[TransactionPhase::Responding], "read_frame")?;
        let name = self.name;
        let result = async {
            let deadline = Deadline::after(timeout);
            self.skip_stale_ready(deadline.remaining()).await?;
            let mut raw = self
                .conn
                .read_exact(TPM_HEADER_SIZE, deadline.remaining())
                .await?;
            let header = ResponseHeader::parse(&raw).map_err(|e| LinkError::malformed(name, e))?;
            let body = self
                .conn
                .read_exact(header.body_len(), deadline.remaining())
                .await?;
            raw.extend_from_slice(&body);
            Ok::<_, LinkError>(Bytes::from(raw))
        }
        .await;
        self.settle(result, TransactionPhase::Idle)
    }

    async fn skip_stale_ready(&mut self, timeout: Duration) -> LinkResult<()> {
        let skipped = self
            .conn
            .skip_leading(ControlByte::Ready.as_u8(), timeout)
            .await?;
        if skipped > 0 {
            debug!(command = self.name, skipped, "dropped late READY bytes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const WAIT: Duration = Duration::from_secs(2);

    fn pipe() -> (DuplexStream, Connection) {
        let (peer, local) = tokio::io::duplex(4096);
        (peer, Connection::from_stream(local, "pipe"))
    }

    #[tokio::test]
    async fn test_happy_path_with_latency() {
        let (mut peer, mut conn) = pipe();
        let frame = Bytes::from(hex::decode("80010000000C000001440000").unwrap());

        let device = tokio::spawn(async move {
            peer.write_all(&[0xA0]).await.unwrap();
            let mut cmd = [0u8; 12];
            peer.read_exact(&mut cmd).await.unwrap();
            peer.write_all(&[0xA0, 0, 0, 0, 0, 0, 0, 0x01, 0x00, 0xA0])
                .await
                .unwrap();
            peer.write_all(&hex::decode("80010000000A00000000").unwrap())
                .await
                .unwrap();
            (peer, cmd)
        });

        let mut tx = Transaction::begin(&mut conn, "Startup");
        tx.await_ready(WAIT, None).await.unwrap();
        assert_eq!(tx.phase(), TransactionPhase::PeerReady);
        tx.submit(&frame).await.unwrap();
        tx.await_completion(WAIT).await.unwrap();
        let latency = tx.read_latency(WAIT).await.unwrap();
        assert_eq!(latency.cycles, 256);
        let rsp = tx.read_frame(WAIT).await.unwrap();
        assert_eq!(hex::encode_upper(&rsp), "80010000000A00000000");
        assert_eq!(tx.phase(), TransactionPhase::Idle);

        let (_peer, cmd) = device.await.unwrap();
        assert_eq!(&cmd[..], &frame[..]);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_out_of_order_is_sequence_error() {
        let (_peer, mut conn) = pipe();
        let mut tx = Transaction::begin(&mut conn, "GetRandom");
        let err = tx
            .submit(&Bytes::from_static(&[0x80]))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::SequenceError(_)));
        assert_eq!(tx.phase(), TransactionPhase::Failed);

        let err = tx.await_ready(WAIT, None).await.unwrap_err();
        assert!(matches!(err, LinkError::SequenceError(_)));
        drop(tx);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_start_requires_ack() {
        let (mut peer, mut conn) = pipe();
        peer.write_all(&[0xA0]).await.unwrap();

        let mut tx = Transaction::begin(&mut conn, "Startup");
        tx.await_ready(WAIT, None).await.unwrap();
        let err = tx.start(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, LinkError::HandshakeTimeout { ref expected, .. } if expected == "ACK"));
        assert_eq!(tx.phase(), TransactionPhase::Failed);

        let mut sent = [0u8; 1];
        peer.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent[0], 0xAC);
        drop(tx);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_probed_ready_drops_duplicates() {
        let (mut peer, mut conn) = pipe();
        peer.write_all(&[0xA0, 0xA0, 0xA0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut tx = Transaction::begin(&mut conn, "Startup");
        tx.await_ready(WAIT, Some(Probe::new(0xB0, Duration::from_millis(500))))
            .await
            .unwrap();
        tx.submit(&Bytes::from_static(&[0x80, 0x01]))
            .await
            .unwrap();
        let err = tx
            .await_completion(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        drop(tx);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_late_probe_answer_does_not_shift_frame() {
        let (mut peer, mut conn) = pipe();
        peer.write_all(&[0xA0]).await.unwrap();

        let mut tx = Transaction::begin(&mut conn, "Startup");
        tx.await_ready(WAIT, Some(Probe::new(0xB0, Duration::from_millis(500))))
            .await
            .unwrap();
        tx.submit(&Bytes::from_static(&[0x80, 0x01])).await.unwrap();

        // answer to an earlier SYNC, then the completion READY
        peer.write_all(&[0xA0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        peer.write_all(&[0xA0]).await.unwrap();
        peer.write_all(&hex::decode("80010000000A00000000").unwrap())
            .await
            .unwrap();

        tx.await_completion(WAIT).await.unwrap();
        let rsp = tx.read_frame(WAIT).await.unwrap();
        assert_eq!(hex::encode_upper(&rsp), "80010000000A00000000");
        drop(tx);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_late_probe_answer_before_latency_record() {
        let (mut peer, mut conn) = pipe();
        peer.write_all(&[0xA0]).await.unwrap();

        let mut tx = Transaction::begin(&mut conn, "Startup");
        tx.await_ready(WAIT, None).await.unwrap();
        tx.submit(&Bytes::from_static(&[0x80, 0x01])).await.unwrap();
        peer.write_all(&[0xA0, 0xA0, 0, 0, 0, 0, 0, 0, 0x30, 0x39, 0xA0])
            .await
            .unwrap();
        peer.write_all(&hex::decode("80010000000A00000000").unwrap())
            .await
            .unwrap();

        tx.await_completion(WAIT).await.unwrap();
        assert_eq!(tx.read_latency(WAIT).await.unwrap().cycles, 12345);
        let rsp = tx.read_frame(WAIT).await.unwrap();
        assert_eq!(hex::encode_upper(&rsp), "80010000000A00000000");
        drop(tx);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_before_body() {
        let (mut peer, mut conn) = pipe();
        peer.write_all(&[0xA0]).await.unwrap();

        let mut tx = Transaction::begin(&mut conn, "GetRandom");
        tx.await_ready(WAIT, None).await.unwrap();
        tx.submit(&Bytes::from_static(&[0x80])).await.unwrap();
        peer.write_all(&[0xA0]).await.unwrap();
        peer.write_all(&hex::decode("8001FFFFFFF000000000").unwrap())
            .await
            .unwrap();
        tx.await_completion(WAIT).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = tx.read_frame(Duration::from_secs(60)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            LinkError::MalformedResponse {
                operation: "GetRandom",
                ..
            }
        ));
        assert_eq!(tx.phase(), TransactionPhase::Failed);
        drop(tx);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_header_size_below_minimum() {
        let (mut peer, mut conn) = pipe();
        peer.write_all(&[0xA0]).await.unwrap();

        let mut tx = Transaction::begin(&mut conn, "Startup");
        tx.await_ready(WAIT, None).await.unwrap();
        tx.submit(&Bytes::from_static(&[0x80])).await.unwrap();
        peer.write_all(&[0xA0]).await.unwrap();
        peer.write_all(&hex::decode("80010000000400000000").unwrap())
            .await
            .unwrap();
        tx.await_completion(WAIT).await.unwrap();
        let err = tx.read_frame(WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::MalformedResponse {
                operation: "Startup",
                ..
            }
        ));
        drop(tx);
        conn.close().await;
    }
}
