//! Chunked bulk transfer with one ACK per group.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::control::ControlByte;
use crate::core::constants::{DEFAULT_ACK_TIMEOUT, DEFAULT_GROUP_SIZE};
use crate::core::{LinkError, LinkResult};
use crate::transport::Connection;

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    /// Groups exchanged.
    pub groups: usize,
    /// ACK bytes exchanged (one per group).
    pub acks: usize,
    /// Payload bytes exchanged.
    pub bytes: usize,
}

/// Group size and per-group timeout for bulk transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedTransfer {
    group_size: usize,
    timeout: Duration,
}

impl Default for ChunkedTransfer {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

impl ChunkedTransfer {
    /// Transfer in groups of `group_size` bytes, waiting up to `timeout`
    /// for each group.
    pub fn new(group_size: usize, timeout: Duration) -> LinkResult<Self> {
        if group_size == 0 {
            return Err(LinkError::Config("group size must be at least 1".into()));
        }
        Ok(Self {
            group_size,
            timeout,
        })
    }

    /// Group size.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Per-group timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of groups needed for `len` bytes.
    pub fn groups_for(&self, len: usize) -> usize {
        len.div_ceil(self.group_size)
    }

    /// Write `payload` group by group, waiting for an ACK after each.
    pub async fn send(&self, conn: &mut Connection, payload: &[u8]) -> LinkResult<TransferReport> {
        let groups = self.groups_for(payload.len());
        let mut report = TransferReport::default();

        for (index, group) in payload.chunks(self.group_size).enumerate() {
            let step = async {
                conn.send(Bytes::copy_from_slice(group)).await?;
                conn.scan(
                    ControlByte::Ack.as_u8(),
                    self.timeout,
                    None,
                    ControlByte::Ack.name(),
                )
                .await
            }
            .await;

            if let Err(source) = step {
                debug!(index, groups, sent = report.bytes, "send group failed");
                return Err(LinkError::GroupFailed {
                    index,
                    groups,
                    received: report.bytes,
                    source: Box::new(source),
                });
            }
            report.groups += 1;
            report.acks += 1;
            report.bytes += group.len();
            trace!(index, groups, "group acknowledged");
        }
        Ok(report)
    }

    /// Read `total` bytes group by group, sending an ACK after each.
    ///
    /// On failure the partial group is left in the pushback buffer.
    pub async fn receive(
        &self,
        conn: &mut Connection,
        total: usize,
    ) -> LinkResult<(Vec<u8>, TransferReport)> {
        let groups = self.groups_for(total);
        let mut out = Vec::with_capacity(total);
        let mut report = TransferReport::default();

        for index in 0..groups {
            let want = self.group_size.min(total - out.len());
            let step = async {
                let group = conn.read_exact(want, self.timeout).await?;
                conn.send_byte(ControlByte::Ack.as_u8()).await?;
                Ok::<_, LinkError>(group)
            }
            .await;

            match step {
                Ok(group) => {
                    out.extend_from_slice(&group);
                    report.groups += 1;
                    report.acks += 1;
                    report.bytes = out.len();
                    trace!(index, groups, "group received");
                }
                Err(source) => {
                    debug!(index, groups, received = out.len(), "receive group failed");
                    return Err(LinkError::GroupFailed {
                        index,
                        groups,
                        received: out.len(),
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok((out, report))
    }
}

/// Send `payload` in groups of `group_size`, one ACK per group.
pub async fn send_in_chunks(
    conn: &mut Connection,
    payload: &[u8],
    group_size: usize,
    ack_timeout: Duration,
) -> LinkResult<TransferReport> {
    ChunkedTransfer::new(group_size, ack_timeout)?
        .send(conn, payload)
        .await
}

/// Receive exactly `total` bytes in groups.
pub async fn receive_in_chunks(
    conn: &mut Connection,
    total: usize,
    group_size: usize,
    per_chunk_timeout: Duration,
) -> LinkResult<(Vec<u8>, TransferReport)> {
    ChunkedTransfer::new(group_size, per_chunk_timeout)?
        .receive(conn, total)
        .await
}
