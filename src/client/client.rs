//! High-level TPM client.
//!
//! `TpmClient` owns one [`Connection`] and runs every command through the
//! same exchange:
//!
//! 1. wait for READY (SYNC-probed when configured)
//! 2. write the command frame
//! 3. wait for the completion READY
//! 4. in latency mode, read the cycle record and the READY after it
//! 5. read the response header and body, check the code, extract outputs

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::config::LinkConfig;
use super::events::{ClientEvent, EventBus};
use super::sequence::{SignSequence, VerifySequence};
use crate::codec::{
    LatencyRecord, Operation, PrimaryTemplate, PublicArea, ResponseFrame, Signature, StartupType,
    Unmarshal, VerifiedTicket,
};
use crate::core::constants::{DEFAULT_KEY_PASSWORD, MAX_RANDOM_BYTES};
use crate::core::{CodecError, LinkError, LinkResult};
use crate::handshake::{ControlByte, Transaction};
use crate::transport::{Connection, Probe};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Result of CreatePrimary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    /// Object handle for the new key.
    pub handle: u32,
    /// Parsed `outPublic`.
    pub public: PublicArea,
}

/// Client for a TPM-like peer.
///
/// Every call takes `&mut self`; a client drives one exchange at a time.
#[derive(Debug)]
pub struct TpmClient {
    conn: Connection,
    config: LinkConfig,
    id: u64,
    generation: u64,
    key_password: Bytes,
    last_latency: Option<LatencyRecord>,
    events: EventBus,
}

impl TpmClient {
    /// Open the configured endpoint and wrap it.
    pub async fn connect(config: LinkConfig) -> LinkResult<Self> {
        let conn = Connection::open(&config.endpoint, config.connect_timeout).await?;
        info!(endpoint = %config.endpoint, "connected");
        Ok(Self::from_connection(conn, config))
    }

    /// Wrap an already-open connection.
    pub fn from_connection(conn: Connection, config: LinkConfig) -> Self {
        Self {
            conn,
            config,
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            key_password: Bytes::from_static(DEFAULT_KEY_PASSWORD),
            last_latency: None,
            events: EventBus::new(),
        }
    }

    /// Replace the key password used for CreatePrimary and HashSignStart.
    pub fn with_key_password(mut self, password: impl Into<Bytes>) -> Self {
        self.key_password = password.into();
        self
    }

    /// Process-unique id of this client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of successful Startup commands so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Active configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The most recent latency record, if latency mode is on.
    pub fn last_latency(&self) -> Option<LatencyRecord> {
        self.last_latency
    }

    /// Cycles reported by the most recent latency record.
    pub fn last_latency_cycles(&self) -> Option<u64> {
        self.last_latency.map(|record| record.cycles)
    }

    /// Subscribe to command/response events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn sync_probe(&self) -> Option<Probe> {
        self.config
            .sync_probe
            .map(|interval| Probe::new(ControlByte::Sync.as_u8(), interval))
    }

    /// Wait for the device's first READY after boot.
    pub async fn wait_for_platform_ready(&mut self) -> LinkResult<()> {
        let probe = self.sync_probe();
        self.conn
            .scan(
                ControlByte::Ready.as_u8(),
                self.config.ready_timeout,
                probe,
                ControlByte::Ready.name(),
            )
            .await?;
        info!("platform ready");
        Ok(())
    }

    /// Run one command and decode its response.
    ///
    /// A nonzero response code is reported as `MalformedResponse` carrying
    /// the code; the raw response is still published as an event.
    pub async fn execute(&mut self, operation: &Operation) -> LinkResult<ResponseFrame> {
        let name = operation.name();
        let frame = operation
            .encode()
            .map_err(|source| LinkError::Encode {
                operation: name,
                source,
            })?;
        let handles_out = operation.response_handles();

        self.events.emit(ClientEvent::Command {
            operation: name,
            bytes: frame.clone(),
            handles_out,
        });

        let probe = self.sync_probe();
        let timeout = self.config.operation_timeout;
        let mut tx = Transaction::begin(&mut self.conn, name);
        tx.await_ready(self.config.ready_timeout, probe).await?;
        if self.config.start_ack {
            tx.start(self.config.ack_timeout).await?;
        }
        tx.submit(&frame).await?;
        tx.await_completion(timeout).await?;
        let latency = if self.config.latency {
            Some(tx.read_latency(timeout).await?)
        } else {
            None
        };
        let raw = tx.read_frame(timeout).await?;

        if let Some(record) = latency {
            info!(command = name, cycles = record.cycles, "command latency");
        }
        self.last_latency = latency;
        self.events.emit(ClientEvent::Response {
            operation: name,
            bytes: raw.clone(),
            handles_out,
            latency: latency.map(|record| record.cycles),
        });

        let response =
            ResponseFrame::decode(raw, handles_out).map_err(|e| LinkError::malformed(name, e))?;
        debug!(command = name, size = response.header().size, "response decoded");
        Ok(response)
    }

    /// TPM2_Startup. Open sequences become stale on success.
    pub async fn startup(&mut self, startup_type: StartupType) -> LinkResult<ResponseFrame> {
        let response = self.execute(&Operation::Startup(startup_type)).await?;
        self.generation += 1;
        Ok(response)
    }

    /// TPM2_GetRandom. `count` is clamped to `1..=0xFFFF`.
    pub async fn get_random(&mut self, count: usize) -> LinkResult<Vec<u8>> {
        let count = count.clamp(1, MAX_RANDOM_BYTES as usize) as u16;
        let response = self.execute(&Operation::GetRandom(count)).await?;
        let random = Unmarshal::new(response.declared_parameters(), "randomBytes")
            .tpm2b()
            .map_err(|e| LinkError::malformed("GetRandom", e))?;
        Ok(random.to_vec())
    }

    /// TPM2_CreatePrimary under the owner hierarchy.
    pub async fn create_primary(&mut self, template: PrimaryTemplate) -> LinkResult<PrimaryKey> {
        let operation = Operation::CreatePrimary {
            template,
            key_password: self.key_password.clone(),
        };
        let response = self.execute(&operation).await?;
        let handle = first_handle(&response, "CreatePrimary")?;
        let public = PublicArea::parse_tpm2b(response.declared_parameters())
            .map_err(|e| LinkError::malformed("CreatePrimary", e))?;
        info!("primary key created with handle 0x{handle:08X}");
        Ok(PrimaryKey { handle, public })
    }

    /// Begin a signing sequence over `total_len` bytes.
    pub async fn sign_start(&mut self, key: u32, total_len: u32) -> LinkResult<SignSequence> {
        let operation = Operation::HashSignStart {
            key,
            total_len,
            key_password: self.key_password.clone(),
        };
        let response = self.execute(&operation).await?;
        let handle = first_handle(&response, "HashSignStart")?;
        Ok(SignSequence::new(handle, self.id, self.generation, total_len))
    }

    /// Feed the next message chunk to a signing sequence.
    pub async fn sign_update(&mut self, sequence: &mut SignSequence, chunk: &[u8]) -> LinkResult<()> {
        let supplied = sequence.prepare_update(self.id, self.generation, chunk.len())?;
        self.sequence_update(sequence.handle(), chunk).await?;
        sequence.record_update(supplied);
        Ok(())
    }

    /// Complete a signing sequence.
    pub async fn sign_finish(&mut self, sequence: SignSequence) -> LinkResult<Signature> {
        sequence.prepare_finish(self.id, self.generation)?;
        let response = self
            .execute(&Operation::HashSignFinish {
                sequence: sequence.handle(),
            })
            .await?;
        Signature::parse(response.declared_parameters())
            .map_err(|e| LinkError::malformed("HashSignFinish", e))
    }

    /// Begin a verification sequence.
    pub async fn verify_start(
        &mut self,
        key: u32,
        total_len: u32,
        signature: &Signature,
    ) -> LinkResult<VerifySequence> {
        let operation = Operation::HashVerifyStart {
            key,
            total_len,
            signature: signature.clone(),
        };
        let response = self.execute(&operation).await?;
        let handle = first_handle(&response, "HashVerifyStart")?;
        Ok(VerifySequence::new(handle, self.id, self.generation, total_len))
    }

    /// Feed the next message chunk to a verification sequence.
    pub async fn verify_update(
        &mut self,
        sequence: &mut VerifySequence,
        chunk: &[u8],
    ) -> LinkResult<()> {
        let supplied = sequence.prepare_update(self.id, self.generation, chunk.len())?;
        self.sequence_update(sequence.handle(), chunk).await?;
        sequence.record_update(supplied);
        Ok(())
    }

    /// Complete a verification sequence.
    pub async fn verify_finish(&mut self, sequence: VerifySequence) -> LinkResult<VerifiedTicket> {
        sequence.prepare_finish(self.id, self.generation)?;
        let response = self
            .execute(&Operation::HashVerifyFinish {
                sequence: sequence.handle(),
            })
            .await?;
        VerifiedTicket::parse(response.declared_parameters())
            .map_err(|e| LinkError::malformed("HashVerifyFinish", e))
    }

    async fn sequence_update(&mut self, sequence: u32, chunk: &[u8]) -> LinkResult<()> {
        self.execute(&Operation::SequenceUpdate {
            sequence,
            chunk: Bytes::copy_from_slice(chunk),
        })
        .await
        .map(drop)
    }

    /// Sign `message` in `chunk_size` pieces.
    ///
    /// Fails at the first failing step with `StepFailed`.
    pub async fn sign(&mut self, key: u32, message: &[u8], chunk_size: usize) -> LinkResult<Signature> {
        let total_len = message_len(message, chunk_size)?;
        let mut sequence = self
            .sign_start(key, total_len)
            .await
            .map_err(|e| e.at_step("HashSignStart"))?;
        for (index, chunk) in message.chunks(chunk_size).enumerate() {
            self.sign_update(&mut sequence, chunk)
                .await
                .map_err(|e| e.at_step(format!("SequenceUpdate {index}")))?;
        }
        self.sign_finish(sequence)
            .await
            .map_err(|e| e.at_step("HashSignFinish"))
    }

    /// Verify `signature` over `message` in `chunk_size` pieces.
    pub async fn verify(
        &mut self,
        key: u32,
        message: &[u8],
        signature: &Signature,
        chunk_size: usize,
    ) -> LinkResult<VerifiedTicket> {
        let total_len = message_len(message, chunk_size)?;
        let mut sequence = self
            .verify_start(key, total_len, signature)
            .await
            .map_err(|e| e.at_step("HashVerifyStart"))?;
        for (index, chunk) in message.chunks(chunk_size).enumerate() {
            self.verify_update(&mut sequence, chunk)
                .await
                .map_err(|e| e.at_step(format!("SequenceUpdate {index}")))?;
        }
        self.verify_finish(sequence)
            .await
            .map_err(|e| e.at_step("HashVerifyFinish"))
    }

    /// Stop the engine and close the transport. Idempotent.
    pub async fn close(&mut self) {
        self.conn.close().await;
    }
}

fn first_handle(response: &ResponseFrame, operation: &'static str) -> LinkResult<u32> {
    response.handle(0).ok_or_else(|| {
        LinkError::malformed(
            operation,
            CodecError::TooShort {
                what: "response handle",
                expected: 1,
                actual: 0,
            },
        )
    })
}

fn message_len(message: &[u8], chunk_size: usize) -> LinkResult<u32> {
    if chunk_size == 0 || chunk_size > u16::MAX as usize {
        return Err(LinkError::Config(format!(
            "update chunk size {chunk_size} outside 1..=65535"
        )));
    }
    u32::try_from(message.len())
        .map_err(|_| LinkError::Config(format!("message of {} bytes is too long", message.len())))
}
