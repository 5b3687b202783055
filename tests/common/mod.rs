//! Simulated TPM peer for integration tests.
//!
//! Speaks the device side of the link over a `tokio::io::duplex` pipe:
//! answers SYNC with READY and START with ACK, assembles command frames by
//! their size field, and replies `READY [latency READY] response`.
//! Signatures are SHA-256 based so they are deterministic and checkable.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use petalite_host::codec::Unmarshal;
use petalite_host::transport::Connection;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub const SYNC: u8 = 0xB0;
pub const READY: u8 = 0xA0;
pub const START: u8 = 0xAC;
pub const ACK: u8 = 0xCC;

pub const RC_HANDLE: u32 = 0x0000_018B;
pub const RC_SIGNATURE: u32 = 0x0000_009B;
pub const ST_VERIFIED: u16 = 0x8022;
pub const RH_OWNER: u32 = 0x4000_0001;

const CC_STARTUP: u32 = 0x0000_0144;
const CC_GET_RANDOM: u32 = 0x0000_017B;
const CC_CREATE_PRIMARY: u32 = 0x0000_0131;
const CC_SEQUENCE_UPDATE: u32 = 0x0000_015C;
const CC_HASH_SIGN_START: u32 = 0x2000_01A0;
const CC_HASH_SIGN_FINISH: u32 = 0x2000_01A1;
const CC_HASH_VERIFY_START: u32 = 0x2000_01A2;
const CC_HASH_VERIFY_FINISH: u32 = 0x2000_01A3;

/// Peer behaviour knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerOptions {
    /// Send this cycle count ahead of every response.
    pub latency_cycles: Option<u64>,
    /// Answer each SYNC only after this long.
    pub sync_reply_delay: Option<Duration>,
}

/// Handle to a running simulated peer.
pub struct SimPeer {
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
    controls: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl SimPeer {
    /// Spawn a peer and return the host-side connection to it.
    pub fn spawn(options: PeerOptions) -> (Connection, SimPeer) {
        let (device_end, host_end) = tokio::io::duplex(64 * 1024);
        let log = Log::default();
        let commands = Arc::clone(&log.commands);
        let controls = Arc::clone(&log.controls);
        let device = Device::new(options);
        let task = tokio::spawn(run(device_end, device, log));
        (
            Connection::from_stream(host_end, "sim"),
            SimPeer {
                commands,
                controls,
                task,
            },
        )
    }

    /// Command frames received so far.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands.lock().unwrap().clone()
    }

    /// Command codes received so far.
    pub fn command_codes(&self) -> Vec<u32> {
        self.commands()
            .iter()
            .map(|cmd| u32::from_be_bytes([cmd[6], cmd[7], cmd[8], cmd[9]]))
            .collect()
    }

    /// SYNC and START bytes received so far, in order.
    pub fn control_bytes(&self) -> Vec<u8> {
        self.controls.lock().unwrap().clone()
    }

    /// Wait for the peer to see EOF (close the host side first).
    pub async fn finish(self) -> Vec<Vec<u8>> {
        self.task.await.unwrap();
        self.commands.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Log {
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
    controls: Arc<Mutex<Vec<u8>>>,
}

async fn run(mut stream: DuplexStream, mut device: Device, log: Log) {
    loop {
        let mut first = [0u8; 1];
        if stream.read_exact(&mut first).await.is_err() {
            return;
        }
        let reply = match first[0] {
            SYNC => {
                log.controls.lock().unwrap().push(SYNC);
                if let Some(delay) = device.options.sync_reply_delay {
                    tokio::time::sleep(delay).await;
                }
                vec![READY]
            }
            START => {
                log.controls.lock().unwrap().push(START);
                vec![ACK]
            }
            0x80 => {
                let mut head = [0u8; 5];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let size = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
                let mut cmd = Vec::with_capacity(size);
                cmd.push(0x80);
                cmd.extend_from_slice(&head);
                cmd.resize(size, 0);
                if stream.read_exact(&mut cmd[6..]).await.is_err() {
                    return;
                }
                log.commands.lock().unwrap().push(cmd.clone());

                let mut out = vec![READY];
                if let Some(cycles) = device.options.latency_cycles {
                    out.extend_from_slice(&cycles.to_be_bytes());
                    out.push(READY);
                }
                out.extend_from_slice(&device.handle(&cmd));
                out
            }
            _ => continue,
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

enum SequenceKind {
    Sign,
    Verify { signature: Vec<u8> },
}

struct OpenSequence {
    kind: SequenceKind,
    key: u32,
    message: Vec<u8>,
}

struct Device {
    options: PeerOptions,
    next_handle: u32,
    keys: HashMap<u32, Vec<u8>>,
    sequences: HashMap<u32, OpenSequence>,
}

impl Device {
    fn new(options: PeerOptions) -> Self {
        Self {
            options,
            next_handle: 0x8000_0000,
            keys: HashMap::new(),
            sequences: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn handle(&mut self, cmd: &[u8]) -> Vec<u8> {
        let mut r = Unmarshal::new(cmd, "command");
        let tag = r.u16().unwrap();
        let _size = r.u32().unwrap();
        let code = r.u32().unwrap();
        let handle = match code {
            CC_STARTUP | CC_GET_RANDOM => None,
            _ => Some(r.u32().unwrap()),
        };
        if tag == 0x8002 {
            let auth_size = r.u32().unwrap();
            r.skip(auth_size as usize).unwrap();
        }

        match code {
            CC_STARTUP => response(false, &[], &[]),
            CC_GET_RANDOM => {
                let count = r.u16().unwrap();
                let random: Vec<u8> = (0..count).map(|i| (i as u8) ^ 0x5A).collect();
                response(false, &[], &tpm2b(&random))
            }
            CC_CREATE_PRIMARY => {
                let _sensitive = r.tpm2b().unwrap();
                let public = r.tpm2b().unwrap();
                let algorithm = u16::from_be_bytes([public[0], public[1]]);
                let key = self.allocate();
                let public_key = derive_public_key(key);
                let out_public = if algorithm == 0x0023 {
                    ecc_public(&public_key)
                } else {
                    dilithium_public(&public_key)
                };
                self.keys.insert(key, public_key);
                response(true, &[key], &tpm2b(&out_public))
            }
            CC_HASH_SIGN_START | CC_HASH_VERIFY_START => {
                let key = handle.unwrap();
                let _total = r.u32().unwrap();
                if !self.keys.contains_key(&key) {
                    return error(RC_HANDLE);
                }
                let kind = if code == CC_HASH_SIGN_START {
                    SequenceKind::Sign
                } else {
                    let _sig_alg = r.u16().unwrap();
                    let _hash_alg = r.u16().unwrap();
                    SequenceKind::Verify {
                        signature: r.tpm2b().unwrap().to_vec(),
                    }
                };
                let sequence = self.allocate();
                self.sequences.insert(
                    sequence,
                    OpenSequence {
                        kind,
                        key,
                        message: Vec::new(),
                    },
                );
                response(code == CC_HASH_SIGN_START, &[sequence], &[])
            }
            CC_SEQUENCE_UPDATE => {
                let data = r.tpm2b().unwrap();
                match self.sequences.get_mut(&handle.unwrap()) {
                    Some(open) => {
                        open.message.extend_from_slice(data);
                        response(true, &[], &[])
                    }
                    None => error(RC_HANDLE),
                }
            }
            CC_HASH_SIGN_FINISH => match self.sequences.remove(&handle.unwrap()) {
                Some(OpenSequence {
                    kind: SequenceKind::Sign,
                    key,
                    message,
                }) => {
                    let signature = sign(&self.keys[&key], &message);
                    let mut params = BytesMut::new();
                    params.put_u16(0x0072);
                    params.put_u16(0x0010);
                    params.put_slice(&tpm2b(&signature));
                    response(true, &[], &params)
                }
                _ => error(RC_HANDLE),
            },
            CC_HASH_VERIFY_FINISH => match self.sequences.remove(&handle.unwrap()) {
                Some(OpenSequence {
                    kind: SequenceKind::Verify { signature },
                    key,
                    message,
                }) => {
                    if sign(&self.keys[&key], &message) != signature {
                        return error(RC_SIGNATURE);
                    }
                    let mut params = BytesMut::new();
                    params.put_u16(ST_VERIFIED);
                    params.put_u32(RH_OWNER);
                    params.put_slice(&tpm2b(&Sha256::digest(&message)));
                    response(true, &[], &params)
                }
                _ => error(RC_HANDLE),
            },
            other => panic!("simulated peer got unknown command 0x{other:08X}"),
        }
    }
}

/// Public key the peer assigns to `handle`.
pub fn derive_public_key(handle: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"petalite-sim-key");
    hasher.update(handle.to_be_bytes());
    hasher.finalize().to_vec()
}

/// Signature the peer produces for `message` under `public_key`.
pub fn sign(public_key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut signature = Sha256::new()
        .chain_update(public_key)
        .chain_update(message)
        .finalize()
        .to_vec();
    signature.extend_from_slice(
        &Sha256::new()
            .chain_update(message)
            .chain_update(public_key)
            .finalize(),
    );
    signature
}

fn tpm2b(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + data.len());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn dilithium_public(public_key: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u16(0x0072);
    out.put_u16(0x000B);
    out.put_u32(0x0004_0472);
    out.put_u16(0); // authPolicy
    out.put_u16(0x0010);
    out.put_u16(0x0010);
    out.put_u8(2);
    out.put_u16(0x000B);
    out.put_slice(&tpm2b(public_key));
    out.to_vec()
}

fn ecc_public(public_key: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u16(0x0023);
    out.put_u16(0x000B);
    out.put_u32(0x0004_0472);
    out.put_u16(0);
    out.put_u16(0x0010);
    out.put_u16(0x0018);
    out.put_u16(0x000B);
    out.put_u16(0x0003);
    out.put_u16(0x0010);
    out.put_slice(&tpm2b(public_key));
    out.put_slice(&tpm2b(&Sha256::digest(public_key)));
    out.to_vec()
}

fn response(sessions: bool, handles: &[u32], params: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for handle in handles {
        body.put_u32(*handle);
    }
    if sessions {
        body.put_u32(params.len() as u32);
        body.put_slice(params);
        // nonce, attributes, hmac
        body.put_slice(&[0, 0, 0, 0, 0]);
    } else {
        body.put_slice(params);
    }

    let mut out = BytesMut::new();
    out.put_u16(if sessions { 0x8002 } else { 0x8001 });
    out.put_u32((10 + body.len()) as u32);
    out.put_u32(0);
    out.put_slice(&body);
    out.to_vec()
}

fn error(code: u32) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u16(0x8001);
    out.put_u32(10);
    out.put_u32(code);
    out.to_vec()
}
