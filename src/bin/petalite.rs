//! Command-line driver for a Petalite TPM peer.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use rand::RngCore;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use petalite_host::client::{LinkConfig, TpmClient};
use petalite_host::codec::{PrimaryTemplate, PublicKey, StartupType};
use petalite_host::core::constants::DEFAULT_UPDATE_CHUNK_SIZE;
use petalite_host::handshake::{
    DEFAULT_WINDOW_LIMIT, Listener, Trigger, basic_handshake, preset,
};
use petalite_host::transport::Connection;

#[derive(Parser)]
#[command(name = "petalite", version, about = "Drive a Petalite TPM peer over TCP or serial")]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,

    #[command(subcommand)]
    command: Command,
}

/// Connection options; anything unset falls back to `PETALITE_*` variables.
#[derive(Args)]
struct LinkArgs {
    /// Simulator host.
    #[arg(long, global = true, conflicts_with = "serial")]
    host: Option<String>,

    /// Simulator port.
    #[arg(long, global = true, conflicts_with = "serial")]
    port: Option<u16>,

    /// Serial device path (selects the serial backend).
    #[arg(long, global = true)]
    serial: Option<String>,

    /// Serial baud rate.
    #[arg(long, global = true, default_value_t = petalite_host::client::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Seconds to keep retrying the connection.
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Seconds to wait for each response.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Expect a latency record ahead of every response.
    #[arg(long, global = true)]
    latency: bool,

    /// Wait for READY passively instead of sending SYNC probes.
    #[arg(long, global = true)]
    no_sync_probe: bool,

    /// Send START and wait for ACK before each command.
    #[arg(long, global = true)]
    start_ack: bool,

    /// Seconds to wait for each ACK.
    #[arg(long, global = true)]
    ack_timeout: Option<u64>,
}

impl LinkArgs {
    fn config(&self) -> Result<LinkConfig> {
        let base = LinkConfig::from_env().context("reading PETALITE_* environment")?;
        let mut builder = LinkConfig::builder().endpoint(base.endpoint.clone());

        if let Some(path) = &self.serial {
            builder = builder.serial(path.clone(), self.baud);
        } else if self.host.is_some() || self.port.is_some() {
            let host = self
                .host
                .clone()
                .unwrap_or_else(|| petalite_host::client::DEFAULT_TCP_HOST.to_string());
            let port = self.port.unwrap_or(petalite_host::client::DEFAULT_TCP_PORT);
            builder = builder.tcp(host, port);
        }

        builder = builder
            .connect_timeout(
                self.connect_timeout
                    .map_or(base.connect_timeout, Duration::from_secs),
            )
            .operation_timeout(self.timeout.map_or(base.operation_timeout, Duration::from_secs))
            .ack_timeout(self.ack_timeout.map_or(base.ack_timeout, Duration::from_secs))
            .start_ack(self.start_ack || base.start_ack)
            .latency(self.latency || base.latency);
        if self.no_sync_probe {
            builder = builder.sync_probe(None);
        }
        Ok(builder.build())
    }
}

#[derive(Subcommand)]
enum Command {
    /// Send TPM2_Startup.
    Startup {
        /// Resume saved state instead of clearing it.
        #[arg(long)]
        state: bool,
    },

    /// Fetch random bytes.
    Random {
        /// Number of bytes (1..=65535).
        count: usize,
    },

    /// Create a primary key under the owner hierarchy.
    CreatePrimary {
        /// Create an ECC P-256 key instead of Dilithium.
        #[arg(long)]
        ecc: bool,
    },

    /// Create a Dilithium key, sign a random message and verify it.
    SignVerify {
        /// Message length in bytes.
        #[arg(long, default_value_t = 640)]
        len: usize,

        /// Bytes per SequenceUpdate.
        #[arg(long, default_value_t = DEFAULT_UPDATE_CHUNK_SIZE)]
        chunk: usize,
    },

    /// Print whatever the peer sends, answering trigger matches.
    Listen(ListenArgs),
}

#[derive(Args)]
struct ListenArgs {
    /// Seconds to listen.
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Probe SYNC until READY and send START first.
    #[arg(long)]
    handshake: bool,

    /// Built-in trigger set (`handshake_ack`).
    #[arg(long)]
    preset: Option<String>,

    /// Trigger rule, e.g. `match=READY,send=START,once` or
    /// `match_hex=a1b2,send_hex=cc`. Repeatable.
    #[arg(long = "trigger", value_name = "RULE")]
    triggers: Vec<String>,

    /// Bytes kept in the rolling match window.
    #[arg(long, default_value_t = DEFAULT_WINDOW_LIMIT)]
    window: usize,

    /// Send hex typed on stdin; `quit` stops listening.
    #[arg(long)]
    interactive: bool,
}

impl ListenArgs {
    fn listener(&self) -> Result<Listener> {
        let mut triggers = match &self.preset {
            Some(name) => preset(name)?,
            None => Vec::new(),
        };
        for rule in &self.triggers {
            triggers.push(rule.parse::<Trigger>()?);
        }
        for trigger in &triggers {
            eprintln!("trigger {trigger}");
        }

        let mut listener = Listener::new(triggers).with_window_limit(self.window);
        if self.interactive {
            listener = listener.with_manual_input(stdin_hex());
        }
        Ok(listener)
    }
}

/// Hex lines from stdin, read on a plain thread so a pending read never
/// holds up runtime shutdown.
fn stdin_hex() -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
                break;
            }
            match hex::decode(line.replace(' ', "")) {
                Ok(payload) => {
                    if tx.blocking_send(Bytes::from(payload)).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("invalid hex {line:?}: {e}"),
            }
        }
    });
    rx
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        let config = self.link.config()?;

        match self.command {
            Command::Listen(args) => run_listen(&config, &args).await,
            command => {
                let mut tpm = TpmClient::connect(config)
                    .await
                    .context("connecting to the peer")?;
                let result = run_client(&mut tpm, command).await;
                tpm.close().await;
                result
            }
        }
    }
}

async fn run_client(tpm: &mut TpmClient, command: Command) -> Result<()> {
    match command {
        Command::Startup { state } => {
            let startup_type = if state {
                StartupType::State
            } else {
                StartupType::Clear
            };
            let response = tpm.startup(startup_type).await?;
            println!("{}", hex::encode_upper(response.raw()));
        }
        Command::Random { count } => {
            let random = tpm.get_random(count).await?;
            println!("{}", hex::encode_upper(&random));
        }
        Command::CreatePrimary { ecc } => {
            let template = if ecc {
                PrimaryTemplate::Ecc
            } else {
                PrimaryTemplate::Dilithium
            };
            let key = tpm.create_primary(template).await?;
            println!("handle     0x{:08X}", key.handle);
            match &key.public.key {
                PublicKey::Ecc { x, y } => {
                    println!("x          {}", hex::encode_upper(x));
                    println!("y          {}", hex::encode_upper(y));
                }
                PublicKey::Dilithium { public_key } => {
                    println!("public key {}", hex::encode_upper(public_key));
                }
                PublicKey::Unknown { algorithm, raw } => {
                    println!("type       0x{algorithm:04X}");
                    println!("public     {}", hex::encode_upper(raw));
                }
            }
        }
        Command::SignVerify { len, chunk } => {
            let mut message = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut message);

            let key = tpm.create_primary(PrimaryTemplate::Dilithium).await?;
            let signature = tpm.sign(key.handle, &message, chunk).await?;
            println!("signature  {} bytes", signature.bytes.len());
            let ticket = tpm.verify(key.handle, &message, &signature, chunk).await?;
            println!(
                "ticket     tag 0x{:04X} hierarchy 0x{:08X} digest {}",
                ticket.tag,
                ticket.hierarchy,
                hex::encode_upper(&ticket.digest)
            );
        }
        Command::Listen(_) => anyhow::bail!("listen runs without a client"),
    }
    if let Some(cycles) = tpm.last_latency_cycles() {
        println!("latency    {cycles} cycles");
    }
    Ok(())
}

async fn run_listen(config: &LinkConfig, args: &ListenArgs) -> Result<()> {
    let mut listener = args.listener()?;
    let mut conn = Connection::open(&config.endpoint, config.connect_timeout)
        .await
        .context("connecting to the peer")?;
    let result = async {
        if args.handshake {
            let probe = config
                .sync_probe
                .unwrap_or(petalite_host::transport::timing_constants::DEFAULT_SYNC_PROBE_INTERVAL);
            basic_handshake(&mut conn, config.ready_timeout, probe).await?;
        }
        let report = listener
            .run(&mut conn, Duration::from_secs(args.duration), |data| {
                println!("{}", hex::encode_upper(data));
            })
            .await?;
        eprintln!("{} bytes received, {} payloads sent", report.bytes, report.sent);
        Ok::<_, anyhow::Error>(())
    }
    .await;
    conn.close().await;
    result
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("PETALITE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("petalite: {e:#}");
        std::process::exit(1);
    }
}
