//! Connection and timing configuration.

use std::time::Duration;

use crate::core::constants::DEFAULT_ACK_TIMEOUT;
use crate::core::{LinkError, LinkResult};
use crate::transport::Endpoint;
use crate::transport::timing_constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT, DEFAULT_READY_TIMEOUT,
    DEFAULT_SYNC_PROBE_INTERVAL,
};

/// Default simulator host.
pub const DEFAULT_TCP_HOST: &str = "localhost";

/// Default simulator port.
pub const DEFAULT_TCP_PORT: u16 = 4327;

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Where the peer lives.
    pub endpoint: Endpoint,

    /// Time allowed to reach the transport.
    pub connect_timeout: Duration,

    /// Time allowed for each response wait.
    pub operation_timeout: Duration,

    /// Time allowed for the pre-command READY.
    pub ready_timeout: Duration,

    /// Send START after READY and wait this long for its ACK.
    pub ack_timeout: Duration,

    /// Confirm each command with START/ACK before writing it.
    pub start_ack: bool,

    /// SYNC spacing while waiting for READY; `None` disables probing.
    pub sync_probe: Option<Duration>,

    /// Expect a latency record ahead of every response.
    pub latency: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::tcp(DEFAULT_TCP_HOST, DEFAULT_TCP_PORT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            start_ack: false,
            sync_probe: Some(DEFAULT_SYNC_PROBE_INTERVAL),
            latency: false,
        }
    }
}

impl LinkConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::new()
    }

    /// Defaults overridden by `PETALITE_*` environment variables.
    pub fn from_env() -> LinkResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `PETALITE_*` key.
    ///
    /// `PETALITE_SERIAL_PORT` selects a serial endpoint and takes precedence
    /// over the TCP variables.
    pub fn from_lookup<F>(lookup: F) -> LinkResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = LinkConfigBuilder::new();

        if let Some(path) = lookup("PETALITE_SERIAL_PORT") {
            let baud = parse_var(&lookup, "PETALITE_BAUD_RATE")?.unwrap_or(DEFAULT_BAUD_RATE);
            builder = builder.serial(path, baud);
        } else {
            let host = lookup("PETALITE_TCP_HOST").unwrap_or_else(|| DEFAULT_TCP_HOST.to_string());
            let port = parse_var(&lookup, "PETALITE_TCP_PORT")?.unwrap_or(DEFAULT_TCP_PORT);
            builder = builder.tcp(host, port);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PETALITE_CONNECT_TIMEOUT_SECS")? {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PETALITE_OPERATION_TIMEOUT_SECS")? {
            builder = builder.operation_timeout(Duration::from_secs(secs));
        }
        if let Some(raw) = lookup("PETALITE_LATENCY") {
            builder = builder.latency(parse_flag("PETALITE_LATENCY", &raw)?);
        }
        if let Some(raw) = lookup("PETALITE_START_ACK") {
            builder = builder.start_ack(parse_flag("PETALITE_START_ACK", &raw)?);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PETALITE_ACK_TIMEOUT_SECS")? {
            builder = builder.ack_timeout(Duration::from_secs(secs));
        }

        Ok(builder.build())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> LinkResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| LinkError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_flag(key: &str, raw: &str) -> LinkResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(LinkError::Config(format!("{key}={other:?}: expected a boolean"))),
    }
}

/// Builder for [`LinkConfig`].
#[derive(Debug, Clone, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the simulator at `host:port`.
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.endpoint = Endpoint::tcp(host, port);
        self
    }

    /// Connect over a serial line.
    pub fn serial(mut self, path: impl Into<String>, baud_rate: u32) -> Self {
        self.config.endpoint = Endpoint::serial(path, baud_rate);
        self
    }

    /// Set the endpoint directly.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-response timeout.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Set the pre-command READY timeout.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Set the ACK timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Enable or disable the START/ACK step before each command.
    pub fn start_ack(mut self, enabled: bool) -> Self {
        self.config.start_ack = enabled;
        self
    }

    /// Set the SYNC probe interval, or disable probing with `None`.
    pub fn sync_probe(mut self, interval: Option<Duration>) -> Self {
        self.config.sync_probe = interval;
        self
    }

    /// Enable or disable latency records.
    pub fn latency(mut self, enabled: bool) -> Self {
        self.config.latency = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> LinkConfig {
        self.config
    }
}
