//! Byte-stream transports.
//!
//! A [`Transport`] is any duplex byte stream split into a reader half and a
//! writer half. Reads take a timeout and return an empty buffer when it
//! elapses; end-of-stream is an error. Writes are all-or-error.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::timing::{Deadline, constants};
use crate::core::{LinkError, LinkResult};

/// Where the peer lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Simulator reached over TCP.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// Hardware reached over a serial line.
    Serial {
        /// Device path (e.g. `/dev/ttyUSB1`).
        path: String,
        /// Baud rate.
        baud_rate: u32,
    },
}

impl Endpoint {
    /// TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Serial endpoint.
    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Self {
        Endpoint::Serial {
            path: path.into(),
            baud_rate,
        }
    }

    async fn open_once(&self) -> io::Result<Transport> {
        match self {
            Endpoint::Tcp { host, port } => super::socket::TcpLinkBuilder::new()
                .connect(host, *port)
                .await,
            #[cfg(feature = "serial")]
            Endpoint::Serial { path, baud_rate } => super::serial::open_serial(path, *baud_rate),
            #[cfg(not(feature = "serial"))]
            Endpoint::Serial { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "serial support is not compiled in",
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Serial { path, baud_rate } => write!(f, "serial://{path}@{baud_rate}"),
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader half of a transport.
pub struct TransportReader {
    inner: BoxedRead,
}

impl TransportReader {
    /// Read up to `max` bytes, waiting at most `timeout`.
    ///
    /// Returns an empty buffer if nothing arrived in time. End-of-stream is
    /// reported as `UnexpectedEof`.
    pub async fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; max];
        match tokio::time::timeout(timeout, self.inner.read(&mut buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the stream",
            )),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(e),
        }
    }
}

impl fmt::Debug for TransportReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportReader").finish_non_exhaustive()
    }
}

/// Writer half of a transport.
pub struct TransportWriter {
    inner: BoxedWrite,
}

impl TransportWriter {
    /// Write all of `data` and flush.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    /// Shut down the write direction.
    pub async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

impl fmt::Debug for TransportWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportWriter").finish_non_exhaustive()
    }
}

/// A connected byte stream.
#[derive(Debug)]
pub struct Transport {
    reader: TransportReader,
    writer: TransportWriter,
    description: String,
}

impl Transport {
    /// Wrap any duplex stream (in-memory pipes included).
    pub fn from_stream<S>(stream: S, description: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::from_halves(read, write, description)
    }

    /// Wrap separate read and write halves.
    pub fn from_halves<R, W>(read: R, write: W, description: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: TransportReader {
                inner: Box::new(read),
            },
            writer: TransportWriter {
                inner: Box::new(write),
            },
            description: description.into(),
        }
    }

    /// Connect to `endpoint`, retrying until `connect_timeout` elapses.
    ///
    /// Each failed attempt is logged and retried after
    /// [`CONNECT_RETRY_INTERVAL`](constants::CONNECT_RETRY_INTERVAL).
    pub async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> LinkResult<Self> {
        let deadline = Deadline::after(connect_timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let attempt = tokio::time::timeout(deadline.remaining(), endpoint.open_once()).await;
            match attempt {
                Ok(Ok(transport)) => {
                    debug!(%endpoint, attempts, "transport connected");
                    return Ok(transport);
                }
                Ok(Err(e)) => warn!(%endpoint, attempt = attempts, error = %e, "connect attempt failed"),
                Err(_) => warn!(%endpoint, attempt = attempts, "connect attempt timed out"),
            }

            if deadline.is_expired() {
                return Err(LinkError::ConnectTimeout {
                    target: endpoint.to_string(),
                    waited: deadline.elapsed(),
                });
            }
            tokio::time::sleep(constants::CONNECT_RETRY_INTERVAL.min(deadline.remaining())).await;
        }
    }

    /// Human-readable description of the stream.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Split into halves for the engine tasks.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}
