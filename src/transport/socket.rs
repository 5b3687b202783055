//! TCP backend for the simulator.

use std::io;

use tokio::net::TcpStream;

use super::link::Transport;

/// Builder for TCP transports.
#[derive(Debug, Clone)]
pub struct TcpLinkBuilder {
    nodelay: bool,
}

impl Default for TcpLinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpLinkBuilder {
    /// Create a builder with default options (Nagle disabled).
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable `TCP_NODELAY`.
    ///
    /// Control bytes are single-byte writes; with Nagle enabled they can sit
    /// in the kernel until the next write.
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Connect once to `host:port`.
    pub async fn connect(self, host: &str, port: u16) -> io::Result<Transport> {
        let stream = TcpStream::connect((host, port)).await?;
        self.from_stream(stream)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(self, stream: TcpStream) -> io::Result<Transport> {
        stream.set_nodelay(self.nodelay)?;
        let description = match stream.peer_addr() {
            Ok(addr) => format!("tcp://{addr}"),
            Err(_) => "tcp://<unknown>".to_string(),
        };
        let (read, write) = stream.into_split();
        Ok(Transport::from_halves(read, write, description))
    }
}
