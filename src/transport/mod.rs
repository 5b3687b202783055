//! Transport layer.
//!
//! Moves bytes between the host and the peer:
//!
//! - **Backends**: [`Transport`] over TCP ([`TcpLinkBuilder`]), serial lines
//!   (feature `serial`) or any in-memory duplex stream
//! - **I/O engine**: [`IoEngine`] reader/writer tasks feeding an inbox of
//!   [`Chunk`]s and draining an outbox
//! - **Connection**: [`Connection`] with byte scans, exact reads and the
//!   pushback buffer
//! - **Timing**: [`Deadline`] and [`Probe`] schedules
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Client / Handshake               │
//! ├─────────────────────────────────────────┤
//! │   Connection (pushback, scans, reads)   │  ← This module
//! │   inbox ▲                 ▼ outbox      │
//! │   reader task        writer task        │
//! ├─────────────────────────────────────────┤
//! │        TCP  /  serial  /  pipe          │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod engine;
mod link;
mod pushback;
#[cfg(feature = "serial")]
mod serial;
mod socket;
mod timing;

pub use connection::{Connection, ConnectionPhase};
pub use engine::{Chunk, ChunkKind, EngineChannels, IoEngine};
pub use link::{Endpoint, Transport, TransportReader, TransportWriter};
pub use pushback::PushbackBuffer;
#[cfg(feature = "serial")]
pub use serial::open_serial;
pub use socket::TcpLinkBuilder;
pub use timing::{Deadline, Probe, constants as timing_constants};
