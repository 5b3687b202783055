//! # Petalite host driver
//!
//! Host-side driver for a TPM-like security module reached over an
//! unreliable byte stream: the simulator over TCP, or silicon over a serial
//! line. It provides:
//!
//! - **Transport**: background reader/writer tasks, chunked inbox, pushback
//! - **Flow control**: the SYNC / READY / START / ACK control-byte protocol
//! - **Bulk transfer**: fixed-size groups acknowledged one at a time
//! - **Codec**: TPM2-style command frames and bounds-checked response parsing
//! - **Client**: one call per operation, plus chunked sign/verify flows
//!
//! ## Feature Flags
//!
//! - `transport` (default): tokio I/O engine, connection, TCP backend
//! - `serial` (default): serial backend via `tokio-serial`
//! - `handshake` (default): control bytes, transactions, chunked transfer
//! - `client` (default): [`client::TpmClient`] and its configuration
//! - `cli` (default): the `petalite` binary
//!
//! ## Modules
//!
//! - [`core`]: constants and error types (always included)
//! - [`codec`]: command/response framing (always included)
//! - [`transport`]: byte channel (requires `transport` feature)
//! - [`handshake`]: flow control (requires `handshake` feature)
//! - [`client`]: client façade (requires `client` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use petalite_host::prelude::*;
//!
//! # async fn run() -> LinkResult<()> {
//! let config = LinkConfig::builder().tcp("localhost", 4327).latency(true).build();
//! let mut tpm = TpmClient::connect(config).await?;
//!
//! tpm.startup(StartupType::Clear).await?;
//! let random = tpm.get_random(32).await?;
//! assert_eq!(random.len(), 32);
//!
//! let key = tpm.create_primary(PrimaryTemplate::Dilithium).await?;
//! let message = b"attested payload";
//! let signature = tpm.sign(key.handle, message, 256).await?;
//! let ticket = tpm.verify(key.handle, message, &signature, 256).await?;
//! println!("ticket hierarchy 0x{:08X}", ticket.hierarchy);
//!
//! tpm.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Command codec (always included)
pub mod codec;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Flow control (feature-gated)
#[cfg(feature = "handshake")]
#[cfg_attr(docsrs, doc(cfg(feature = "handshake")))]
pub mod handshake;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    // Errors and codec types
    pub use crate::codec::{
        Operation, PrimaryTemplate, PublicArea, PublicKey, ResponseFrame, Signature, StartupType,
        VerifiedTicket,
    };
    pub use crate::core::{CodecError, LinkError, LinkResult};

    #[cfg(feature = "transport")]
    pub use crate::transport::{Connection, ConnectionPhase, Endpoint};

    #[cfg(feature = "handshake")]
    pub use crate::handshake::{
        ChunkedTransfer, ControlByte, Listener, Transaction, TransferReport, Trigger,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{
        ClientEvent, LinkConfig, LinkConfigBuilder, PrimaryKey, SignSequence, TpmClient,
        VerifySequence,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{CodecError, LinkError, LinkResult};

#[cfg(feature = "transport")]
pub use transport::{Connection, Endpoint};
