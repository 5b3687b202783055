//! Client façade: one call per TPM operation.

#[allow(clippy::module_inception)]
mod client;
mod config;
mod events;
mod sequence;

pub use client::{PrimaryKey, TpmClient};
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_TCP_HOST, DEFAULT_TCP_PORT, LinkConfig, LinkConfigBuilder,
};
pub use events::{ClientEvent, EVENT_CHANNEL_CAPACITY};
pub use sequence::{SignSequence, VerifySequence};
