//! Control-byte flow control.
//!
//! - [`ControlByte`]: SYNC / READY / START / ACK
//! - [`Transaction`]: the per-command phase machine
//! - [`ChunkedTransfer`]: fixed-size groups with one ACK each
//! - [`Listener`] with [`Trigger`] rules, [`basic_handshake`] and [`listen`]
//!   for inspection

mod chunked;
mod control;
mod listener;
mod transaction;

pub use chunked::{ChunkedTransfer, TransferReport, receive_in_chunks, send_in_chunks};
pub use control::ControlByte;
pub use listener::{
    DEFAULT_WINDOW_LIMIT, ListenReport, Listener, Trigger, TriggerMatch, basic_handshake, listen,
    preset,
};
pub use transaction::{Transaction, TransactionPhase};
