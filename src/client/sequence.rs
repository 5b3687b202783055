//! Owned sign/verify sequence tokens.
//!
//! A start operation returns a token wrapping the device's sequence handle.
//! Updates borrow it mutably and finish consumes it, so a handle cannot be
//! reused once finished. Each token remembers the client that issued it and
//! that client's startup generation; presenting it anywhere else fails.

use crate::core::{LinkError, LinkResult};

#[derive(Debug, PartialEq, Eq)]
struct SequenceState {
    kind: &'static str,
    handle: u32,
    client_id: u64,
    generation: u64,
    total_len: u32,
    supplied: u32,
}

impl SequenceState {
    fn check_owner(&self, client_id: u64, generation: u64) -> LinkResult<()> {
        if self.client_id != client_id {
            return Err(LinkError::SequenceError(format!(
                "{} sequence 0x{:08X} belongs to client {}, not {client_id}",
                self.kind, self.handle, self.client_id
            )));
        }
        if self.generation != generation {
            return Err(LinkError::SequenceError(format!(
                "{} sequence 0x{:08X} predates the last startup",
                self.kind, self.handle
            )));
        }
        Ok(())
    }

    fn check_update(&self, len: usize) -> LinkResult<u32> {
        let len = u32::try_from(len).ok();
        match len.and_then(|len| self.supplied.checked_add(len)) {
            Some(next) if next <= self.total_len => Ok(next),
            _ => Err(LinkError::SequenceError(format!(
                "{} sequence 0x{:08X}: update exceeds declared length {} ({} supplied)",
                self.kind, self.handle, self.total_len, self.supplied
            ))),
        }
    }

    fn check_complete(&self) -> LinkResult<()> {
        if self.supplied != self.total_len {
            return Err(LinkError::SequenceError(format!(
                "{} sequence 0x{:08X}: finish after {} of {} bytes",
                self.kind, self.handle, self.supplied, self.total_len
            )));
        }
        Ok(())
    }
}

macro_rules! sequence_token {
    ($name:ident, $kind:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, PartialEq, Eq)]
        pub struct $name {
            state: SequenceState,
        }

        impl $name {
            pub(crate) fn new(handle: u32, client_id: u64, generation: u64, total_len: u32) -> Self {
                Self {
                    state: SequenceState {
                        kind: $kind,
                        handle,
                        client_id,
                        generation,
                        total_len,
                        supplied: 0,
                    },
                }
            }

            /// Device sequence handle.
            pub fn handle(&self) -> u32 {
                self.state.handle
            }

            /// Message length declared at start.
            pub fn total_len(&self) -> u32 {
                self.state.total_len
            }

            /// Message bytes supplied so far.
            pub fn supplied(&self) -> u32 {
                self.state.supplied
            }

            /// Message bytes still expected.
            pub fn remaining(&self) -> u32 {
                self.state.total_len - self.state.supplied
            }

            /// Check ownership and length before an update; returns the new
            /// supplied count to record once the update succeeds.
            pub(crate) fn prepare_update(
                &self,
                client_id: u64,
                generation: u64,
                len: usize,
            ) -> LinkResult<u32> {
                self.state.check_owner(client_id, generation)?;
                self.state.check_update(len)
            }

            pub(crate) fn record_update(&mut self, supplied: u32) {
                self.state.supplied = supplied;
            }

            pub(crate) fn prepare_finish(&self, client_id: u64, generation: u64) -> LinkResult<()> {
                self.state.check_owner(client_id, generation)?;
                self.state.check_complete()
            }
        }
    };
}

sequence_token!(SignSequence, "sign", "An open hash-sign sequence.");
sequence_token!(VerifySequence, "verify", "An open hash-verify sequence.");
