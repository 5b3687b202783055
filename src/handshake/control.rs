//! Out-of-band control bytes.

use std::fmt;

use crate::core::LinkError;
use crate::core::constants::{ACK_BYTE, READY_BYTE, START_BYTE, SYNC_BYTE};

/// Single-byte flow-control markers exchanged outside TPM framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlByte {
    /// Host polling for readiness.
    Sync = SYNC_BYTE,
    /// Peer is idle and ready.
    Ready = READY_BYTE,
    /// Host begins a transaction.
    Start = START_BYTE,
    /// One group or step acknowledged.
    Ack = ACK_BYTE,
}

impl ControlByte {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire value.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            SYNC_BYTE => Some(Self::Sync),
            READY_BYTE => Some(Self::Ready),
            START_BYTE => Some(Self::Start),
            ACK_BYTE => Some(Self::Ack),
            _ => None,
        }
    }

    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Ready => "READY",
            Self::Start => "START",
            Self::Ack => "ACK",
        }
    }
}

impl fmt::Display for ControlByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.as_u8())
    }
}

impl std::str::FromStr for ControlByte {
    type Err = LinkError;

    /// Parse a keyword such as `READY`, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SYNC" => Ok(Self::Sync),
            "READY" => Ok(Self::Ready),
            "START" => Ok(Self::Start),
            "ACK" => Ok(Self::Ack),
            other => Err(LinkError::Config(format!("unknown control byte {other:?}"))),
        }
    }
}

impl From<ControlByte> for u8 {
    fn from(byte: ControlByte) -> u8 {
        byte.as_u8()
    }
}
