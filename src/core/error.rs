//! Error types for the Petalite host driver.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while encoding commands or decoding responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the structure needs.
    #[error("{what} too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Structure being parsed.
        what: &'static str,
        /// Minimum length required.
        expected: usize,
        /// Length available.
        actual: usize,
    },

    /// Declared frame size below the 10-byte header.
    #[error("invalid response size {0} (smaller than the header)")]
    SizeBelowHeader(u32),

    /// Declared frame size beyond what the device can produce.
    #[error("invalid response size {size} (device maximum is {max})")]
    SizeAboveMaximum {
        /// Declared size.
        size: u32,
        /// Largest accepted size.
        max: u32,
    },

    /// Declared frame size does not match the bytes received.
    #[error("declared size {declared} does not match {actual} received bytes")]
    SizeMismatch {
        /// Size field of the frame.
        declared: u32,
        /// Bytes actually present.
        actual: usize,
    },

    /// parameterSize points past the end of the frame.
    #[error("parameterSize {declared} exceeds the {available} bytes left in the frame")]
    ParameterSizeOverflow {
        /// parameterSize field.
        declared: u32,
        /// Bytes after the field.
        available: usize,
    },

    /// Unknown structure tag.
    #[error("unknown tag 0x{0:04X}")]
    UnknownTag(u16),

    /// The peer reported a nonzero response code.
    #[error("response code 0x{0:08X}")]
    ResponseCode(u32),

    /// A length-prefixed field would not fit its u16 prefix.
    #[error("{what} of {len} bytes does not fit a 16-bit length prefix")]
    FieldTooLong {
        /// Field being encoded.
        what: &'static str,
        /// Length requested.
        len: usize,
    },
}

impl CodecError {
    /// The response code carried by this error, if the peer reported one.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            CodecError::ResponseCode(code) => Some(*code),
            _ => None,
        }
    }
}

/// Errors raised by the transport, handshake and client layers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The transport never became reachable.
    #[error("could not connect to {target} within {waited:?}")]
    ConnectTimeout {
        /// Endpoint description.
        target: String,
        /// Time spent retrying.
        waited: Duration,
    },

    /// No READY/ACK (or other awaited marker) within the deadline.
    #[error("timed out after {waited:?} waiting for {expected}")]
    HandshakeTimeout {
        /// What the wait was looking for.
        expected: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// Fewer bytes than required arrived before the deadline.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes that did arrive (returned to the pushback buffer).
        received: usize,
    },

    /// The response did not decode or reported failure.
    #[error("malformed {operation} response: {source}")]
    MalformedResponse {
        /// Operation whose response failed.
        operation: &'static str,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },

    /// A command could not be encoded.
    #[error("cannot encode {operation} command: {source}")]
    Encode {
        /// Operation being encoded.
        operation: &'static str,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },

    /// A multi-step flow was driven out of order or with a stale handle.
    #[error("sequence error: {0}")]
    SequenceError(String),

    /// The reader task reported a transport failure.
    #[error("reader failed: {0}")]
    ReaderFailed(String),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// A chunked transfer stopped at a group.
    #[error("group {index} of {groups} failed after {received} bytes: {source}")]
    GroupFailed {
        /// Zero-based index of the failing group.
        index: usize,
        /// Total number of groups.
        groups: usize,
        /// Payload bytes transferred before the failure.
        received: usize,
        /// Cause.
        #[source]
        source: Box<LinkError>,
    },

    /// A multi-step operation stopped at a named step.
    #[error("step `{step}` failed: {source}")]
    StepFailed {
        /// Step description (e.g. `update 3`).
        step: String,
        /// Cause.
        #[source]
        source: Box<LinkError>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Attach the operation name to a codec failure.
    pub fn malformed(operation: &'static str, source: CodecError) -> Self {
        LinkError::MalformedResponse { operation, source }
    }

    /// Wrap this error as the failure of a named step.
    pub fn at_step(self, step: impl Into<String>) -> Self {
        LinkError::StepFailed {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Check if this error is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        match self {
            LinkError::ConnectTimeout { .. }
            | LinkError::HandshakeTimeout { .. }
            | LinkError::ShortRead { .. } => true,
            LinkError::GroupFailed { source, .. } | LinkError::StepFailed { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }

    /// Check if this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            LinkError::ReaderFailed(_) | LinkError::Closed | LinkError::Io(_) => true,
            LinkError::GroupFailed { source, .. } | LinkError::StepFailed { source, .. } => {
                source.is_fatal()
            }
            _ => false,
        }
    }

    /// The TPM response code behind this error, if any.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            LinkError::MalformedResponse { source, .. } => source.response_code(),
            LinkError::GroupFailed { source, .. } | LinkError::StepFailed { source, .. } => {
                source.response_code()
            }
            _ => None,
        }
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
