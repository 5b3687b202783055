//! Command frame encoding.
//!
//! Wire format (big-endian):
//! ```text
//! +--------+---------+-------------+-----------+------------------------+------------+
//! | Tag    | Size    | CommandCode | Handles   | AuthArea (0x8002 only) | Parameters |
//! | 2 bytes| 4 bytes | 4 bytes     | 4 bytes*N | 4-byte size + entries  | variable   |
//! +--------+---------+-------------+-----------+------------------------+------------+
//! ```
//!
//! The size field is always computed from the components, never supplied.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::marshal::put_tpm2b;
use crate::core::CodecError;
use crate::core::constants::{
    TPM_HANDLE_SIZE, TPM_HEADER_SIZE, TPM_RS_PW, TPM_ST_NO_SESSIONS, TPM_ST_SESSIONS,
};

/// Frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    /// No authorization area / parameterSize field.
    NoSessions = TPM_ST_NO_SESSIONS,
    /// Authorization area (commands) and parameterSize field (responses).
    Sessions = TPM_ST_SESSIONS,
}

impl Tag {
    /// Parse a tag from its wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            TPM_ST_NO_SESSIONS => Some(Self::NoSessions),
            TPM_ST_SESSIONS => Some(Self::Sessions),
            _ => None,
        }
    }

    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this tag carries session data.
    pub fn has_sessions(self) -> bool {
        self == Self::Sessions
    }
}

/// Password-style authorization entry (`TPMS_AUTH_COMMAND` with `TPM_RS_PW`).
///
/// Zero-length nonce, zero session attributes, the password as the hmac.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PasswordAuth {
    value: Bytes,
}

impl PasswordAuth {
    /// Entry with an empty authorization value.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Entry carrying `value` as the password.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The authorization value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Encoded length: handle(4) + nonce size(2) + attributes(1) + hmac TPM2B.
    pub fn encoded_len(&self) -> usize {
        4 + 2 + 1 + 2 + self.value.len()
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u32(TPM_RS_PW);
        buf.put_u16(0);
        buf.put_u8(0);
        put_tpm2b(buf, "authorization value", &self.value)
    }
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("value_len", &self.value.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// A command frame under construction.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    code: u32,
    handles: Vec<u32>,
    auth: Vec<PasswordAuth>,
    parameters: BytesMut,
}

impl CommandFrame {
    /// Start a frame for `code`.
    pub fn new(code: u32) -> Self {
        Self {
            code,
            handles: Vec::new(),
            auth: Vec::new(),
            parameters: BytesMut::new(),
        }
    }

    /// Append an input handle.
    pub fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    /// Append an authorization entry; switches the frame to the session tag.
    pub fn auth(mut self, auth: PasswordAuth) -> Self {
        self.auth.push(auth);
        self
    }

    /// Append a u8 parameter.
    pub fn u8_param(mut self, value: u8) -> Self {
        self.parameters.put_u8(value);
        self
    }

    /// Append a u16 parameter.
    pub fn u16_param(mut self, value: u16) -> Self {
        self.parameters.put_u16(value);
        self
    }

    /// Append a u32 parameter.
    pub fn u32_param(mut self, value: u32) -> Self {
        self.parameters.put_u32(value);
        self
    }

    /// Append pre-marshalled parameter bytes.
    pub fn raw_param(mut self, bytes: &[u8]) -> Self {
        self.parameters.put_slice(bytes);
        self
    }

    /// Append a TPM2B parameter.
    pub fn tpm2b_param(mut self, what: &'static str, bytes: &[u8]) -> Result<Self, CodecError> {
        put_tpm2b(&mut self.parameters, what, bytes)?;
        Ok(self)
    }

    /// Command code.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Input handles.
    pub fn handles(&self) -> &[u32] {
        &self.handles
    }

    /// Tag implied by the presence of an authorization area.
    pub fn tag(&self) -> Tag {
        if self.auth.is_empty() {
            Tag::NoSessions
        } else {
            Tag::Sessions
        }
    }

    fn auth_area_len(&self) -> usize {
        self.auth.iter().map(PasswordAuth::encoded_len).sum()
    }

    /// Total encoded length: `10 + handles + auth area + parameters`.
    pub fn size(&self) -> usize {
        let auth = if self.auth.is_empty() {
            0
        } else {
            4 + self.auth_area_len()
        };
        TPM_HEADER_SIZE + TPM_HANDLE_SIZE * self.handles.len() + auth + self.parameters.len()
    }

    /// Serialize the frame.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let size = self.size();
        let declared = u32::try_from(size).map_err(|_| CodecError::FieldTooLong {
            what: "command frame",
            len: size,
        })?;

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16(self.tag().as_u16());
        buf.put_u32(declared);
        buf.put_u32(self.code);
        for handle in &self.handles {
            buf.put_u32(*handle);
        }
        if !self.auth.is_empty() {
            buf.put_u32(self.auth_area_len() as u32);
            for entry in &self.auth {
                entry.encode_into(&mut buf)?;
            }
        }
        buf.put_slice(&self.parameters);

        debug_assert_eq!(buf.len(), size);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{
        TPM_CC_GET_RANDOM, TPM_CC_HASH_SIGN_START, TPM_CC_SEQUENCE_UPDATE, TPM_CC_STARTUP,
    };

    fn declared_size(frame: &[u8]) -> usize {
        u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize
    }

    #[test]
    fn test_tag_roundtrip() {
        assert_eq!(Tag::from_u16(0x8001), Some(Tag::NoSessions));
        assert_eq!(Tag::from_u16(0x8002), Some(Tag::Sessions));
        assert_eq!(Tag::from_u16(0x00C1), None);
        assert!(Tag::Sessions.has_sessions());
    }

    #[test]
    fn test_startup_frame() {
        let frame = CommandFrame::new(TPM_CC_STARTUP).u16_param(0).encode().unwrap();
        assert_eq!(hex::encode_upper(&frame), "80010000000C000001440000");
    }

    #[test]
    fn test_get_random_frame() {
        let frame = CommandFrame::new(TPM_CC_GET_RANDOM)
            .u16_param(32)
            .encode()
            .unwrap();
        assert_eq!(hex::encode_upper(&frame), "80010000000C0000017B0020");
    }

    #[test]
    fn test_session_frame_layout() {
        let frame = CommandFrame::new(TPM_CC_HASH_SIGN_START)
            .handle(0x8000_0000)
            .auth(PasswordAuth::new(&b"abcd"[..]))
            .u32_param(640)
            .encode()
            .unwrap();

        let expected = concat!(
            "8002",
            "00000023",
            "200001A0",
            "80000000",
            "0000000D",
            "40000009",
            "0000",
            "00",
            "000461626364",
            "00000280",
        );
        assert_eq!(hex::encode_upper(&frame), expected);
        assert_eq!(declared_size(&frame), frame.len());
    }

    #[test]
    fn test_size_field_matches_length() {
        for len in [0usize, 1, 63, 64, 256, 1000] {
            let chunk = vec![0x5A; len];
            let frame = CommandFrame::new(TPM_CC_SEQUENCE_UPDATE)
                .handle(0x8000_0001)
                .auth(PasswordAuth::empty())
                .tpm2b_param("buffer", &chunk)
                .unwrap();
            let size = frame.size();
            let bytes = frame.encode().unwrap();
            assert_eq!(bytes.len(), size);
            assert_eq!(declared_size(&bytes), bytes.len());
            assert_eq!(size, 10 + 4 + 4 + 9 + 2 + len);
        }
    }

    #[test]
    fn test_password_debug_redacted() {
        let auth = PasswordAuth::new(&b"secret"[..]);
        let shown = format!("{auth:?}");
        assert!(!shown.contains("secret"));
        assert!(shown.contains("REDACTED"));
    }
}
