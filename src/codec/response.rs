//! Response frame decoding.
//!
//! ```text
//! +--------+---------+--------------+-----------+--------------------------+------------+
//! | Tag    | Size    | ResponseCode | Handles   | parameterSize (0x8002)   | Parameters |
//! | 2 bytes| 4 bytes | 4 bytes      | 4 bytes*N | 4 bytes                  | variable   |
//! +--------+---------+--------------+-----------+--------------------------+------------+
//! ```
//!
//! The parameter block is everything after the parameterSize field; the
//! session trailer (if any) therefore stays inside it and is available
//! through [`ResponseFrame::trailer`].

use bytes::Bytes;

use super::command::Tag;
use super::marshal::Unmarshal;
use crate::core::CodecError;
use crate::core::constants::{
    LATENCY_RECORD_SIZE, MAX_RESPONSE_SIZE, TPM_HANDLE_SIZE, TPM_HEADER_SIZE,
    TPM_PARAMETER_SIZE_FIELD, TPM_RC_SUCCESS,
};

/// The fixed 10-byte response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Frame tag.
    pub tag: Tag,
    /// Declared total size, header included.
    pub size: u32,
    /// Response code.
    pub code: u32,
}

impl ResponseHeader {
    /// Parse the first 10 bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Unmarshal::new(data, "response header");
        let raw_tag = r.u16()?;
        let size = r.u32()?;
        let code = r.u32()?;

        let tag = Tag::from_u16(raw_tag).ok_or(CodecError::UnknownTag(raw_tag))?;
        if (size as usize) < TPM_HEADER_SIZE {
            return Err(CodecError::SizeBelowHeader(size));
        }
        if size > MAX_RESPONSE_SIZE {
            return Err(CodecError::SizeAboveMaximum {
                size,
                max: MAX_RESPONSE_SIZE,
            });
        }
        Ok(Self { tag, size, code })
    }

    /// Bytes that follow the header.
    pub fn body_len(&self) -> usize {
        self.size as usize - TPM_HEADER_SIZE
    }

    /// Whether the response code is success.
    pub fn is_success(&self) -> bool {
        self.code == TPM_RC_SUCCESS
    }
}

/// A decoded, successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    raw: Bytes,
    header: ResponseHeader,
    handles: Vec<u32>,
    parameter_size: Option<u32>,
    parameters_offset: usize,
}

impl ResponseFrame {
    /// Decode a complete response expecting `handle_count` output handles.
    ///
    /// Fails if the declared size differs from `raw.len()`, if the response
    /// code is nonzero, or if any field is truncated.
    pub fn decode(raw: Bytes, handle_count: usize) -> Result<Self, CodecError> {
        let header = ResponseHeader::parse(&raw)?;
        if header.size as usize != raw.len() {
            return Err(CodecError::SizeMismatch {
                declared: header.size,
                actual: raw.len(),
            });
        }
        if !header.is_success() {
            return Err(CodecError::ResponseCode(header.code));
        }

        let mut r = Unmarshal::new(&raw, "response");
        r.skip(TPM_HEADER_SIZE)?;

        let mut handles = Vec::with_capacity(handle_count);
        for _ in 0..handle_count {
            handles.push(r.u32()?);
        }

        let parameter_size = if header.tag.has_sessions() {
            let declared = r.u32()?;
            if declared as usize > r.remaining() {
                return Err(CodecError::ParameterSizeOverflow {
                    declared,
                    available: r.remaining(),
                });
            }
            Some(declared)
        } else {
            None
        };

        let parameters_offset = r.position();
        debug_assert_eq!(
            header.size as usize,
            TPM_HEADER_SIZE
                + TPM_HANDLE_SIZE * handle_count
                + parameter_size.map_or(0, |_| TPM_PARAMETER_SIZE_FIELD)
                + (raw.len() - parameters_offset)
        );

        Ok(Self {
            raw,
            header,
            handles,
            parameter_size,
            parameters_offset,
        })
    }

    /// The header.
    pub fn header(&self) -> &ResponseHeader {
        &self.header
    }

    /// All output handles.
    pub fn handles(&self) -> &[u32] {
        &self.handles
    }

    /// Output handle `index`, if present.
    pub fn handle(&self, index: usize) -> Option<u32> {
        self.handles.get(index).copied()
    }

    /// The parameterSize field (session responses only).
    pub fn parameter_size(&self) -> Option<u32> {
        self.parameter_size
    }

    /// Parameter block: everything after handles and parameterSize.
    pub fn parameters(&self) -> &[u8] {
        &self.raw[self.parameters_offset..]
    }

    /// Parameters bounded by parameterSize when the response declares one.
    pub fn declared_parameters(&self) -> &[u8] {
        let params = self.parameters();
        match self.parameter_size {
            Some(size) => &params[..size as usize],
            None => params,
        }
    }

    /// Bytes after the declared parameters (the session trailer).
    pub fn trailer(&self) -> &[u8] {
        &self.parameters()[self.declared_parameters().len()..]
    }

    /// The complete frame as received.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// Read the first output handle from a raw response (`[10..14]`, big-endian).
pub fn extract_first_handle(raw: &[u8]) -> Result<u32, CodecError> {
    let mut r = Unmarshal::new(raw, "response handle");
    r.skip(TPM_HEADER_SIZE)?;
    r.u32()
}

/// Cycle counter the peer sends ahead of a response in latency mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LatencyRecord {
    /// Cycles spent executing the command.
    pub cycles: u64,
}

impl LatencyRecord {
    /// Parse an 8-byte big-endian record.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Unmarshal::new(data, "latency record");
        let cycles = r.u64()?;
        Ok(Self { cycles })
    }

    /// Encoded form.
    pub fn to_bytes(self) -> [u8; LATENCY_RECORD_SIZE] {
        self.cycles.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hex_str: &str) -> Bytes {
        Bytes::from(hex::decode(hex_str).unwrap())
    }

    #[test]
    fn test_header_parse() {
        let header = ResponseHeader::parse(&hex::decode("80010000000A00000000").unwrap()).unwrap();
        assert_eq!(header.tag, Tag::NoSessions);
        assert_eq!(header.size, 10);
        assert_eq!(header.body_len(), 0);
        assert!(header.is_success());
    }

    #[test]
    fn test_header_size_below_minimum() {
        let err = ResponseHeader::parse(&hex::decode("80010000000900000000").unwrap()).unwrap_err();
        assert_eq!(err, CodecError::SizeBelowHeader(9));
    }

    #[test]
    fn test_header_size_above_device_buffer() {
        let header = ResponseHeader::parse(&hex::decode("80010000100000000000").unwrap()).unwrap();
        assert_eq!(header.body_len(), 4086);

        let err = ResponseHeader::parse(&hex::decode("80010000100100000000").unwrap()).unwrap_err();
        assert_eq!(err, CodecError::SizeAboveMaximum { size: 4097, max: 4096 });

        let err = ResponseHeader::parse(&hex::decode("8001FFFFFFFF00000000").unwrap()).unwrap_err();
        assert!(matches!(err, CodecError::SizeAboveMaximum { .. }));
    }

    #[test]
    fn test_header_unknown_tag() {
        let err = ResponseHeader::parse(&hex::decode("00C40000000A00000000").unwrap()).unwrap_err();
        assert_eq!(err, CodecError::UnknownTag(0x00C4));
    }

    #[test]
    fn test_decode_no_sessions() {
        let raw = frame("80010000000E000000000002ABCD");
        let rsp = ResponseFrame::decode(raw, 0).unwrap();
        assert_eq!(rsp.parameters(), &[0x00, 0x02, 0xAB, 0xCD]);
        assert_eq!(rsp.parameter_size(), None);
        assert_eq!(rsp.declared_parameters(), rsp.parameters());
        assert!(rsp.trailer().is_empty());
    }

    #[test]
    fn test_decode_sessions_with_handle() {
        // handle 0x80000001, parameterSize 2, params AAAA, trailer 0000 01 0000
        let raw = frame("80020000001D000000008000000100000002AAAA00000100000000");
        let err = ResponseFrame::decode(raw, 1).unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { .. }));

        let raw = frame("80020000001A000000008000000100000002AAAA000001000000");
        let rsp = ResponseFrame::decode(raw, 1).unwrap();
        assert_eq!(rsp.handle(0), Some(0x8000_0001));
        assert_eq!(rsp.handle(1), None);
        assert_eq!(rsp.parameter_size(), Some(2));
        assert_eq!(rsp.declared_parameters(), &[0xAA, 0xAA]);
        assert_eq!(rsp.trailer(), &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_nonzero_code() {
        let raw = frame("80010000000A00000101");
        assert_eq!(
            ResponseFrame::decode(raw, 0).unwrap_err(),
            CodecError::ResponseCode(0x101)
        );
    }

    #[test]
    fn test_decode_parameter_size_overflow() {
        let raw = frame("800200000010000000000000000501");
        let raw = Bytes::from([&raw[..], &[0x02][..]].concat());
        let err = ResponseFrame::decode(raw, 0).unwrap_err();
        assert_eq!(
            err,
            CodecError::ParameterSizeOverflow {
                declared: 5,
                available: 2
            }
        );
    }

    #[test]
    fn test_decode_missing_handle() {
        let raw = frame("80010000000C000000008000");
        let err = ResponseFrame::decode(raw, 1).unwrap_err();
        assert!(matches!(err, CodecError::TooShort { expected: 14, .. }));
    }

    #[test]
    fn test_extract_first_handle() {
        let raw = hex::decode("80010000000E0000000080000002").unwrap();
        assert_eq!(extract_first_handle(&raw).unwrap(), 0x8000_0002);

        let short = hex::decode("80010000000D00000000800000").unwrap();
        assert!(extract_first_handle(&short).is_err());
    }

    #[test]
    fn test_latency_record() {
        let record = LatencyRecord::parse(&hex::decode("0000000000012345").unwrap()).unwrap();
        assert_eq!(record.cycles, 0x12345);
        assert_eq!(record.to_bytes().to_vec(), hex::decode("0000000000012345").unwrap());
        assert!(LatencyRecord::parse(&[0u8; 7]).is_err());
    }
}
