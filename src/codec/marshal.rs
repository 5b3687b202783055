//! Big-endian marshalling primitives.
//!
//! TPM structures are "MSB first". [`Unmarshal`] is a bounds-checked cursor:
//! every read reports truncation as [`CodecError::TooShort`] naming the
//! structure being parsed, so a short peer response never panics.

use bytes::{BufMut, BytesMut};

use crate::core::CodecError;

/// Append a TPM2B (u16 length + bytes).
pub fn put_tpm2b(buf: &mut BytesMut, what: &'static str, data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).map_err(|_| CodecError::FieldTooLong {
        what,
        len: data.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Bounds-checked big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Unmarshal<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Unmarshal<'a> {
    /// Start reading `data`; `what` names the structure in errors.
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    /// Current offset from the start of the slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Take the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(CodecError::TooShort {
                what: self.what,
                expected: self.pos.saturating_add(n),
                actual: self.data.len(),
            }),
        }
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.bytes(n).map(|_| ())
    }

    /// Read a u8.
    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    /// Read a big-endian u16.
    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32.
    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian u64.
    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read a TPM2B and return its contents.
    pub fn tpm2b(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_tpm2b() {
        let mut buf = BytesMut::new();
        put_tpm2b(&mut buf, "auth", b"abcd").unwrap();
        assert_eq!(&buf[..], &hex::decode("000461626364").unwrap()[..]);
    }

    #[test]
    fn test_put_tpm2b_too_long() {
        let mut buf = BytesMut::new();
        let big = vec![0u8; 0x1_0000];
        assert_eq!(
            put_tpm2b(&mut buf, "buffer", &big),
            Err(CodecError::FieldTooLong {
                what: "buffer",
                len: 0x1_0000
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unmarshal_fields() {
        let data = hex::decode("0072000B000404720003AABBCC").unwrap();
        let mut r = Unmarshal::new(&data, "public");
        assert_eq!(r.u16().unwrap(), 0x0072);
        assert_eq!(r.u16().unwrap(), 0x000B);
        assert_eq!(r.u32().unwrap(), 0x0004_0472);
        assert_eq!(r.tpm2b().unwrap(), &[0xAA, 0xBB, 0xCC]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_unmarshal_truncated() {
        let data = [0x00, 0x05, 0x01];
        let mut r = Unmarshal::new(&data, "digest");
        let err = r.tpm2b().unwrap_err();
        assert_eq!(
            err,
            CodecError::TooShort {
                what: "digest",
                expected: 7,
                actual: 3
            }
        );
    }
}
