//! Signatures and verification tickets.

use bytes::{BufMut, BytesMut};

use super::marshal::{Unmarshal, put_tpm2b};
use crate::core::CodecError;
use crate::core::constants::{TPM_ALG_DILITHIUM, TPM_ALG_NULL};

/// TPMT_SIGNATURE: `sigAlg | hashAlg | TPM2B signature`.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    /// Signature algorithm.
    pub sig_alg: u16,
    /// Hash algorithm (`TPM_ALG_NULL` for Dilithium).
    pub hash_alg: u16,
    /// Signature bytes.
    pub bytes: Vec<u8>,
}

impl Signature {
    /// A Dilithium signature over the whole message.
    pub fn dilithium(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            sig_alg: TPM_ALG_DILITHIUM,
            hash_alg: TPM_ALG_NULL,
            bytes: bytes.into(),
        }
    }

    /// Append the marshalled form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u16(self.sig_alg);
        buf.put_u16(self.hash_alg);
        put_tpm2b(buf, "signature", &self.bytes)
    }

    /// Parse from the front of a parameter block.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Unmarshal::new(data, "signature");
        let sig_alg = r.u16()?;
        let hash_alg = r.u16()?;
        let bytes = r.tpm2b()?.to_vec();
        Ok(Self {
            sig_alg,
            hash_alg,
            bytes,
        })
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signature")
            .field("sig_alg", &format_args!("0x{:04X}", self.sig_alg))
            .field("hash_alg", &format_args!("0x{:04X}", self.hash_alg))
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// TPMT_TK_VERIFIED: `tag | hierarchy | TPM2B digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTicket {
    /// Ticket structure tag.
    pub tag: u16,
    /// Hierarchy that produced the ticket.
    pub hierarchy: u32,
    /// Ticket digest.
    pub digest: Vec<u8>,
}

impl VerifiedTicket {
    /// Parse from the front of a parameter block.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Unmarshal::new(data, "verification ticket");
        let tag = r.u16()?;
        let hierarchy = r.u32()?;
        let digest = r.tpm2b()?.to_vec();
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}
