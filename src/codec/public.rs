//! Public areas: the templates sent with CreatePrimary and the `outPublic`
//! blob it returns.

use bytes::{BufMut, Bytes, BytesMut};

use super::marshal::{Unmarshal, put_tpm2b};
use crate::core::CodecError;
use crate::core::constants::{
    DEFAULT_OBJECT_ATTRIBUTES, TPM_ALG_DILITHIUM, TPM_ALG_ECC, TPM_ALG_ECDSA, TPM_ALG_NULL,
    TPM_ALG_SHA256, TPM_ECC_NIST_P256,
};

/// Dilithium security level used by the firmware template.
pub const DILITHIUM_SECURITY_LEVEL: u8 = 2;

/// Key type requested from CreatePrimary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimaryTemplate {
    /// NIST P-256 signing key, ECDSA with SHA-256.
    Ecc,
    /// Dilithium signing key, security level 2.
    #[default]
    Dilithium,
}

impl PrimaryTemplate {
    /// Algorithm id of the template's `type` field.
    pub fn algorithm(self) -> u16 {
        match self {
            Self::Ecc => TPM_ALG_ECC,
            Self::Dilithium => TPM_ALG_DILITHIUM,
        }
    }

    /// Marshalled TPMT_PUBLIC (without the outer TPM2B size).
    pub fn public_area(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u16(self.algorithm());
        buf.put_u16(TPM_ALG_SHA256);
        buf.put_u32(DEFAULT_OBJECT_ATTRIBUTES);
        buf.put_u16(0); // authPolicy
        match self {
            Self::Ecc => {
                buf.put_u16(TPM_ALG_NULL); // symmetric
                buf.put_u16(TPM_ALG_ECDSA);
                buf.put_u16(TPM_ALG_SHA256);
                buf.put_u16(TPM_ECC_NIST_P256);
                buf.put_u16(TPM_ALG_NULL); // kdf
                buf.put_u16(0); // unique.x
                buf.put_u16(0); // unique.y
            }
            Self::Dilithium => {
                buf.put_u16(TPM_ALG_NULL); // symmetric
                buf.put_u16(TPM_ALG_NULL); // scheme
                buf.put_u8(DILITHIUM_SECURITY_LEVEL);
                buf.put_u16(TPM_ALG_SHA256);
                buf.put_u16(0); // unique
            }
        }
        buf.freeze()
    }
}

/// Key material carried in a public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// ECC point.
    Ecc {
        /// X coordinate.
        x: Vec<u8>,
        /// Y coordinate.
        y: Vec<u8>,
    },
    /// Dilithium public key.
    Dilithium {
        /// Encoded public key.
        public_key: Vec<u8>,
    },
    /// Any other algorithm; the whole TPMT_PUBLIC is kept.
    Unknown {
        /// The `type` field.
        algorithm: u16,
        /// Raw TPMT_PUBLIC bytes.
        raw: Vec<u8>,
    },
}

/// Parsed `outPublic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicArea {
    /// Name algorithm.
    pub name_alg: u16,
    /// Object attributes.
    pub object_attributes: u32,
    /// Key material.
    pub key: PublicKey,
}

impl PublicArea {
    /// Parse a TPM2B_PUBLIC from the front of `data`.
    ///
    /// Bytes after the TPM2B (creation data, name) are ignored.
    pub fn parse_tpm2b(data: &[u8]) -> Result<Self, CodecError> {
        let mut outer = Unmarshal::new(data, "outPublic");
        let body = outer.tpm2b()?;
        Self::parse(body)
    }

    /// Parse a bare TPMT_PUBLIC.
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Unmarshal::new(body, "public area");
        let algorithm = r.u16()?;
        let name_alg = r.u16()?;
        let object_attributes = r.u32()?;
        r.tpm2b()?; // authPolicy

        let key = match algorithm {
            TPM_ALG_ECC => {
                // symmetric, scheme, scheme hash, curve, kdf
                r.skip(10)?;
                let x = r.tpm2b()?.to_vec();
                let y = r.tpm2b()?.to_vec();
                PublicKey::Ecc { x, y }
            }
            TPM_ALG_DILITHIUM => {
                // symmetric, scheme, security level, nameHashAlg
                r.skip(7)?;
                let public_key = r.tpm2b()?.to_vec();
                PublicKey::Dilithium { public_key }
            }
            other => PublicKey::Unknown {
                algorithm: other,
                raw: body.to_vec(),
            },
        };

        Ok(Self {
            name_alg,
            object_attributes,
            key,
        })
    }
}

/// Marshal a TPM2B_SENSITIVE_CREATE carrying `user_auth` and no data.
pub fn sensitive_create(user_auth: &[u8]) -> Result<Bytes, CodecError> {
    let mut inner = BytesMut::new();
    put_tpm2b(&mut inner, "userAuth", user_auth)?;
    put_tpm2b(&mut inner, "sensitive data", &[])?;

    let mut buf = BytesMut::with_capacity(inner.len() + 2);
    put_tpm2b(&mut buf, "inSensitive", &inner)?;
    Ok(buf.freeze())
}
