//! The closed set of commands the driver issues.
//!
//! Each variant knows its display name, its command code, how to build its
//! frame, and how many output handles its response carries.

use bytes::{BufMut, Bytes, BytesMut};

use super::command::{CommandFrame, PasswordAuth};
use super::marshal::put_tpm2b;
use super::public::{PrimaryTemplate, sensitive_create};
use super::signature::Signature;
use crate::core::CodecError;
use crate::core::constants::{
    TPM_CC_CREATE_PRIMARY, TPM_CC_GET_RANDOM, TPM_CC_HASH_SIGN_FINISH, TPM_CC_HASH_SIGN_START,
    TPM_CC_HASH_VERIFY_FINISH, TPM_CC_HASH_VERIFY_START, TPM_CC_SEQUENCE_UPDATE, TPM_CC_STARTUP,
    TPM_RH_OWNER, TPM_SU_CLEAR, TPM_SU_STATE,
};

/// Startup type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StartupType {
    /// TPM_SU_CLEAR.
    #[default]
    Clear,
    /// TPM_SU_STATE.
    State,
}

impl StartupType {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Clear => TPM_SU_CLEAR,
            Self::State => TPM_SU_STATE,
        }
    }
}

/// One command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// TPM2_Startup.
    Startup(StartupType),
    /// TPM2_GetRandom for `count` bytes.
    GetRandom(u16),
    /// TPM2_CreatePrimary under the owner hierarchy.
    CreatePrimary {
        /// Key type.
        template: PrimaryTemplate,
        /// Password placed in the sensitive area.
        key_password: Bytes,
    },
    /// Begin a signing sequence over `total_len` message bytes.
    HashSignStart {
        /// Signing key handle.
        key: u32,
        /// Message length announced up front.
        total_len: u32,
        /// Key authorization value.
        key_password: Bytes,
    },
    /// Feed one chunk to a sign or verify sequence.
    SequenceUpdate {
        /// Sequence handle.
        sequence: u32,
        /// Message bytes.
        chunk: Bytes,
    },
    /// Complete a signing sequence.
    HashSignFinish {
        /// Sequence handle.
        sequence: u32,
    },
    /// Begin a verification sequence.
    HashVerifyStart {
        /// Verification key handle.
        key: u32,
        /// Message length announced up front.
        total_len: u32,
        /// Signature to check.
        signature: Signature,
    },
    /// Complete a verification sequence.
    HashVerifyFinish {
        /// Sequence handle.
        sequence: u32,
    },
}

impl Operation {
    /// Display name used in logs, events and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Startup(_) => "Startup",
            Operation::GetRandom(_) => "GetRandom",
            Operation::CreatePrimary { .. } => "CreatePrimary",
            Operation::HashSignStart { .. } => "HashSignStart",
            Operation::SequenceUpdate { .. } => "SequenceUpdate",
            Operation::HashSignFinish { .. } => "HashSignFinish",
            Operation::HashVerifyStart { .. } => "HashVerifyStart",
            Operation::HashVerifyFinish { .. } => "HashVerifyFinish",
        }
    }

    /// Command code.
    pub fn code(&self) -> u32 {
        match self {
            Operation::Startup(_) => TPM_CC_STARTUP,
            Operation::GetRandom(_) => TPM_CC_GET_RANDOM,
            Operation::CreatePrimary { .. } => TPM_CC_CREATE_PRIMARY,
            Operation::HashSignStart { .. } => TPM_CC_HASH_SIGN_START,
            Operation::SequenceUpdate { .. } => TPM_CC_SEQUENCE_UPDATE,
            Operation::HashSignFinish { .. } => TPM_CC_HASH_SIGN_FINISH,
            Operation::HashVerifyStart { .. } => TPM_CC_HASH_VERIFY_START,
            Operation::HashVerifyFinish { .. } => TPM_CC_HASH_VERIFY_FINISH,
        }
    }

    /// Number of output handles in a successful response.
    pub fn response_handles(&self) -> usize {
        match self {
            Operation::CreatePrimary { .. }
            | Operation::HashSignStart { .. }
            | Operation::HashVerifyStart { .. } => 1,
            _ => 0,
        }
    }

    /// Build the command frame.
    pub fn frame(&self) -> Result<CommandFrame, CodecError> {
        let frame = CommandFrame::new(self.code());
        let frame = match self {
            Operation::Startup(kind) => frame.u16_param(kind.as_u16()),
            Operation::GetRandom(count) => frame.u16_param(*count),
            Operation::CreatePrimary {
                template,
                key_password,
            } => {
                let sensitive = sensitive_create(key_password)?;
                let mut public = BytesMut::new();
                put_tpm2b(&mut public, "inPublic", &template.public_area())?;
                let mut tail = BytesMut::with_capacity(6);
                tail.put_u16(0); // outsideInfo
                tail.put_u32(0); // creationPCR
                frame
                    .handle(TPM_RH_OWNER)
                    .auth(PasswordAuth::empty())
                    .raw_param(&sensitive)
                    .raw_param(&public)
                    .raw_param(&tail)
            }
            Operation::HashSignStart {
                key,
                total_len,
                key_password,
            } => frame
                .handle(*key)
                .auth(PasswordAuth::new(key_password.clone()))
                .u32_param(*total_len),
            Operation::SequenceUpdate { sequence, chunk } => frame
                .handle(*sequence)
                .auth(PasswordAuth::empty())
                .tpm2b_param("buffer", chunk)?,
            Operation::HashSignFinish { sequence } | Operation::HashVerifyFinish { sequence } => {
                frame.handle(*sequence).auth(PasswordAuth::empty())
            }
            Operation::HashVerifyStart {
                key,
                total_len,
                signature,
            } => {
                let mut sig = BytesMut::new();
                signature.encode_into(&mut sig)?;
                frame.handle(*key).u32_param(*total_len).raw_param(&sig)
            }
        };
        Ok(frame)
    }

    /// Encode the command frame.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        self.frame()?.encode()
    }
}
