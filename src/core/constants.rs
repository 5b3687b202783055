//! Protocol constants shared with the Petalite firmware.
//!
//! These values are fixed by the peer and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CONTROL BYTES (out-of-band relative to TPM framing)
// =============================================================================

/// Host polling for readiness.
pub const SYNC_BYTE: u8 = 0xB0;

/// Peer signals idle/ready.
pub const READY_BYTE: u8 = 0xA0;

/// Host begins a transaction.
pub const START_BYTE: u8 = 0xAC;

/// One unit (group or step) acknowledged.
pub const ACK_BYTE: u8 = 0xCC;

// =============================================================================
// BULK TRANSFER
// =============================================================================

/// Default size of one acknowledged group.
pub const DEFAULT_GROUP_SIZE: usize = 64;

/// Default wait for a single group ACK.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// TPM FRAMING
// =============================================================================

/// Command/response header size (tag + size + code).
pub const TPM_HEADER_SIZE: usize = 10;

/// Size of one handle on the wire.
pub const TPM_HANDLE_SIZE: usize = 4;

/// Size of the parameterSize field in session-based responses.
pub const TPM_PARAMETER_SIZE_FIELD: usize = 4;

/// Length of the optional latency record preceding a response.
pub const LATENCY_RECORD_SIZE: usize = 8;

/// Largest frame the device buffers; responses share the command buffer.
pub const MAX_RESPONSE_SIZE: u32 = 4096;

/// Tag for frames without an authorization area.
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;

/// Tag for frames with an authorization area.
pub const TPM_ST_SESSIONS: u16 = 0x8002;

/// Password authorization pseudo-session.
pub const TPM_RS_PW: u32 = 0x4000_0009;

/// Owner hierarchy.
pub const TPM_RH_OWNER: u32 = 0x4000_0001;

/// Success response code.
pub const TPM_RC_SUCCESS: u32 = 0x0000_0000;

// =============================================================================
// COMMAND CODES
// =============================================================================

/// TPM2_Startup.
pub const TPM_CC_STARTUP: u32 = 0x0000_0144;

/// TPM2_GetRandom.
pub const TPM_CC_GET_RANDOM: u32 = 0x0000_017B;

/// TPM2_CreatePrimary.
pub const TPM_CC_CREATE_PRIMARY: u32 = 0x0000_0131;

/// TPM2_SequenceUpdate.
pub const TPM_CC_SEQUENCE_UPDATE: u32 = 0x0000_015C;

/// Vendor HashSignStart.
pub const TPM_CC_HASH_SIGN_START: u32 = 0x2000_01A0;

/// Vendor HashSignFinish.
pub const TPM_CC_HASH_SIGN_FINISH: u32 = 0x2000_01A1;

/// Vendor HashVerifyStart.
pub const TPM_CC_HASH_VERIFY_START: u32 = 0x2000_01A2;

/// Vendor HashVerifyFinish.
pub const TPM_CC_HASH_VERIFY_FINISH: u32 = 0x2000_01A3;

// =============================================================================
// ALGORITHM IDENTIFIERS
// =============================================================================

/// TPM_ALG_ECC.
pub const TPM_ALG_ECC: u16 = 0x0023;

/// Vendor lattice-based signature algorithm (Dilithium).
pub const TPM_ALG_DILITHIUM: u16 = 0x0072;

/// TPM_ALG_SHA256.
pub const TPM_ALG_SHA256: u16 = 0x000B;

/// TPM_ALG_NULL.
pub const TPM_ALG_NULL: u16 = 0x0010;

/// TPM_ALG_ECDSA.
pub const TPM_ALG_ECDSA: u16 = 0x0018;

/// TPM_ECC_NIST_P256.
pub const TPM_ECC_NIST_P256: u16 = 0x0003;

// =============================================================================
// STARTUP TYPES
// =============================================================================

/// TPM_SU_CLEAR.
pub const TPM_SU_CLEAR: u16 = 0x0000;

/// TPM_SU_STATE.
pub const TPM_SU_STATE: u16 = 0x0001;

// =============================================================================
// CLIENT DEFAULTS
// =============================================================================

/// Object attributes used by the firmware's primary-key templates.
pub const DEFAULT_OBJECT_ATTRIBUTES: u32 = 0x0004_0472;

/// Key password placed in the sensitive area of created primaries.
pub const DEFAULT_KEY_PASSWORD: &[u8] = b"abcd";

/// Message bytes carried by one SequenceUpdate.
pub const DEFAULT_UPDATE_CHUNK_SIZE: usize = 256;

/// Largest count accepted by GetRandom.
pub const MAX_RANDOM_BYTES: u16 = 0xFFFF;
