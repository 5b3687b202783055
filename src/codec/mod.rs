//! TPM2-style command/response codec.
//!
//! Pure byte-level framing with no I/O:
//!
//! - [`CommandFrame`]: header, handles, password authorization, parameters;
//!   the size field is always computed.
//! - [`ResponseFrame`]: header validation, output handles, parameter block.
//! - [`Operation`]: the closed set of commands the client issues.
//! - [`PublicArea`], [`Signature`], [`VerifiedTicket`]: response payloads.

mod command;
mod marshal;
mod operation;
mod public;
mod response;
mod signature;

pub use command::{CommandFrame, PasswordAuth, Tag};
pub use marshal::{Unmarshal, put_tpm2b};
pub use operation::{Operation, StartupType};
pub use public::{DILITHIUM_SECURITY_LEVEL, PrimaryTemplate, PublicArea, PublicKey, sensitive_create};
pub use response::{LatencyRecord, ResponseFrame, ResponseHeader, extract_first_handle};
pub use signature::{Signature, VerifiedTicket};
