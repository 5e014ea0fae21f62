//! # sparkling-id
//!
//! Typed identifiers for the sparkling orchestrator.
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`.
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `ctr_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `ses_01HV4Z4NYPLTRS0JTUA8XDME5F`
//! - `usr_01HV4Z5PZQMVST1KVUB9YENF6G`
//!
//! Container IDs double as the runtime container name, so the rendered form
//! only uses characters the container runtime accepts in names.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

/// Split `{expected}_{ulid}` and decode the ULID half.
#[doc(hidden)]
pub fn parse_prefixed(s: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    let (prefix, ulid) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }
    ulid.parse()
        .map_err(|e: ulid::DecodeError| IdError::InvalidUlid(e.to_string()))
}
