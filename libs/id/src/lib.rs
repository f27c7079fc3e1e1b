//! # berth-id
//!
//! Typed identifiers for everything the berth control plane tracks.
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `team_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `app_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `dep_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! ULIDs sort by creation time, so "lowest ID" and "oldest entity" agree.
//! The quota allocator relies on that ordering for its remainder tie-break.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
