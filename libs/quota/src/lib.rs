//! # berth-quota
//!
//! Resource limits for the tenant tree (user → team → project → environment
//! → application) and the allocator that splits a parent's budget among its
//! children.
//!
//! ## Values
//!
//! - [`Configured`]: what a tenant or admin set at one level. `Auto` (stored
//!   as `-1`) asks for an even share of whatever the fixed siblings left over.
//! - [`Effective`]: what a level actually gets. `Unbounded` (stored as `-1`)
//!   only happens when every ancestor up to the user ceiling is unbounded.
//!
//! ## Invariants
//!
//! - For a bounded parent, the effective values of its children never sum to
//!   more than the parent's effective value.
//! - Allocation is deterministic: auto children are visited in ascending key
//!   order and the lowest keys receive the integer-division remainder.

mod allocator;
mod error;
mod kind;
mod limit;
pub mod units;

pub use allocator::{allocate, check_allocation, validate_allocation, Allocation};
pub use error::QuotaError;
pub use kind::ResourceKind;
pub use limit::{Configured, ConfiguredLimits, Effective, EffectiveLimits, Limits};

/// Raw integer stored for "auto" (configured) and "unbounded" (effective).
pub const AUTO: i64 = -1;
