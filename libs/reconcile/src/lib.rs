//! Router id allocation and group membership.
//!
//! This library holds the pure part of the keepalived reconciliation loop:
//!
//! - **Membership**: which services (and, when spreading, which of their
//!   addresses) are VRRP instances of a group.
//! - **Allocation**: the minimal-diff router id mapping for that membership.
//! - **Conditions**: the status records an operator reads to diagnose a group.
//!
//! # Invariants
//!
//! - Every function here is deterministic given the same inputs
//! - Nothing performs I/O; callers own fetching and persisting
//! - Router ids are unique within a group, never blacklisted, always in `1..=255`

pub mod allocator;
pub mod conditions;
pub mod membership;

pub use allocator::{allocate, Allocation, RouterIdSet, MAX_ROUTER_ID, MIN_ROUTER_ID};
pub use membership::derive_members;

use thiserror::Error;

/// Allocation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Every router id is either blacklisted or already taken.
    #[error("cannot allocate more than 255 ids in one keepalived group (no id left for {member})")]
    Exhausted { member: String },
}
