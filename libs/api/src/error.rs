//! Error types for group references and spec validation.

use thiserror::Error;

/// Errors that can occur when parsing a `namespace/name` group reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference string is empty.
    #[error("group reference cannot be empty")]
    Empty,

    /// The reference does not split into exactly a namespace and a name.
    #[error("unable to split string into name and namespace using '/' as separator: {0}")]
    InvalidFormat(String),
}

/// Errors reported by [`crate::KeepalivedGroupSpec::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `spec.interface` is empty.
    #[error("spec.interface must be set")]
    MissingInterface,

    /// A blacklisted router id lies outside the VRRP id space.
    #[error("blacklisted router id {0} is outside the range 1-255")]
    BlacklistOutOfRange(i32),

    /// The same router id is blacklisted twice.
    #[error("router id {0} is blacklisted more than once")]
    DuplicateBlacklistEntry(i32),

    /// `spec.interfaceFromIP` is not an IPv4 address.
    #[error("spec.interfaceFromIP {0:?} is not a valid IPv4 address")]
    InvalidInterfaceFromIp(String),
}
