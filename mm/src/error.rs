//! Unified error types for the memory management subsystem.
//!
//! Only recoverable conditions appear here. Kernel-internal invariant
//! violations (misaligned map arguments, remap over a valid entry, freeing a
//! table with live leaves, refcount underflow) are corruption of this
//! subsystem's own state and panic instead of propagating.

use core::fmt;

/// Recoverable memory management error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No free frame of the requested class. Callers may reject the
    /// requesting operation or fall back to the other size class.
    NoMemory,
    /// No mapping covers the address. A normal outcome for lookups.
    NotMapped { address: u64 },
    /// Virtual address outside the mappable or permitted range.
    InvalidAddress,
    /// A copy-out attempted to write through a non-writable leaf.
    PermissionDenied,
    /// A bounded string copy ran out of buffer before the terminator.
    UnterminatedString,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of physical frames"),
            Self::NotMapped { address } => {
                write!(f, "address {:#x} not mapped", address)
            }
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::PermissionDenied => write!(f, "mapping permissions deny this access"),
            Self::UnterminatedString => write!(f, "string not terminated within bounds"),
        }
    }
}

/// Convenience result type for memory management operations.
pub type MmResult<T = ()> = Result<T, MmError>;
