//! Kestrel shared ABI types.
//!
//! Canonical definitions for the handful of types every kernel subsystem
//! agrees on: typed physical/virtual addresses and the page-size constants
//! derived from the Sv39-style paging scheme (4 KiB base pages, 2 MiB
//! superpages, three table levels of 512 entries each).

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod addr;

/// Standard 4 KiB base page size.
pub const PAGE_SIZE: u64 = 0x1000;

/// 2 MiB superpage size (512 base pages, one middle-level leaf).
pub const SUPER_PAGE_SIZE: u64 = 0x20_0000;

/// One past the highest virtual address the three-level scheme can map.
///
/// Sv39 addresses 39 bits; the top bit is left unused so that the kernel
/// never has to reason about sign-extended addresses.
pub const MAX_VA: u64 = 1 << 38;

pub use addr::{PhysAddr, VirtAddr};
