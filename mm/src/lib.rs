//! Kestrel virtual-memory core.
//!
//! Physical frame management and Sv39-style three-level paging for a small
//! teaching kernel: a dual-size-class frame allocator with reference
//! counting, a page-table walker, mapping/unmapping with superpage demotion,
//! address-space lifecycle (create/grow/shrink/copy/destroy), the demand
//! paging fault handler, and the kernel-to-user copy primitives.
//!
//! Physical frames are directly addressable (the platform keeps the managed
//! range identity-mapped), so a [`kestrel_abi::PhysAddr`] converts to a
//! pointer through the [`direct`] module. All shared allocator state lives in
//! one explicitly constructed [`FrameAllocator`]; page tables themselves are
//! single-writer and carry no locks of their own.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod address_space;
pub mod direct;
pub mod dump;
pub mod error;
pub mod fault;
pub mod frame_alloc;
pub mod mapping;
pub mod paging;
pub mod user_copy;

#[cfg(test)]
mod test_fixtures;
#[cfg(test)]
mod tests_demotion;
#[cfg(test)]
mod tests_oom;

pub use address_space::AddressSpace;
pub use error::{MmError, MmResult};
pub use frame_alloc::{FrameAllocator, FrameClass, PhysLayout};
