//! Arena-backed fixtures shared by the test modules.
//!
//! Tests stand in for "physical memory" with a superpage-aligned block from
//! the host allocator, so frame addresses handed out by the rig are real
//! pointers and every direct-map access just works.

use std::alloc::{Layout, alloc, dealloc};

use kestrel_abi::SUPER_PAGE_SIZE;
use kestrel_lib::{KlogLevel, klog_register_backend, klog_set_level};

use crate::frame_alloc::{FrameAllocator, PhysLayout};

/// Forward kernel log lines to the harness's captured stdout.
fn stdout_backend(args: core::fmt::Arguments<'_>) {
    println!("{args}");
}

/// A superpage-aligned block of host memory standing in for physical RAM.
pub struct PhysArena {
    ptr: *mut u8,
    layout: Layout,
}

impl PhysArena {
    pub fn new(bytes: u64) -> Self {
        let layout =
            Layout::from_size_align(bytes as usize, SUPER_PAGE_SIZE as usize).expect("arena layout");
        // SAFETY: nonzero size.
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null(), "arena allocation failed");
        Self { ptr, layout }
    }

    pub fn start(&self) -> u64 {
        self.ptr as u64
    }
}

impl Drop for PhysArena {
    fn drop(&mut self) {
        // SAFETY: same layout the block was allocated with.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// An allocator carved out of its own arena.
pub struct TestRig {
    pub alloc: FrameAllocator,
    _arena: PhysArena,
}

impl TestRig {
    /// Default rig: one superpage worth of base-frame range plus a four-frame
    /// super pool.
    pub fn new() -> Self {
        Self::with_pools(SUPER_PAGE_SIZE, 4 * SUPER_PAGE_SIZE)
    }

    /// Base range of `base_bytes` (the refcount table is carved from it) and
    /// a super pool of `super_bytes`. A nonempty super pool needs both sizes
    /// superpage-aligned; pass `super_bytes == 0` for arbitrary base sizes.
    pub fn with_pools(base_bytes: u64, super_bytes: u64) -> Self {
        klog_register_backend(stdout_backend);
        klog_set_level(KlogLevel::Trace);

        let arena = PhysArena::new(base_bytes + super_bytes);
        let start = arena.start();
        let layout = PhysLayout {
            start,
            super_start: start + base_bytes,
            end: start + base_bytes + super_bytes,
        };
        // SAFETY: the arena owns the whole range for the rig's lifetime.
        let alloc = unsafe { FrameAllocator::new(layout) };
        Self {
            alloc,
            _arena: arena,
        }
    }
}
