//! Demand paging: grown-but-untouched addresses get their frame on first
//! fault.
//!
//! [`AddressSpace::grow`](crate::AddressSpace::grow) only promises the range;
//! the page itself is materialized here when the process first touches it.

use kestrel_abi::{PAGE_SIZE, PhysAddr, VirtAddr};
use kestrel_lib::klog_trace;

use crate::address_space::AddressSpace;
use crate::direct::PhysAddrDirect;
use crate::frame_alloc::FrameAllocator;
use crate::mapping::map_pages;
use crate::paging::{PageTableWalker, PteFlags};

/// Resolve a page fault at `va` by mapping a fresh zeroed base frame.
///
/// Returns the frame's physical address, or `None` when the fault is not
/// ours to fix: `va` beyond the covered range, the page already mapped
/// (a permission fault, not a missing page), or memory exhausted. The
/// caller kills the process or retries as its policy dictates.
///
/// `exec` marks the faulting access as an instruction fetch; the new page
/// then gets `EXEC` as well.
pub fn handle_fault(
    space: &AddressSpace,
    alloc: &FrameAllocator,
    va: VirtAddr,
    exec: bool,
) -> Option<PhysAddr> {
    if va.as_u64() >= space.size {
        return None;
    }
    let base = va.page_base();
    if space.is_mapped(base) {
        return None;
    }

    let pa = alloc.alloc_base()?;
    // SAFETY: freshly allocated frame, directly addressable.
    unsafe { core::ptr::write_bytes(pa.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };

    let mut perm = PteFlags::READ | PteFlags::WRITE | PteFlags::USER;
    if exec {
        perm |= PteFlags::EXEC;
    }
    let walker = PageTableWalker::new();
    if map_pages(&walker, alloc, space.root(), base, PAGE_SIZE, pa, perm).is_err() {
        alloc.free(pa);
        return None;
    }

    klog_trace!("demand-paged {:#x} -> {:#x}", base.as_u64(), pa.as_u64());
    Some(pa)
}
