//! Installing and removing leaf mappings.
//!
//! `map_pages` and `unmap_pages` operate on whole granules and know nothing
//! about address space sizes or growth policy; that lives in
//! [`address_space`](crate::address_space).

use kestrel_abi::{MAX_VA, PAGE_SIZE, PhysAddr, SUPER_PAGE_SIZE, VirtAddr};
use kestrel_lib::{align_down_u64, is_aligned_u64, klog_trace};

use crate::direct::PhysAddrDirect;
use crate::error::MmResult;
use crate::frame_alloc::{FrameAllocator, FrameClass};
use crate::paging::{PAGE_TABLE_ENTRIES, PageTable, PageTableEntry, PageTableWalker, PteFlags};

/// Map `size` bytes starting at `va` to the physical range starting at `pa`
/// with permissions `perm`.
///
/// The granule is chosen by `pa`'s pool: frames from the superpage pool are
/// installed as 2 MiB middle-level leaves, everything else as 4 KiB leaves.
/// `va`, `pa` and `size` must all be aligned to that granule.
///
/// Table-node exhaustion is the only recoverable failure
/// ([`crate::MmError::NoMemory`]); misuse — zero size, misalignment, a permission
/// set that would not form a leaf, or mapping over a live entry — panics.
pub fn map_pages(
    walker: &PageTableWalker,
    alloc: &FrameAllocator,
    root: PhysAddr,
    va: VirtAddr,
    size: u64,
    pa: PhysAddr,
    perm: PteFlags,
) -> MmResult {
    if size == 0 {
        panic!("map_pages: zero size");
    }
    if !perm.intersects(PteFlags::RWX) {
        panic!("map_pages: entry would not be a leaf ({perm:?})");
    }

    let class = if alloc.is_super(pa) {
        FrameClass::Super
    } else {
        FrameClass::Base
    };
    let gran = class.size();
    if !va.is_aligned(gran) || !pa.is_aligned(gran) {
        panic!("map_pages: {:#x} -> {:#x} not {gran:#x} aligned", va.as_u64(), pa.as_u64());
    }
    if !is_aligned_u64(size, gran) {
        panic!("map_pages: size {size:#x} not {gran:#x} aligned");
    }

    let end = match va.as_u64().checked_add(size) {
        Some(end) if end <= MAX_VA => end,
        _ => panic!(
            "map_pages: {size:#x} bytes at {:#x} out of bounds",
            va.as_u64()
        ),
    };

    let mut cur_va = va.as_u64();
    let mut cur_pa = pa;
    while cur_va < end {
        let entry = match class {
            FrameClass::Base => walker.entry(root, VirtAddr::new(cur_va), Some(alloc))?,
            FrameClass::Super => walker.entry_super(root, VirtAddr::new(cur_va), Some(alloc))?,
        };
        if entry.is_valid() {
            panic!("map_pages: remap at {cur_va:#x}");
        }
        entry.set(cur_pa, perm | PteFlags::VALID);
        cur_va += gran;
        cur_pa = cur_pa.offset(gran);
    }
    klog_trace!(
        "mapped [{:#x}, {end:#x}) -> {:#x} {class:?} {perm:?}",
        va.as_u64(),
        pa.as_u64()
    );
    Ok(())
}

/// Remove up to `npages` base-page-sized slots starting at `va`, freeing the
/// backing frames when `free` is set.
///
/// Holes (invalid or interior slots) are skipped silently. A superpage leaf
/// wholly inside the range is released in one step; one the range only grazes
/// is first demoted to 512 base mappings so the surviving portion keeps its
/// contents and permissions.
pub fn unmap_pages(
    walker: &PageTableWalker,
    alloc: &FrameAllocator,
    root: PhysAddr,
    va: VirtAddr,
    npages: u64,
    free: bool,
) {
    if !va.is_aligned(PAGE_SIZE) {
        panic!("unmap_pages: va {:#x} not page aligned", va.as_u64());
    }

    let end = match npages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| va.as_u64().checked_add(bytes))
    {
        Some(end) if end <= MAX_VA => end,
        _ => panic!(
            "unmap_pages: {npages:#x} pages at {:#x} out of bounds",
            va.as_u64()
        ),
    };
    let mut a = va.as_u64();
    while a < end {
        let entry = match walker.entry(root, VirtAddr::new(a), None) {
            Ok(e) => e,
            Err(_) => {
                a += PAGE_SIZE;
                continue;
            }
        };
        if !entry.is_leaf() {
            a += PAGE_SIZE;
            continue;
        }

        let pa = entry.addr();
        if alloc.is_super(pa) {
            let super_va = align_down_u64(a, SUPER_PAGE_SIZE);
            if a == super_va && super_va + SUPER_PAGE_SIZE <= end {
                if free {
                    alloc.free(pa);
                }
                entry.clear();
                a = super_va + SUPER_PAGE_SIZE;
            } else {
                demote(walker, alloc, entry, super_va, a, end, free);
                // The grazed slots are now invalid; the loop skips them.
            }
            continue;
        }

        if free {
            alloc.free(pa);
        }
        entry.clear();
        a += PAGE_SIZE;
    }
}

/// Replace a superpage leaf with an interior node over 512 base mappings.
///
/// Slices inside `[skip_start, skip_end)` are the ones being unmapped and are
/// left invalid; every other slice is copied into a fresh base frame carrying
/// the leaf's permission bits. Allocation failure here panics: demotion has
/// no caller that can undo a half-released superpage.
fn demote(
    walker: &PageTableWalker,
    alloc: &FrameAllocator,
    entry: &mut PageTableEntry,
    super_va: u64,
    skip_start: u64,
    skip_end: u64,
    free: bool,
) {
    let flags = entry.flags();
    let super_pa = entry.addr();
    klog_trace!("demoting superpage {:#x} at va {super_va:#x}", super_pa.as_u64());

    let Ok(table_pa) = walker.alloc_table(alloc) else {
        panic!("demote: out of table pages");
    };
    let table: *mut PageTable = table_pa.as_mut_ptr();

    for i in 0..PAGE_TABLE_ENTRIES as u64 {
        let slice_va = super_va + i * PAGE_SIZE;
        if slice_va >= skip_start && slice_va < skip_end {
            continue;
        }
        let Some(frame) = alloc.alloc_base() else {
            panic!("demote: out of frames");
        };
        // SAFETY: src is inside the live superpage frame, dst is the fresh
        // base frame; both span one full base page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                super_pa.offset(i * PAGE_SIZE).as_ptr::<u8>(),
                frame.as_mut_ptr::<u8>(),
                PAGE_SIZE as usize,
            );
            (*table).entry_mut(i as usize).set(frame, flags);
        }
    }

    entry.set(table_pa, PteFlags::VALID);
    if free {
        alloc.free(super_pa);
    }
}
