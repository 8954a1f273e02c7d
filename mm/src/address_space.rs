//! Per-process virtual address spaces.
//!
//! An [`AddressSpace`] owns a page table tree and tracks how many bytes of
//! user memory it covers. Growth prefers 2 MiB superpages when the next
//! uncovered stretch is aligned and large enough, falling back to base pages
//! when the superpage pool runs dry. All frames come from a caller-supplied
//! [`FrameAllocator`]; nothing here is global.

use core::marker::PhantomData;

use kestrel_abi::{MAX_VA, PAGE_SIZE, PhysAddr, SUPER_PAGE_SIZE, VirtAddr};
use kestrel_lib::{align_up_u64, is_aligned_u64, klog_debug, klog_warn};

use crate::direct::PhysAddrDirect;
use crate::error::{MmError, MmResult};
use crate::frame_alloc::FrameAllocator;
use crate::mapping::{map_pages, unmap_pages};
use crate::paging::{PAGE_TABLE_ENTRIES, PageTable, PageTableWalker, PteFlags};

/// A user address space: root table plus the size of the covered range
/// `[0, size)`.
///
/// `size` is public because the owning process records growth results here
/// directly. Not `Sync`: concurrent mutation of one address space is the
/// caller's bug, not a supported mode.
pub struct AddressSpace {
    root: PhysAddr,
    pub size: u64,
    _single_writer: PhantomData<*mut PageTable>,
}

impl AddressSpace {
    /// Create an empty address space with a zeroed root table.
    pub fn new(alloc: &FrameAllocator) -> MmResult<Self> {
        let walker = PageTableWalker::new();
        let root = walker.alloc_table(alloc)?;
        Ok(Self {
            root,
            size: 0,
            _single_writer: PhantomData,
        })
    }

    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Exact physical address backing `va`, if it is mapped user-accessible.
    #[inline]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        PageTableWalker::new().translate(self.root, va)
    }

    /// Whether `va` is covered by any valid leaf, user-accessible or not.
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        match PageTableWalker::new().entry(self.root, va, None) {
            Ok(e) => e.is_valid(),
            Err(_) => false,
        }
    }

    /// Grow the covered range to `new_size` bytes, mapping fresh zeroed
    /// frames `READ | USER | extra`. A no-op when `new_size <= size`.
    ///
    /// On any allocation failure everything mapped by this call is unmapped
    /// and freed again and `size` is left unchanged.
    pub fn grow(&mut self, alloc: &FrameAllocator, new_size: u64, extra: PteFlags) -> MmResult {
        if new_size > MAX_VA {
            return Err(MmError::InvalidAddress);
        }
        if new_size <= self.size {
            return Ok(());
        }

        let walker = PageTableWalker::new();
        let old_size = self.size;
        let start = align_up_u64(old_size, PAGE_SIZE);
        let perm = PteFlags::READ | PteFlags::USER | extra;

        let mut a = start;
        while a < new_size {
            if is_aligned_u64(a, SUPER_PAGE_SIZE)
                && a + SUPER_PAGE_SIZE <= new_size
                && self.super_slot_free(&walker, a)
            {
                if let Some(pa) = alloc.alloc_super() {
                    // SAFETY: freshly allocated frame, directly addressable.
                    unsafe {
                        core::ptr::write_bytes(pa.as_mut_ptr::<u8>(), 0, SUPER_PAGE_SIZE as usize)
                    };
                    if map_pages(
                        &walker,
                        alloc,
                        self.root,
                        VirtAddr::new(a),
                        SUPER_PAGE_SIZE,
                        pa,
                        perm,
                    )
                    .is_err()
                    {
                        alloc.free(pa);
                        self.rollback(alloc, start, a);
                        return Err(MmError::NoMemory);
                    }
                    a += SUPER_PAGE_SIZE;
                    continue;
                }
                // Superpage pool dry; cover the stretch with base pages.
            }

            // A slot can already be live here when an earlier shrink demoted
            // a superpage that straddled the old size. Keep it.
            if let Ok(e) = walker.entry(self.root, VirtAddr::new(a), None) {
                if e.is_valid() {
                    a += PAGE_SIZE;
                    continue;
                }
            }

            let Some(pa) = alloc.alloc_base() else {
                self.rollback(alloc, start, a);
                return Err(MmError::NoMemory);
            };
            // SAFETY: freshly allocated frame, directly addressable.
            unsafe { core::ptr::write_bytes(pa.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };
            if map_pages(&walker, alloc, self.root, VirtAddr::new(a), PAGE_SIZE, pa, perm).is_err()
            {
                alloc.free(pa);
                self.rollback(alloc, start, a);
                return Err(MmError::NoMemory);
            }
            a += PAGE_SIZE;
        }

        klog_debug!("address space grew {old_size:#x} -> {new_size:#x}");
        self.size = new_size;
        Ok(())
    }

    /// Shrink the covered range to `new_size` bytes, unmapping and freeing
    /// everything above it. Returns the new size.
    pub fn shrink(&mut self, alloc: &FrameAllocator, new_size: u64) -> u64 {
        if new_size >= self.size {
            return self.size;
        }
        let keep = align_up_u64(new_size, PAGE_SIZE);
        let old_end = align_up_u64(self.size, PAGE_SIZE);
        if keep < old_end {
            let walker = PageTableWalker::new();
            let npages = (old_end - keep) / PAGE_SIZE;
            unmap_pages(&walker, alloc, self.root, VirtAddr::new(keep), npages, true);
        }
        self.size = new_size;
        new_size
    }

    /// Deep-copy this address space: every leaf over `[0, size)` gets a
    /// fresh same-class frame with the same contents and permission bits.
    /// Holes (demand-paged addresses never touched) stay holes.
    ///
    /// On failure the partial copy is destroyed and the source is untouched.
    pub fn duplicate(&self, alloc: &FrameAllocator) -> MmResult<AddressSpace> {
        let walker = PageTableWalker::new();
        let mut new = AddressSpace::new(alloc)?;

        let mut a = 0u64;
        while a < self.size {
            let entry = match walker.entry(self.root, VirtAddr::new(a), None) {
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

            let src = entry.addr();
            let flags = entry.flags();
            let (gran, dst) = if alloc.is_super(src) {
                (SUPER_PAGE_SIZE, alloc.alloc_super())
            } else {
                (PAGE_SIZE, alloc.alloc_base())
            };
            let Some(dst) = dst else {
                new.size = a;
                new.destroy(alloc);
                return Err(MmError::NoMemory);
            };
            // SAFETY: both frames are live and span `gran` bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr::<u8>(),
                    dst.as_mut_ptr::<u8>(),
                    gran as usize,
                );
            }
            if map_pages(&walker, alloc, new.root, VirtAddr::new(a), gran, dst, flags).is_err() {
                alloc.free(dst);
                new.size = a;
                new.destroy(alloc);
                return Err(MmError::NoMemory);
            }
            a += gran;
        }

        new.size = self.size;
        Ok(new)
    }

    /// Tear the whole address space down: unmap and free every leaf, then
    /// free the table tree itself.
    ///
    /// # Panics
    /// If the table sweep finds a leaf outside `[0, size)` still valid; that
    /// means a mapping was installed behind the size bookkeeping.
    pub fn destroy(self, alloc: &FrameAllocator) {
        let walker = PageTableWalker::new();
        if self.size > 0 {
            let npages = align_up_u64(self.size, PAGE_SIZE) / PAGE_SIZE;
            unmap_pages(&walker, alloc, self.root, VirtAddr::new(0), npages, true);
        }
        free_walk(alloc, self.root);
    }

    /// Read-only probe: is the middle-level slot covering `va` free to take
    /// a superpage leaf?
    fn super_slot_free(&self, walker: &PageTableWalker, va: u64) -> bool {
        match walker.entry_super(self.root, VirtAddr::new(va), None) {
            Ok(e) => !e.is_valid(),
            // No path down to the slot yet, so nothing occupies it.
            Err(_) => true,
        }
    }

    /// Undo a partial `grow`: release everything mapped in `[start, upto)`.
    fn rollback(&mut self, alloc: &FrameAllocator, start: u64, upto: u64) {
        klog_warn!("grow out of frames, releasing [{start:#x}, {upto:#x})");
        if upto > start {
            let walker = PageTableWalker::new();
            unmap_pages(
                &walker,
                alloc,
                self.root,
                VirtAddr::new(start),
                (upto - start) / PAGE_SIZE,
                true,
            );
        }
    }
}

/// Recursively free a table tree. Every leaf must already be gone.
fn free_walk(alloc: &FrameAllocator, table_pa: PhysAddr) {
    let table: *mut PageTable = table_pa.as_mut_ptr();
    for i in 0..PAGE_TABLE_ENTRIES {
        // SAFETY: table nodes stay directly addressable until freed below.
        let entry = unsafe { (*table).entry_mut(i) };
        if entry.is_interior() {
            free_walk(alloc, entry.addr());
            entry.clear();
        } else if entry.is_valid() {
            panic!("free_walk: leaf");
        }
    }
    alloc.free(table_pa);
}
