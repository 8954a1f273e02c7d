//! Page table walker: locates (and optionally creates) the entry slot for a
//! virtual address.
//!
//! Table nodes are reached through a [`FrameMapping`], so the walker never
//! assumes how physical frames become pointers; the kernel uses the identity
//! [`DirectMapping`].

use kestrel_abi::{MAX_VA, PhysAddr, VirtAddr};

use super::defs::{PageTable, PageTableEntry, PageTableLevel, PteFlags};
use crate::direct::PhysAddrDirect;
use crate::error::{MmError, MmResult};
use crate::frame_alloc::FrameAllocator;

/// Translates the physical address of a table node into a pointer.
///
/// # Safety
/// Implementations must return a pointer that is valid for reads and writes
/// of a whole `PageTable` for as long as the frame stays allocated.
pub unsafe trait FrameMapping {
    fn table_ptr(&self, phys: PhysAddr) -> Option<*mut PageTable>;
}

/// Identity mapping: the managed physical range is directly addressable.
pub struct DirectMapping;

unsafe impl FrameMapping for DirectMapping {
    #[inline]
    fn table_ptr(&self, phys: PhysAddr) -> Option<*mut PageTable> {
        if phys.is_null() {
            return None;
        }
        Some(phys.as_mut_ptr())
    }
}

pub struct PageTableWalker<M: FrameMapping = DirectMapping> {
    mapping: M,
}

impl PageTableWalker<DirectMapping> {
    #[inline]
    pub fn new() -> Self {
        Self {
            mapping: DirectMapping,
        }
    }
}

impl Default for PageTableWalker<DirectMapping> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: FrameMapping> PageTableWalker<M> {
    #[inline]
    pub fn with_mapping(mapping: M) -> Self {
        Self { mapping }
    }

    /// Allocate and zero a fresh table node.
    pub fn alloc_table(&self, alloc: &FrameAllocator) -> MmResult<PhysAddr> {
        let pa = alloc.alloc_base().ok_or(MmError::NoMemory)?;
        let table = self.mapping.table_ptr(pa).ok_or(MmError::InvalidAddress)?;
        // SAFETY: the frame was just allocated for exclusive use as a table.
        unsafe { (*table).zero() };
        Ok(pa)
    }

    /// Walk to the bottom-level entry for `va`, descending through interior
    /// entries. With `create`, missing interior nodes are allocated, zeroed
    /// and installed on the way down; without it a missing node is reported
    /// as [`MmError::NotMapped`] — a normal outcome, not a failure.
    ///
    /// A leaf found at the middle level (a superpage) is returned directly.
    ///
    /// # Panics
    /// If `va` is beyond the maximum mappable virtual address; callers are
    /// expected to range-check user-supplied addresses first.
    pub fn entry<'a>(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        create: Option<&FrameAllocator>,
    ) -> MmResult<&'a mut PageTableEntry> {
        if va.as_u64() >= MAX_VA {
            panic!("walk: va {:#x} out of range", va.as_u64());
        }

        let mut table = self
            .mapping
            .table_ptr(root)
            .ok_or(MmError::InvalidAddress)?;

        let mut level = PageTableLevel::Two;
        while let Some(next) = level.next_lower() {
            // SAFETY: table points at a live node per FrameMapping contract.
            let e = unsafe { (*table).entry_mut(level.index_of(va)) as *mut PageTableEntry };
            unsafe {
                if (*e).is_valid() {
                    if (*e).is_leaf() {
                        return Ok(&mut *e);
                    }
                    table = self
                        .mapping
                        .table_ptr((*e).addr())
                        .ok_or(MmError::InvalidAddress)?;
                } else if let Some(alloc) = create {
                    let pa = self.alloc_table(alloc)?;
                    (*e).set(pa, PteFlags::VALID);
                    table = self.mapping.table_ptr(pa).ok_or(MmError::InvalidAddress)?;
                } else {
                    return Err(MmError::NotMapped {
                        address: va.as_u64(),
                    });
                }
            }
            level = next;
        }

        // SAFETY: as above; the slot outlives the walk (single-writer tables).
        unsafe { Ok(&mut *((*table).entry_mut(PageTableLevel::Zero.index_of(va)) as *mut _)) }
    }

    /// Like [`entry`](Self::entry) but stops one level early and returns the
    /// middle-level slot, letting the caller install or inspect a superpage
    /// leaf.
    pub fn entry_super<'a>(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        create: Option<&FrameAllocator>,
    ) -> MmResult<&'a mut PageTableEntry> {
        if va.as_u64() >= MAX_VA {
            panic!("walk_super: va {:#x} out of range", va.as_u64());
        }

        let root_table = self
            .mapping
            .table_ptr(root)
            .ok_or(MmError::InvalidAddress)?;

        // SAFETY: root_table points at the live root node.
        let e = unsafe {
            (*root_table).entry_mut(PageTableLevel::Two.index_of(va)) as *mut PageTableEntry
        };
        let mid = unsafe {
            if (*e).is_valid() {
                self.mapping
                    .table_ptr((*e).addr())
                    .ok_or(MmError::InvalidAddress)?
            } else if let Some(alloc) = create {
                let pa = self.alloc_table(alloc)?;
                (*e).set(pa, PteFlags::VALID);
                self.mapping.table_ptr(pa).ok_or(MmError::InvalidAddress)?
            } else {
                return Err(MmError::NotMapped {
                    address: va.as_u64(),
                });
            }
        };

        // SAFETY: as above.
        unsafe { Ok(&mut *((*mid).entry_mut(PageTableLevel::One.index_of(va)) as *mut _)) }
    }

    /// Resolve `va` to its exact physical address.
    ///
    /// Only succeeds through a Valid, User-accessible leaf (base or super);
    /// everything else — missing path, interior-only path, kernel-only leaf,
    /// out-of-range address — is `None`, never an error.
    pub fn translate(&self, root: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
        if va.as_u64() >= MAX_VA {
            return None;
        }

        let mut table = self.mapping.table_ptr(root)?;
        let mut level = PageTableLevel::Two;
        loop {
            // SAFETY: table points at a live node per FrameMapping contract.
            let e = unsafe { *(*table).entry(level.index_of(va)) };
            if !e.is_valid() {
                return None;
            }
            if e.is_leaf() {
                if !e.is_user() {
                    return None;
                }
                if !level.supports_super_leaf() && level != PageTableLevel::Zero {
                    // Malformed tree: leaves never live at the root level.
                    return None;
                }
                let offset = va.as_u64() & (level.entry_size() - 1);
                return Some(e.addr().offset(offset));
            }
            match level.next_lower() {
                Some(next) => {
                    table = self.mapping.table_ptr(e.addr())?;
                    level = next;
                }
                // Valid but permission-less bottom entry: treat as unmapped.
                None => return None,
            }
        }
    }
}
