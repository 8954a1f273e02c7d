//! Physical frame allocator.
//!
//! Two pools of fixed-size frames carved from one contiguous boot-time
//! physical range: 4 KiB base frames below the split address, 2 MiB super
//! frames above it. Each pool is a lock-protected LIFO free list whose links
//! are embedded in the freed frames themselves. A side table of per-frame
//! reference counts (one `u32` per base-frame index, carved from the head of
//! the managed range at init) lets several mappings alias one frame; a frame
//! returns to its free list only when its count reaches zero.
//!
//! The refcount lock is distinct from the free-list locks so refcount
//! queries never block unrelated allocations. All hold times are O(1) per
//! call.
//!
//! Freed memory is poison-filled to surface use-after-free, and freshly
//! allocated frames are junk-filled so callers cannot rely on stale
//! contents.

use core::mem;
use core::ptr;

use kestrel_abi::{PAGE_SIZE, PhysAddr, SUPER_PAGE_SIZE};
use kestrel_lib::{align_up_u64, klog_info};
use spin::Mutex;

use crate::direct::PhysAddrDirect;

/// Fill pattern for frames sitting on a free list.
pub const POISON_FREE: u8 = 0x01;
/// Fill pattern for freshly allocated frames.
pub const POISON_ALLOC: u8 = 0x05;

/// Size class of a physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameClass {
    Base,
    Super,
}

impl FrameClass {
    #[inline]
    pub const fn size(self) -> u64 {
        match self {
            Self::Base => PAGE_SIZE,
            Self::Super => SUPER_PAGE_SIZE,
        }
    }
}

/// Boot-time description of the managed physical range.
///
/// `[start, super_start)` is carved into base frames (minus the refcount
/// table at its head), `[super_start, end)` into super frames. A kernel
/// without a super pool passes `super_start == end`.
#[derive(Clone, Copy, Debug)]
pub struct PhysLayout {
    pub start: u64,
    pub super_start: u64,
    pub end: u64,
}

impl PhysLayout {
    fn validate(&self) {
        if self.start % PAGE_SIZE != 0 {
            panic!("PhysLayout: start {:#x} not page aligned", self.start);
        }
        if self.start > self.super_start || self.super_start > self.end {
            panic!(
                "PhysLayout: not ordered: {:#x} / {:#x} / {:#x}",
                self.start, self.super_start, self.end
            );
        }
        if self.super_start < self.end
            && (self.super_start % SUPER_PAGE_SIZE != 0 || self.end % SUPER_PAGE_SIZE != 0)
        {
            panic!(
                "PhysLayout: super pool [{:#x}, {:#x}) not superpage aligned",
                self.super_start, self.end
            );
        }
    }
}

/// Singly-linked LIFO free list; the link lives in the freed frame itself.
struct FreeList {
    head: PhysAddr,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: PhysAddr::NULL,
            len: 0,
        }
    }

    /// Poison-fill `pa` and push it.
    ///
    /// # Safety
    /// `pa` must be an unused frame of `size` bytes inside the managed range.
    unsafe fn push(&mut self, pa: PhysAddr, size: u64) {
        ptr::write_bytes(pa.as_mut_ptr::<u8>(), POISON_FREE, size as usize);
        *pa.as_mut_ptr::<u64>() = self.head.as_u64();
        self.head = pa;
        self.len += 1;
    }

    /// Pop the most recently freed frame, if any.
    ///
    /// # Safety
    /// List links must be intact (no writes through stale frame pointers).
    unsafe fn pop(&mut self) -> Option<PhysAddr> {
        if self.head.is_null() {
            return None;
        }
        let pa = self.head;
        self.head = PhysAddr::new(*pa.as_ptr::<u64>());
        self.len -= 1;
        Some(pa)
    }
}

/// Per-base-frame-index reference counts.
///
/// A super frame's count lives at the index of its first base frame; both
/// size classes share one counting scheme.
struct RefTable {
    counts: *mut u32,
    entries: usize,
}

// SAFETY: the raw pointer targets memory owned exclusively by the allocator
// and is only touched under the refs mutex.
unsafe impl Send for RefTable {}

/// The physical frame allocator: two free lists plus the refcount table,
/// each behind its own lock.
///
/// Explicitly constructed and passed by reference to every subsystem that
/// needs frames, so tests can instantiate independent allocators.
pub struct FrameAllocator {
    layout: PhysLayout,
    /// First base frame past the refcount table.
    base_start: u64,
    base: Mutex<FreeList>,
    supers: Mutex<FreeList>,
    refs: Mutex<RefTable>,
}

impl FrameAllocator {
    /// Take ownership of the physical range described by `layout`, carve the
    /// refcount table from its head and seed both free lists.
    ///
    /// # Safety
    /// The whole `[layout.start, layout.end)` range must be directly
    /// addressable, unused, and owned by the caller; nothing else may touch
    /// it for the allocator's lifetime.
    pub unsafe fn new(layout: PhysLayout) -> Self {
        layout.validate();

        let total_frames = ((layout.end - layout.start) / PAGE_SIZE) as usize;
        let table_bytes = align_up_u64((total_frames * mem::size_of::<u32>()) as u64, PAGE_SIZE);
        let base_start = layout.start + table_bytes;
        if base_start > layout.super_start {
            panic!("PhysLayout: base region cannot hold the refcount table");
        }

        let counts = PhysAddr::new(layout.start).as_mut_ptr::<u32>();
        ptr::write_bytes(counts, 0, total_frames);

        let alloc = Self {
            layout,
            base_start,
            base: Mutex::new(FreeList::new()),
            supers: Mutex::new(FreeList::new()),
            refs: Mutex::new(RefTable {
                counts,
                entries: total_frames,
            }),
        };

        {
            let mut list = alloc.base.lock();
            let mut pa = base_start;
            while pa + PAGE_SIZE <= layout.super_start {
                list.push(PhysAddr::new(pa), PAGE_SIZE);
                pa += PAGE_SIZE;
            }
        }
        {
            let mut list = alloc.supers.lock();
            let mut pa = layout.super_start;
            while pa + SUPER_PAGE_SIZE <= layout.end {
                list.push(PhysAddr::new(pa), SUPER_PAGE_SIZE);
                pa += SUPER_PAGE_SIZE;
            }
        }

        klog_info!(
            "frame_alloc: ready, {} base + {} super frames",
            alloc.base.lock().len,
            alloc.supers.lock().len
        );
        alloc
    }

    /// The layout this allocator was built from.
    #[inline]
    pub fn layout(&self) -> PhysLayout {
        self.layout
    }

    /// Size class of a frame, decided by which pool's range holds it.
    #[inline]
    pub fn frame_class(&self, pa: PhysAddr) -> FrameClass {
        if pa.as_u64() >= self.layout.super_start {
            FrameClass::Super
        } else {
            FrameClass::Base
        }
    }

    #[inline]
    pub fn is_super(&self, pa: PhysAddr) -> bool {
        self.frame_class(pa) == FrameClass::Super
    }

    /// Pop a 4 KiB frame. `None` means ordinary pool exhaustion.
    pub fn alloc_base(&self) -> Option<PhysAddr> {
        self.alloc_from(FrameClass::Base)
    }

    /// Pop a 2 MiB frame. `None` means ordinary pool exhaustion.
    pub fn alloc_super(&self) -> Option<PhysAddr> {
        self.alloc_from(FrameClass::Super)
    }

    fn alloc_from(&self, class: FrameClass) -> Option<PhysAddr> {
        let pa = {
            let mut list = self.list(class).lock();
            // SAFETY: list links are only written by push on poisoned frames.
            unsafe { list.pop() }?
        };

        {
            let refs = self.refs.lock();
            let slot = self.ref_slot(&refs, pa);
            // SAFETY: slot is in-bounds per ref_slot; guarded by the refs lock.
            unsafe {
                if *slot != 0 {
                    panic!(
                        "frame_alloc: free-list frame {:#x} has refcount {}",
                        pa.as_u64(),
                        *slot
                    );
                }
                *slot = 1;
            }
        }

        // SAFETY: the frame was just popped, nobody else references it.
        unsafe { ptr::write_bytes(pa.as_mut_ptr::<u8>(), POISON_ALLOC, class.size() as usize) };
        Some(pa)
    }

    /// Drop one reference to `pa`; return the frame to its free list when
    /// the count reaches zero.
    ///
    /// # Panics
    /// On misaligned or out-of-range addresses and on freeing a frame whose
    /// count is already zero. Both indicate kernel bugs, not bad input.
    pub fn free(&self, pa: PhysAddr) {
        let class = self.frame_class(pa);
        self.check_frame(pa, class);

        let remaining = {
            let refs = self.refs.lock();
            let slot = self.ref_slot(&refs, pa);
            // SAFETY: in-bounds slot, guarded by the refs lock.
            unsafe {
                if *slot == 0 {
                    panic!("frame_alloc: free of unreferenced frame {:#x}", pa.as_u64());
                }
                *slot -= 1;
                *slot
            }
        };
        if remaining > 0 {
            return;
        }

        let mut list = self.list(class).lock();
        // SAFETY: count hit zero, so no mapping references the frame anymore.
        unsafe { list.push(pa, class.size()) };
    }

    /// Add one reference to an allocated frame (frame sharing, e.g. at fork).
    ///
    /// # Panics
    /// If the frame is not currently allocated (count < 1).
    pub fn increase_ref(&self, pa: PhysAddr) {
        let class = self.frame_class(pa);
        self.check_frame(pa, class);

        let refs = self.refs.lock();
        let slot = self.ref_slot(&refs, pa);
        // SAFETY: in-bounds slot, guarded by the refs lock.
        unsafe {
            if *slot < 1 {
                panic!(
                    "frame_alloc: increase_ref on unallocated frame {:#x}",
                    pa.as_u64()
                );
            }
            *slot += 1;
        }
    }

    /// Current reference count of `pa`.
    pub fn ref_count(&self, pa: PhysAddr) -> u32 {
        let class = self.frame_class(pa);
        self.check_frame(pa, class);

        let refs = self.refs.lock();
        let slot = self.ref_slot(&refs, pa);
        // SAFETY: in-bounds slot, guarded by the refs lock.
        unsafe { *slot }
    }

    /// Number of 4 KiB frames currently on the base free list.
    pub fn free_base_count(&self) -> usize {
        self.base.lock().len
    }

    /// Number of 2 MiB frames currently on the super free list.
    pub fn free_super_count(&self) -> usize {
        self.supers.lock().len
    }

    fn list(&self, class: FrameClass) -> &Mutex<FreeList> {
        match class {
            FrameClass::Base => &self.base,
            FrameClass::Super => &self.supers,
        }
    }

    fn check_frame(&self, pa: PhysAddr, class: FrameClass) {
        let raw = pa.as_u64();
        let ok = match class {
            FrameClass::Base => {
                raw % PAGE_SIZE == 0 && raw >= self.base_start && raw < self.layout.super_start
            }
            FrameClass::Super => raw % SUPER_PAGE_SIZE == 0 && raw < self.layout.end,
        };
        if !ok {
            panic!("frame_alloc: bad frame address {:#x}", raw);
        }
    }

    fn ref_slot(&self, refs: &RefTable, pa: PhysAddr) -> *mut u32 {
        let idx = ((pa.as_u64() - self.layout.start) / PAGE_SIZE) as usize;
        if idx >= refs.entries {
            panic!("frame_alloc: frame {:#x} outside refcount table", pa.as_u64());
        }
        // Callers dereference under the refs lock.
        unsafe { refs.counts.add(idx) }
    }
}
