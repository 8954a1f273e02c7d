//! Copying between kernel buffers and user address spaces.
//!
//! Every routine here is fault-routed: a miss on a demand-paged address goes
//! through [`handle_fault`] before it is reported as an error, so a process
//! can pass the kernel a buffer it has never touched.

use kestrel_abi::{PAGE_SIZE, VirtAddr};

use crate::address_space::AddressSpace;
use crate::direct::PhysAddrDirect;
use crate::error::{MmError, MmResult};
use crate::fault::handle_fault;
use crate::frame_alloc::FrameAllocator;
use crate::paging::PageTableWalker;

/// Physical address of the page backing `va`, demand-paging it on a miss.
fn resolve_page(
    space: &AddressSpace,
    alloc: &FrameAllocator,
    base: VirtAddr,
) -> MmResult<kestrel_abi::PhysAddr> {
    if !base.is_mappable() {
        return Err(MmError::InvalidAddress);
    }
    if let Some(pa) = space.translate(base) {
        return Ok(pa);
    }
    handle_fault(space, alloc, base, false).ok_or(MmError::NotMapped {
        address: base.as_u64(),
    })
}

/// Copy `src` into the user address space at `dstva`.
///
/// Refuses pages the user cannot write ([`MmError::PermissionDenied`]); the
/// kernel must not forge stores through read-only mappings.
pub fn copy_out(
    space: &AddressSpace,
    alloc: &FrameAllocator,
    dstva: VirtAddr,
    src: &[u8],
) -> MmResult {
    let walker = PageTableWalker::new();
    let mut dst = dstva.as_u64();
    let mut copied = 0usize;
    while copied < src.len() {
        let base = VirtAddr::new(dst).page_base();
        let pa0 = resolve_page(space, alloc, base)?;
        let entry = walker.entry(space.root(), base, None)?;
        if !entry.is_writable() {
            return Err(MmError::PermissionDenied);
        }

        let offset = VirtAddr::new(dst).page_offset();
        let n = ((PAGE_SIZE - offset) as usize).min(src.len() - copied);
        // SAFETY: the target page is live and the span stays inside it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                pa0.offset(offset).as_mut_ptr::<u8>(),
                n,
            );
        }
        copied += n;
        dst += n as u64;
    }
    Ok(())
}

/// Copy `dst.len()` bytes out of the user address space at `srcva`.
pub fn copy_in(
    space: &AddressSpace,
    alloc: &FrameAllocator,
    dst: &mut [u8],
    srcva: VirtAddr,
) -> MmResult {
    let mut src = srcva.as_u64();
    let mut copied = 0usize;
    while copied < dst.len() {
        let base = VirtAddr::new(src).page_base();
        let pa0 = resolve_page(space, alloc, base)?;

        let offset = VirtAddr::new(src).page_offset();
        let n = ((PAGE_SIZE - offset) as usize).min(dst.len() - copied);
        // SAFETY: the source page is live and the span stays inside it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                pa0.offset(offset).as_ptr::<u8>(),
                dst.as_mut_ptr().add(copied),
                n,
            );
        }
        copied += n;
        src += n as u64;
    }
    Ok(())
}

/// Copy a NUL-terminated string from `srcva` into `dst`, including the NUL.
///
/// Returns the number of bytes written. [`MmError::UnterminatedString`] when
/// `dst` fills up before a NUL appears.
pub fn copy_in_str(
    space: &AddressSpace,
    alloc: &FrameAllocator,
    dst: &mut [u8],
    srcva: VirtAddr,
) -> MmResult<usize> {
    let mut src = srcva.as_u64();
    let mut written = 0usize;
    while written < dst.len() {
        let base = VirtAddr::new(src).page_base();
        let pa0 = resolve_page(space, alloc, base)?;

        let offset = VirtAddr::new(src).page_offset();
        let n = ((PAGE_SIZE - offset) as usize).min(dst.len() - written);
        for i in 0..n {
            // SAFETY: in-bounds byte of a live page.
            let byte = unsafe { *pa0.offset(offset + i as u64).as_ptr::<u8>() };
            dst[written] = byte;
            written += 1;
            if byte == 0 {
                return Ok(written);
            }
        }
        src += n as u64;
    }
    Err(MmError::UnterminatedString)
}
