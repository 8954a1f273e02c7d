//! Exhaustion behavior: graceful errors, clean rollback, full recovery.

use kestrel_abi::{PAGE_SIZE, SUPER_PAGE_SIZE, VirtAddr};

use crate::address_space::AddressSpace;
use crate::error::MmError;
use crate::fault::handle_fault;
use crate::paging::PteFlags;
use crate::test_fixtures::TestRig;
use crate::user_copy::copy_in;

/// Rig with a base pool of roughly `pages` frames and no super pool.
fn small_rig(pages: u64) -> TestRig {
    TestRig::with_pools(pages * PAGE_SIZE, 0)
}

fn drain(rig: &TestRig) -> Vec<kestrel_abi::PhysAddr> {
    let mut held = Vec::new();
    while let Some(pa) = rig.alloc.alloc_base() {
        held.push(pa);
    }
    held
}

#[test]
fn base_pool_exhausts_and_recovers() {
    let rig = small_rig(16);
    let total = rig.alloc.free_base_count();
    assert!(total > 0);

    let held = drain(&rig);
    assert_eq!(held.len(), total);
    assert_eq!(rig.alloc.free_base_count(), 0);

    for pa in held {
        rig.alloc.free(pa);
    }
    assert_eq!(rig.alloc.free_base_count(), total);
    assert!(rig.alloc.alloc_base().is_some());
}

#[test]
fn empty_super_pool_just_returns_none() {
    let rig = small_rig(16);
    assert_eq!(rig.alloc.free_super_count(), 0);
    assert!(rig.alloc.alloc_super().is_none());
}

#[test]
fn grow_rolls_back_on_exhaustion() {
    let rig = small_rig(64);
    let mut space = AddressSpace::new(&rig.alloc).unwrap();
    let free_before = rig.alloc.free_base_count();

    // More pages than the pool can hold.
    let want = (free_before as u64 + 16) * PAGE_SIZE;
    assert_eq!(
        space.grow(&rig.alloc, want, PteFlags::WRITE),
        Err(MmError::NoMemory)
    );
    assert_eq!(space.size, 0);
    assert!(!space.is_mapped(VirtAddr::new(0)));
    // Every mapped frame came back; only the two interior nodes built on the
    // way down are still held, and destroy returns those too.
    assert_eq!(rig.alloc.free_base_count(), free_before - 2);

    space.destroy(&rig.alloc);
    assert_eq!(rig.alloc.free_base_count(), free_before + 1);
}

#[test]
fn grow_falls_back_to_base_pages_when_supers_run_out() {
    let rig = TestRig::with_pools(4 * SUPER_PAGE_SIZE, SUPER_PAGE_SIZE);
    assert_eq!(rig.alloc.free_super_count(), 1);

    let mut space = AddressSpace::new(&rig.alloc).unwrap();
    space
        .grow(&rig.alloc, 2 * SUPER_PAGE_SIZE, PteFlags::WRITE)
        .unwrap();
    assert_eq!(space.size, 2 * SUPER_PAGE_SIZE);
    assert_eq!(rig.alloc.free_super_count(), 0);

    let first = space.translate(VirtAddr::new(0)).unwrap();
    let second = space.translate(VirtAddr::new(SUPER_PAGE_SIZE)).unwrap();
    assert!(rig.alloc.is_super(first));
    assert!(!rig.alloc.is_super(second));
    // Base-page granularity in the fallback stretch.
    assert_eq!(
        space.translate(VirtAddr::new(SUPER_PAGE_SIZE + PAGE_SIZE))
            .map(|pa| pa.as_u64() % PAGE_SIZE),
        Some(0)
    );
}

#[test]
fn fault_fails_closed_on_exhaustion() {
    let rig = small_rig(16);
    let mut space = AddressSpace::new(&rig.alloc).unwrap();
    space.size = PAGE_SIZE;

    let held = drain(&rig);
    assert_eq!(handle_fault(&space, &rig.alloc, VirtAddr::new(0), false), None);

    for pa in held {
        rig.alloc.free(pa);
    }
    assert!(handle_fault(&space, &rig.alloc, VirtAddr::new(0), false).is_some());
}

#[test]
fn duplicate_failure_leaves_the_source_intact() {
    let rig = small_rig(32);
    let mut space = AddressSpace::new(&rig.alloc).unwrap();
    space
        .grow(&rig.alloc, 16 * PAGE_SIZE, PteFlags::WRITE)
        .unwrap();
    crate::user_copy::copy_out(&space, &rig.alloc, VirtAddr::new(0x20), b"still here").unwrap();

    let free_before = rig.alloc.free_base_count();
    assert!(matches!(
        space.duplicate(&rig.alloc),
        Err(MmError::NoMemory)
    ));
    // The partial copy was torn down completely.
    assert_eq!(rig.alloc.free_base_count(), free_before);

    let mut buf = [0u8; 10];
    copy_in(&space, &rig.alloc, &mut buf, VirtAddr::new(0x20)).unwrap();
    assert_eq!(&buf, b"still here");
}
