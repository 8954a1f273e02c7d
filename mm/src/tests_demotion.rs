//! Superpage demotion: partial unmaps must preserve the surviving slices.

use kestrel_abi::{PAGE_SIZE, SUPER_PAGE_SIZE, VirtAddr};

use crate::address_space::AddressSpace;
use crate::mapping::unmap_pages;
use crate::paging::{PageTableWalker, PteFlags};
use crate::test_fixtures::TestRig;
use crate::user_copy::{copy_in, copy_out};

const MIB: u64 = 1 << 20;

fn grown_superpage_space(rig: &TestRig) -> AddressSpace {
    let mut space = AddressSpace::new(&rig.alloc).unwrap();
    space
        .grow(&rig.alloc, SUPER_PAGE_SIZE, PteFlags::WRITE)
        .unwrap();
    assert!(rig.alloc.is_super(space.translate(VirtAddr::new(0)).unwrap()));
    space
}

#[test]
fn shrink_demotes_a_straddled_superpage() {
    let rig = TestRig::new();
    let mut space = grown_superpage_space(&rig);
    copy_out(&space, &rig.alloc, VirtAddr::new(0x1000), b"low").unwrap();
    copy_out(&space, &rig.alloc, VirtAddr::new(MIB + 0x10), b"high").unwrap();

    let super_before = rig.alloc.free_super_count();
    let base_before = rig.alloc.free_base_count();
    assert_eq!(space.shrink(&rig.alloc, MIB), MIB);

    // The superpage is back on its pool; the surviving megabyte now costs
    // 256 base frames plus one table node.
    assert_eq!(rig.alloc.free_super_count(), super_before + 1);
    assert_eq!(rig.alloc.free_base_count(), base_before - 257);

    let pa = space.translate(VirtAddr::new(0x1000)).unwrap();
    assert!(!rig.alloc.is_super(pa));
    let mut buf = [0u8; 3];
    copy_in(&space, &rig.alloc, &mut buf, VirtAddr::new(0x1000)).unwrap();
    assert_eq!(&buf, b"low");

    assert!(!space.is_mapped(VirtAddr::new(MIB)));
    assert_eq!(space.translate(VirtAddr::new(MIB + 0x10)), None);
}

#[test]
fn demoted_pages_keep_their_permissions() {
    let rig = TestRig::new();
    let mut space = grown_superpage_space(&rig);
    space.shrink(&rig.alloc, MIB);

    let walker = PageTableWalker::new();
    let entry = walker.entry(space.root(), VirtAddr::new(0), None).unwrap();
    assert!(entry.is_leaf());
    assert!(
        entry
            .flags()
            .contains(PteFlags::READ | PteFlags::WRITE | PteFlags::USER)
    );
    // Demoted pages stay writable end to end.
    copy_out(&space, &rig.alloc, VirtAddr::new(0x2000), b"w").unwrap();
}

#[test]
fn fully_covered_superpage_is_freed_without_demotion() {
    let rig = TestRig::new();
    let mut space = grown_superpage_space(&rig);

    let super_before = rig.alloc.free_super_count();
    let base_before = rig.alloc.free_base_count();
    space.shrink(&rig.alloc, 0);

    assert_eq!(rig.alloc.free_super_count(), super_before + 1);
    // No copies, no extra table node.
    assert_eq!(rig.alloc.free_base_count(), base_before);
    assert!(!space.is_mapped(VirtAddr::new(0)));
}

#[test]
fn grazing_unmap_keeps_both_flanks() {
    let rig = TestRig::new();
    let space = grown_superpage_space(&rig);
    copy_out(&space, &rig.alloc, VirtAddr::new(0x1000), b"below").unwrap();
    copy_out(&space, &rig.alloc, VirtAddr::new(MIB + 256 * 1024), b"above").unwrap();

    // Punch a 256 KiB hole starting at 1 MiB.
    let walker = PageTableWalker::new();
    unmap_pages(
        &walker,
        &rig.alloc,
        space.root(),
        VirtAddr::new(MIB),
        256 * 1024 / PAGE_SIZE,
        true,
    );

    assert!(!space.is_mapped(VirtAddr::new(MIB)));
    assert!(!space.is_mapped(VirtAddr::new(MIB + 256 * 1024 - PAGE_SIZE)));

    let mut buf = [0u8; 5];
    copy_in(&space, &rig.alloc, &mut buf, VirtAddr::new(0x1000)).unwrap();
    assert_eq!(&buf, b"below");
    copy_in(&space, &rig.alloc, &mut buf, VirtAddr::new(MIB + 256 * 1024)).unwrap();
    assert_eq!(&buf, b"above");
}
