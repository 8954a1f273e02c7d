//! Page table entry layout, permission flags, and level arithmetic.
//!
//! The three-level scheme follows RISC-V Sv39: 512 eight-byte entries per
//! table, the physical page number in bits 10.. of each entry and the
//! permission flags in the low ten bits. An entry is exactly one of:
//!
//! - **Invalid**: `VALID` clear.
//! - **Interior**: `VALID` set, none of `R`/`W`/`X` — points to a child
//!   table.
//! - **Leaf**: `VALID` set plus at least one of `R`/`W`/`X` — maps a frame.
//!   A leaf at the middle level maps a 2 MiB superpage, at the bottom level
//!   a 4 KiB base page.

use bitflags::bitflags;
use kestrel_abi::{PhysAddr, VirtAddr};

bitflags! {
    /// Page table entry permission flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Entry is in use (bit 0).
        const VALID    = 1 << 0;
        /// Leaf is readable (bit 1).
        const READ     = 1 << 1;
        /// Leaf is writable (bit 2).
        const WRITE    = 1 << 2;
        /// Leaf is executable (bit 3).
        const EXEC     = 1 << 3;
        /// Leaf is accessible from user mode (bit 4).
        const USER     = 1 << 4;
        /// Not flushed on address-space switch (bit 5).
        const GLOBAL   = 1 << 5;
        /// Set by hardware when the page is read (bit 6).
        const ACCESSED = 1 << 6;
        /// Set by hardware when the page is written (bit 7).
        const DIRTY    = 1 << 7;

        /// Any-of mask distinguishing leaves from interior entries.
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Bit position of the physical page number within an entry.
const PTE_PPN_SHIFT: u64 = 10;

/// A single page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Build an entry from a frame address and flags.
    #[inline]
    pub const fn new(addr: PhysAddr, flags: PteFlags) -> Self {
        Self(((addr.as_u64() >> 12) << PTE_PPN_SHIFT) | flags.bits())
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// Valid and maps memory directly (has at least one of R/W/X).
    #[inline]
    pub const fn is_leaf(&self) -> bool {
        self.is_valid() && self.0 & PteFlags::RWX.bits() != 0
    }

    /// Valid and points to a child table.
    #[inline]
    pub const fn is_interior(&self) -> bool {
        self.is_valid() && self.0 & PteFlags::RWX.bits() == 0
    }

    #[inline]
    pub const fn is_user(&self) -> bool {
        self.0 & PteFlags::USER.bits() != 0
    }

    #[inline]
    pub const fn is_writable(&self) -> bool {
        self.0 & PteFlags::WRITE.bits() != 0
    }

    /// Physical address of the mapped frame or child table.
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr((self.0 >> PTE_PPN_SHIFT) << 12)
    }

    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PteFlags) {
        *self = Self::new(addr, flags);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:#x})", self.0)
    }
}

/// Depth of a table in the tree; `Two` is the root level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    Two = 2,
    One = 1,
    Zero = 0,
}

impl PageTableLevel {
    #[inline]
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::Two => Some(Self::One),
            Self::One => Some(Self::Zero),
            Self::Zero => None,
        }
    }

    /// Index of `vaddr` within a table at this level.
    #[inline]
    pub const fn index_of(self, vaddr: VirtAddr) -> usize {
        let shift = 12 + (self as u8 as u64) * 9;
        ((vaddr.as_u64() >> shift) & 0x1FF) as usize
    }

    /// Bytes spanned by one entry at this level.
    #[inline]
    pub const fn entry_size(self) -> u64 {
        1u64 << (12 + (self as u8 as u64) * 9)
    }

    /// Only the middle level carries superpage leaves.
    #[inline]
    pub const fn supports_super_leaf(self) -> bool {
        matches!(self, Self::One)
    }
}

impl core::fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "L{}", *self as u8)
    }
}

pub const PAGE_TABLE_ENTRIES: usize = 512;

/// A 512-entry page table node, one base frame in size.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const EMPTY: Self = Self {
        entries: [PageTableEntry::EMPTY; PAGE_TABLE_ENTRIES],
    };

    #[inline]
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_valid())
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::EMPTY);
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_abi::PAGE_SIZE;

    #[test]
    fn entry_round_trip() {
        let pa = PhysAddr::new(0x20_0000);
        let e = PageTableEntry::new(pa, PteFlags::VALID | PteFlags::READ | PteFlags::USER);
        assert!(e.is_valid());
        assert!(e.is_leaf());
        assert!(!e.is_interior());
        assert!(e.is_user());
        assert!(!e.is_writable());
        assert_eq!(e.addr(), pa);
    }

    #[test]
    fn interior_is_not_leaf() {
        let e = PageTableEntry::new(PhysAddr::new(0x1000), PteFlags::VALID);
        assert!(e.is_valid());
        assert!(e.is_interior());
        assert!(!e.is_leaf());
    }

    #[test]
    fn level_arithmetic() {
        let va = VirtAddr::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123);
        assert_eq!(PageTableLevel::Two.index_of(va), 3);
        assert_eq!(PageTableLevel::One.index_of(va), 5);
        assert_eq!(PageTableLevel::Zero.index_of(va), 7);
        assert_eq!(PageTableLevel::One.entry_size(), 0x20_0000);
        assert_eq!(PageTableLevel::Zero.entry_size(), PAGE_SIZE);
    }
}
