pub mod defs;
pub mod walker;

pub use defs::{PAGE_TABLE_ENTRIES, PageTable, PageTableEntry, PageTableLevel, PteFlags};
pub use walker::{DirectMapping, FrameMapping, PageTableWalker};
