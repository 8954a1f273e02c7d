//! Human-readable page table dumps for debugging.

use core::fmt::{self, Write};

use kestrel_abi::PhysAddr;

use crate::direct::PhysAddrDirect;
use crate::paging::{PAGE_TABLE_ENTRIES, PageTable, PageTableLevel, PteFlags};

/// Write the whole table tree under `root`, one line per valid entry,
/// indented by depth:
///
/// ```text
/// page table 0x87f6b000
///  ..0x0: pte 0x21fd9c01 pa 0x87f67000 V----
///  .. ..0x0: pte 0x21fd9801 pa 0x87f66000 V----
///  .. .. ..0x0: pte 0x21fda01b pa 0x87f68000 VR-XU
/// ```
pub fn dump_page_table<W: fmt::Write>(out: &mut W, root: PhysAddr) -> fmt::Result {
    writeln!(out, "page table {:#x}", root.as_u64())?;
    dump_node(out, root, PageTableLevel::Two, 0)
}

fn dump_node(
    out: &mut dyn fmt::Write,
    table_pa: PhysAddr,
    level: PageTableLevel,
    base_va: u64,
) -> fmt::Result {
    let table: *const PageTable = table_pa.as_ptr();
    let depth = (PageTableLevel::Two as u8 - level as u8 + 1) as usize;
    for i in 0..PAGE_TABLE_ENTRIES {
        // SAFETY: reachable table nodes are live and directly addressable.
        let entry = unsafe { *(*table).entry(i) };
        if !entry.is_valid() {
            continue;
        }
        let va = base_va + i as u64 * level.entry_size();
        for _ in 0..depth {
            out.write_str(" ..")?;
        }
        writeln!(
            out,
            "{va:#x}: pte {:#x} pa {:#x} {}",
            entry.as_raw(),
            entry.addr().as_u64(),
            FlagString(entry.flags())
        )?;
        if entry.is_interior() {
            if let Some(next) = level.next_lower() {
                dump_node(out, entry.addr(), next, va)?;
            }
        }
    }
    Ok(())
}

/// `VRWXU` with dashes for the bits that are clear.
struct FlagString(PteFlags);

impl fmt::Display for FlagString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const BITS: [(PteFlags, char); 5] = [
            (PteFlags::VALID, 'V'),
            (PteFlags::READ, 'R'),
            (PteFlags::WRITE, 'W'),
            (PteFlags::EXEC, 'X'),
            (PteFlags::USER, 'U'),
        ];
        for (bit, c) in BITS {
            f.write_char(if self.0.contains(bit) { c } else { '-' })?;
        }
        Ok(())
    }
}
