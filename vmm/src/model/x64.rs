//! 4-level long-mode page-table walker.

use bitflags::bitflags;

use super::{qword, MemoryModel, VirtToPhys};
use crate::map::{PteMap, PteMapEntry};
use crate::process::Process;
use crate::scatter::{page_base, PAGE_SIZE};
use crate::Vmm;

bitflags! {
    /// Page-table entry bits shared by the 64-bit and PAE formats.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const LARGE = 1 << 7;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Physical frame bits of a 64-bit entry.
pub(crate) const PG_FRAME: u64 = 0x0000_FFFF_FFFF_F000;

const ENTRIES: usize = 512;

/// Flag bits compared when merging adjacent PTE map ranges.
const MERGE_MASK: u64 =
    PteFlags::WRITABLE.bits() | PteFlags::USER.bits() | PteFlags::NO_EXECUTE.bits();

/// At most this many reverse-translation hits are collected per target.
const PHYS2VIRT_MAX_HITS: usize = 8;

/// The 64-bit 4-level memory model.
pub struct MemoryModelX64;

impl MemoryModelX64 {
    fn walk_map(
        &self,
        vmm: &Vmm,
        process: &Process,
        table_pa: u64,
        level: u32,
        va_base: u64,
        entries: &mut Vec<PteMapEntry>,
    ) {
        let Some(page) = vmm.tlb_page_table(table_pa, false) else {
            return;
        };
        let data = page.data();
        for i in 0..ENTRIES {
            let pte = qword(data, i * 8);
            if pte & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            if process.user_only && pte & PteFlags::USER.bits() == 0 {
                continue;
            }
            let shift = 12 + 9 * (level - 1);
            let mut va = va_base + ((i as u64) << shift);
            if level == 4 && va & (1 << 47) != 0 {
                va |= 0xFFFF_0000_0000_0000;
            }
            let large = pte & PteFlags::LARGE.bits() != 0;
            if level == 4 && large {
                continue;
            }
            if level == 1 || large {
                let pages = 1u64 << (9 * (level - 1));
                push_or_merge(entries, va, pages, pte);
            } else {
                self.walk_map(vmm, process, pte & PG_FRAME, level - 1, va, entries);
            }
        }
    }

    fn walk_phys2virt(
        &self,
        vmm: &Vmm,
        process: &Process,
        table_pa: u64,
        level: u32,
        va_base: u64,
        pa: u64,
        hits: &mut Vec<u64>,
    ) {
        if hits.len() >= PHYS2VIRT_MAX_HITS {
            return;
        }
        let Some(page) = vmm.tlb_page_table(table_pa, false) else {
            return;
        };
        let data = page.data();
        for i in 0..ENTRIES {
            if hits.len() >= PHYS2VIRT_MAX_HITS {
                return;
            }
            let pte = qword(data, i * 8);
            if pte & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            if process.user_only && pte & PteFlags::USER.bits() == 0 {
                continue;
            }
            let shift = 12 + 9 * (level - 1);
            let mut va = va_base + ((i as u64) << shift);
            if level == 4 && va & (1 << 47) != 0 {
                va |= 0xFFFF_0000_0000_0000;
            }
            let large = pte & PteFlags::LARGE.bits() != 0;
            if level == 4 && large {
                continue;
            }
            if level == 1 || large {
                let span = 1u64 << shift;
                let base = pte & PG_FRAME & !(span - 1);
                if pa >= base && pa < base + span {
                    hits.push(va | (pa - base));
                }
            } else {
                self.walk_phys2virt(vmm, process, pte & PG_FRAME, level - 1, va, pa, hits);
            }
        }
    }
}

impl MemoryModel for MemoryModelX64 {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn virt_to_phys(&self, vmm: &Vmm, process: &Process, va: u64) -> VirtToPhys {
        // Non-canonical addresses never map.
        let top = va & 0xFFFF_8000_0000_0000;
        if top != 0 && top != 0xFFFF_8000_0000_0000 {
            return VirtToPhys::NotMapped { pte: 0 };
        }
        let mut table_pa = process.dtb & !0xFFF;
        let mut level = 4u32;
        loop {
            let Some(page) = vmm.tlb_page_table(table_pa, false) else {
                return VirtToPhys::NotMapped { pte: 0 };
            };
            let shift = 12 + 9 * (level - 1);
            let idx = ((va >> shift) & 0x1FF) as usize;
            let pte = qword(page.data(), idx * 8);
            if pte & PteFlags::PRESENT.bits() == 0 {
                return VirtToPhys::NotMapped { pte };
            }
            if process.user_only && pte & PteFlags::USER.bits() == 0 {
                return VirtToPhys::NotMapped { pte };
            }
            let large = pte & PteFlags::LARGE.bits() != 0;
            if large {
                if level == 4 {
                    return VirtToPhys::NotMapped { pte };
                }
                let span = 1u64 << shift;
                let base = pte & PG_FRAME & !(span - 1);
                return VirtToPhys::Mapped(base + (va & (span - 1)));
            }
            if level == 1 {
                return VirtToPhys::Mapped((pte & PG_FRAME) | (va & 0xFFF));
            }
            table_pa = pte & PG_FRAME;
            level -= 1;
        }
    }

    fn page_table_verify(&self, vmm: &Vmm, page: &[u8], pa: u64, root: bool) -> bool {
        if page.len() != PAGE_SIZE {
            return false;
        }
        let pa_max = vmm.device_pa_max();
        let mut self_ref = false;
        for i in 0..ENTRIES {
            let pte = qword(page, i * 8);
            if pte & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let frame = pte & PG_FRAME;
            if frame >= pa_max {
                return false;
            }
            if frame == page_base(pa) {
                self_ref = true;
            }
        }
        // A long-mode directory table base maps itself.
        !root || self_ref
    }

    fn pte_map_initialize(&self, vmm: &Vmm, process: &Process) -> Option<PteMap> {
        let mut entries = Vec::new();
        self.walk_map(vmm, process, process.dtb & !0xFFF, 4, 0, &mut entries);
        Some(PteMap { entries })
    }

    fn phys_to_virt(&self, vmm: &Vmm, process: &Process, pa: u64) -> Vec<u64> {
        let mut hits = Vec::new();
        self.walk_phys2virt(vmm, process, process.dtb & !0xFFF, 4, 0, pa, &mut hits);
        hits
    }
}

pub(crate) fn push_or_merge(entries: &mut Vec<PteMapEntry>, va: u64, pages: u64, pte: u64) {
    if let Some(last) = entries.last_mut() {
        if last.va + last.pages * PAGE_SIZE as u64 == va && (last.pte ^ pte) & MERGE_MASK == 0 {
            last.pages += pages;
            return;
        }
    }
    entries.push(PteMapEntry { va, pages, pte });
}
