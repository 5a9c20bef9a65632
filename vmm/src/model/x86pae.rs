//! 32-bit PAE 3-level page-table walker.
//!
//! The top level is a 4-entry directory-pointer table aligned to 32 bytes,
//! usually embedded inside a larger page. Lower levels use 512-entry tables
//! of 64-bit entries, as in long mode.

use super::x64::{push_or_merge, PteFlags, PG_FRAME};
use super::{qword, MemoryModel, VirtToPhys};
use crate::map::PteMap;
use crate::process::Process;
use crate::scatter::{page_base, page_offset, PAGE_SIZE};
use crate::Vmm;

const ENTRIES: usize = 512;
const PDPTE_COUNT: usize = 4;
/// Low reserved bits of a PDPTE; must be clear in a valid entry.
const PDPTE_RESERVED: u64 = 0x06;

/// The 32-bit PAE memory model.
pub struct MemoryModelX86Pae;

impl MemoryModelX86Pae {
    /// Read the four directory-pointer entries. The table is 32-byte aligned
    /// and may sit anywhere inside its page.
    fn pdpt(&self, vmm: &Vmm, dtb: u64) -> Option<[u64; PDPTE_COUNT]> {
        let page = vmm.tlb_page_table(page_base(dtb), false)?;
        let off = page_offset(dtb & !0x1F);
        let data = page.data();
        let mut e = [0u64; PDPTE_COUNT];
        for (i, slot) in e.iter_mut().enumerate() {
            *slot = qword(data, off + i * 8);
        }
        Some(e)
    }
}

impl MemoryModel for MemoryModelX86Pae {
    fn name(&self) -> &'static str {
        "x86pae"
    }

    fn virt_to_phys(&self, vmm: &Vmm, process: &Process, va: u64) -> VirtToPhys {
        if va > u32::MAX as u64 {
            return VirtToPhys::NotMapped { pte: 0 };
        }
        let Some(pdpt) = self.pdpt(vmm, process.dtb) else {
            return VirtToPhys::NotMapped { pte: 0 };
        };
        let pdpte = pdpt[((va >> 30) & 3) as usize];
        if pdpte & PteFlags::PRESENT.bits() == 0 || pdpte & PDPTE_RESERVED != 0 {
            return VirtToPhys::NotMapped { pte: pdpte };
        }
        let Some(pd) = vmm.tlb_page_table(pdpte & PG_FRAME, false) else {
            return VirtToPhys::NotMapped { pte: pdpte };
        };
        let pde = qword(pd.data(), (((va >> 21) & 0x1FF) as usize) * 8);
        if pde & PteFlags::PRESENT.bits() == 0 {
            return VirtToPhys::NotMapped { pte: pde };
        }
        if process.user_only && pde & PteFlags::USER.bits() == 0 {
            return VirtToPhys::NotMapped { pte: pde };
        }
        if pde & PteFlags::LARGE.bits() != 0 {
            let base = pde & PG_FRAME & !0x1F_FFFF;
            return VirtToPhys::Mapped(base + (va & 0x1F_FFFF));
        }
        let Some(pt) = vmm.tlb_page_table(pde & PG_FRAME, false) else {
            return VirtToPhys::NotMapped { pte: pde };
        };
        let pte = qword(pt.data(), (((va >> 12) & 0x1FF) as usize) * 8);
        if pte & PteFlags::PRESENT.bits() == 0 {
            return VirtToPhys::NotMapped { pte };
        }
        if process.user_only && pte & PteFlags::USER.bits() == 0 {
            return VirtToPhys::NotMapped { pte };
        }
        VirtToPhys::Mapped((pte & PG_FRAME) | (va & 0xFFF))
    }

    fn page_table_verify(&self, vmm: &Vmm, page: &[u8], pa: u64, root: bool) -> bool {
        if page.len() != PAGE_SIZE {
            return false;
        }
        let pa_max = vmm.device_pa_max();
        if root {
            // Only the four directory-pointer entries are meaningful.
            let off = page_offset(pa & !0x1F);
            let mut present = 0;
            for i in 0..PDPTE_COUNT {
                let e = qword(page, off + i * 8);
                if e & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                if e & PDPTE_RESERVED != 0 || e & PG_FRAME >= pa_max {
                    return false;
                }
                present += 1;
            }
            return present > 0;
        }
        for i in 0..ENTRIES {
            let e = qword(page, i * 8);
            if e & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            if e & PG_FRAME >= pa_max {
                return false;
            }
        }
        true
    }

    fn pte_map_initialize(&self, vmm: &Vmm, process: &Process) -> Option<PteMap> {
        let mut entries = Vec::new();
        let pdpt = self.pdpt(vmm, process.dtb)?;
        for (k, &pdpte) in pdpt.iter().enumerate() {
            if pdpte & PteFlags::PRESENT.bits() == 0 || pdpte & PDPTE_RESERVED != 0 {
                continue;
            }
            let Some(pd) = vmm.tlb_page_table(pdpte & PG_FRAME, false) else {
                continue;
            };
            for i in 0..ENTRIES {
                let pde = qword(pd.data(), i * 8);
                if pde & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                if process.user_only && pde & PteFlags::USER.bits() == 0 {
                    continue;
                }
                let va = ((k as u64) << 30) + ((i as u64) << 21);
                if pde & PteFlags::LARGE.bits() != 0 {
                    push_or_merge(&mut entries, va, 0x200, pde);
                    continue;
                }
                let Some(pt) = vmm.tlb_page_table(pde & PG_FRAME, false) else {
                    continue;
                };
                for j in 0..ENTRIES {
                    let pte = qword(pt.data(), j * 8);
                    if pte & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    if process.user_only && pte & PteFlags::USER.bits() == 0 {
                        continue;
                    }
                    push_or_merge(&mut entries, va + ((j as u64) << 12), 1, pte);
                }
            }
        }
        Some(PteMap { entries })
    }

    fn phys_to_virt(&self, vmm: &Vmm, process: &Process, pa: u64) -> Vec<u64> {
        let mut hits = Vec::new();
        let Some(pdpt) = self.pdpt(vmm, process.dtb) else {
            return hits;
        };
        for (k, &pdpte) in pdpt.iter().enumerate() {
            if hits.len() >= 8 {
                break;
            }
            if pdpte & PteFlags::PRESENT.bits() == 0 || pdpte & PDPTE_RESERVED != 0 {
                continue;
            }
            let Some(pd) = vmm.tlb_page_table(pdpte & PG_FRAME, false) else {
                continue;
            };
            for i in 0..ENTRIES {
                if hits.len() >= 8 {
                    break;
                }
                let pde = qword(pd.data(), i * 8);
                if pde & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let va = ((k as u64) << 30) + ((i as u64) << 21);
                if pde & PteFlags::LARGE.bits() != 0 {
                    let base = pde & PG_FRAME & !0x1F_FFFF;
                    if pa >= base && pa < base + 0x20_0000 {
                        hits.push(va | (pa - base));
                    }
                    continue;
                }
                let Some(pt) = vmm.tlb_page_table(pde & PG_FRAME, false) else {
                    continue;
                };
                for j in 0..ENTRIES {
                    let pte = qword(pt.data(), j * 8);
                    if pte & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    if pte & PG_FRAME == page_base(pa) {
                        hits.push((va + ((j as u64) << 12)) | (pa & 0xFFF));
                        if hits.len() >= 8 {
                            break;
                        }
                    }
                }
            }
        }
        hits
    }
}
