//! Legacy 32-bit 2-level page-table walker.

use super::x64::{push_or_merge, PteFlags};
use super::{dword, MemoryModel, VirtToPhys};
use crate::map::PteMap;
use crate::process::Process;
use crate::scatter::PAGE_SIZE;
use crate::Vmm;

const ENTRIES: usize = 1024;
const PG_FRAME32: u32 = 0xFFFF_F000;
/// 4 MiB page base bits of a PSE directory entry.
const PG_FRAME_LARGE32: u32 = 0xFFC0_0000;

/// The 32-bit non-PAE memory model.
pub struct MemoryModelX86;

impl MemoryModel for MemoryModelX86 {
    fn name(&self) -> &'static str {
        "x86"
    }

    fn virt_to_phys(&self, vmm: &Vmm, process: &Process, va: u64) -> VirtToPhys {
        if va > u32::MAX as u64 {
            return VirtToPhys::NotMapped { pte: 0 };
        }
        let va = va as u32;
        let Some(pd) = vmm.tlb_page_table(process.dtb & !0xFFF, false) else {
            return VirtToPhys::NotMapped { pte: 0 };
        };
        let pde = dword(pd.data(), ((va >> 22) as usize) * 4);
        if pde & PteFlags::PRESENT.bits() as u32 == 0 {
            return VirtToPhys::NotMapped { pte: pde as u64 };
        }
        if process.user_only && pde & PteFlags::USER.bits() as u32 == 0 {
            return VirtToPhys::NotMapped { pte: pde as u64 };
        }
        if pde & PteFlags::LARGE.bits() as u32 != 0 {
            let base = (pde & PG_FRAME_LARGE32) as u64;
            return VirtToPhys::Mapped(base + (va & 0x3F_FFFF) as u64);
        }
        let Some(pt) = vmm.tlb_page_table((pde & PG_FRAME32) as u64, false) else {
            return VirtToPhys::NotMapped { pte: pde as u64 };
        };
        let pte = dword(pt.data(), (((va >> 12) & 0x3FF) as usize) * 4);
        if pte & PteFlags::PRESENT.bits() as u32 == 0 {
            return VirtToPhys::NotMapped { pte: pte as u64 };
        }
        if process.user_only && pte & PteFlags::USER.bits() as u32 == 0 {
            return VirtToPhys::NotMapped { pte: pte as u64 };
        }
        VirtToPhys::Mapped(((pte & PG_FRAME32) as u64) | (va & 0xFFF) as u64)
    }

    fn page_table_verify(&self, vmm: &Vmm, page: &[u8], _pa: u64, _root: bool) -> bool {
        if page.len() != PAGE_SIZE {
            return false;
        }
        let pa_max = vmm.device_pa_max();
        for i in 0..ENTRIES {
            let e = dword(page, i * 4);
            if e & PteFlags::PRESENT.bits() as u32 == 0 {
                continue;
            }
            let base = if e & PteFlags::LARGE.bits() as u32 != 0 {
                (e & PG_FRAME_LARGE32) as u64
            } else {
                (e & PG_FRAME32) as u64
            };
            if base >= pa_max {
                return false;
            }
        }
        true
    }

    fn pte_map_initialize(&self, vmm: &Vmm, process: &Process) -> Option<PteMap> {
        let mut entries = Vec::new();
        let pd = vmm.tlb_page_table(process.dtb & !0xFFF, false)?;
        for i in 0..ENTRIES {
            let pde = dword(pd.data(), i * 4);
            if pde & PteFlags::PRESENT.bits() as u32 == 0 {
                continue;
            }
            if process.user_only && pde & PteFlags::USER.bits() as u32 == 0 {
                continue;
            }
            let va = (i as u64) << 22;
            if pde & PteFlags::LARGE.bits() as u32 != 0 {
                push_or_merge(&mut entries, va, 0x400, pde as u64);
                continue;
            }
            let Some(pt) = vmm.tlb_page_table((pde & PG_FRAME32) as u64, false) else {
                continue;
            };
            for j in 0..ENTRIES {
                let pte = dword(pt.data(), j * 4);
                if pte & PteFlags::PRESENT.bits() as u32 == 0 {
                    continue;
                }
                if process.user_only && pte & PteFlags::USER.bits() as u32 == 0 {
                    continue;
                }
                push_or_merge(&mut entries, va + ((j as u64) << 12), 1, pte as u64);
            }
        }
        Some(PteMap { entries })
    }

    fn phys_to_virt(&self, vmm: &Vmm, process: &Process, pa: u64) -> Vec<u64> {
        let mut hits = Vec::new();
        let Some(pd) = vmm.tlb_page_table(process.dtb & !0xFFF, false) else {
            return hits;
        };
        for i in 0..ENTRIES {
            if hits.len() >= 8 {
                break;
            }
            let pde = dword(pd.data(), i * 4);
            if pde & PteFlags::PRESENT.bits() as u32 == 0 {
                continue;
            }
            let va = (i as u64) << 22;
            if pde & PteFlags::LARGE.bits() as u32 != 0 {
                let base = (pde & PG_FRAME_LARGE32) as u64;
                if pa >= base && pa < base + 0x40_0000 {
                    hits.push(va | (pa - base));
                }
                continue;
            }
            let Some(pt) = vmm.tlb_page_table((pde & PG_FRAME32) as u64, false) else {
                continue;
            };
            for j in 0..ENTRIES {
                let pte = dword(pt.data(), j * 4);
                if pte & PteFlags::PRESENT.bits() as u32 == 0 {
                    continue;
                }
                if (pte & PG_FRAME32) as u64 == pa & !0xFFF {
                    hits.push(va + ((j as u64) << 12) | (pa & 0xFFF));
                    if hits.len() >= 8 {
                        break;
                    }
                }
            }
        }
        hits
    }
}
