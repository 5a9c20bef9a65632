//! Pluggable memory models.
//!
//! A memory model encapsulates everything the engine needs to know about one
//! page-table format: virtual-to-physical translation, paged-memory
//! recovery, page-table sanity checking and PTE map construction. The engine
//! never branches on the concrete architecture; it holds a trait object and
//! calls through the interface.

mod x64;
mod x86;
mod x86pae;

pub use x64::MemoryModelX64;
pub use x86::MemoryModelX86;
pub use x86pae::MemoryModelX86Pae;

use crate::map::PteMap;
use crate::process::Process;
use crate::scatter::VmmFlags;
use crate::Vmm;

/// Outcome of a translation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtToPhys {
    /// Mapped; physical address including the in-page offset.
    Mapped(u64),
    /// Not mapped; carries the terminating page-table entry (0 when the walk
    /// failed before reaching an entry). Paged-memory decoding starts from
    /// this value.
    NotMapped { pte: u64 },
}

/// Outcome of a paged-memory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagedRead {
    /// The destination buffer was filled in place.
    Direct,
    /// The page is readable at a different physical address.
    Redirect(u64),
    /// The page cannot be recovered.
    Fail,
}

/// One page-table format.
pub trait MemoryModel: Send + Sync {
    /// Short architecture name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Translate a virtual address for `process`.
    fn virt_to_phys(&self, vmm: &Vmm, process: &Process, va: u64) -> VirtToPhys;

    /// Attempt to recover a paged-out page.
    ///
    /// `pte` is the terminating entry from a failed translation (or the PTE
    /// address itself under `ALTADDR_VA_PTE`, in which case `va` is 0).
    /// `dst` is absent when the caller only needs a physical redirection, as
    /// in the write path. The default declines.
    fn paged_read(
        &self,
        vmm: &Vmm,
        process: &Process,
        va: u64,
        pte: u64,
        dst: Option<&mut [u8]>,
        flags: VmmFlags,
    ) -> PagedRead {
        let _ = (vmm, process, va, pte, dst, flags);
        PagedRead::Fail
    }

    /// Sanity-check a candidate page-table page.
    ///
    /// `root` marks a directory-table-base candidate, which may carry
    /// stricter requirements (the 4-level format demands a self-referencing
    /// entry there).
    fn page_table_verify(&self, vmm: &Vmm, page: &[u8], pa: u64, root: bool) -> bool;

    /// Build the PTE map of `process` by walking its page tables.
    fn pte_map_initialize(&self, vmm: &Vmm, process: &Process) -> Option<PteMap>;

    /// Virtual addresses of `process` that translate onto the page of `pa`.
    fn phys_to_virt(&self, vmm: &Vmm, process: &Process, pa: u64) -> Vec<u64>;

    /// Release model-private state. The default has none.
    fn close(&self) {}
}

/// Read a little-endian quadword out of a table page.
#[inline]
pub(crate) fn qword(page: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&page[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Read a little-endian doubleword out of a table page.
#[inline]
pub(crate) fn dword(page: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&page[off..off + 4]);
    u32::from_le_bytes(b)
}
