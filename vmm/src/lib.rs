//! Process-aware memory access engine.
//!
//! `ramview-vmm` exposes the memory of a live or captured target machine as
//! an ordered, process-aware view: given a process, a virtual address and a
//! length, it returns the bytes. Underneath sits a three-tier page cache
//! (physical pages, page-table pages, paged-out pages) over a batched
//! physical transport, a translation layer walking the target's own page
//! tables, a scatter read/write pipeline with speculative readahead, a
//! generational process table and a fixed work pool for parallel per-process
//! actions.
//!
//! The engine holds no global state; everything hangs off an explicit
//! [`Vmm`] handle:
//!
//! ```no_run
//! use ramview_vmm::{BufferDevice, MemoryModelX64, Vmm, VmmConfig};
//!
//! let image = std::fs::read("memory.raw").unwrap();
//! let vmm = Vmm::new(VmmConfig::new(
//!     Box::new(BufferDevice::new(image)),
//!     Box::new(MemoryModelX64),
//! ));
//! let mut buf = [0u8; 0x100];
//! let read = vmm.read_ex(None, 0x1000, &mut buf, Default::default());
//! assert!(read <= buf.len());
//! ```

mod access;
mod cache;
mod device;
mod error;
mod map;
mod model;
mod process;
mod scatter;
mod sync;
mod work;

pub use cache::{CacheTable, CacheTag, PageRef, CACHE_MAX_ENTRIES};
pub use device::{BufferDevice, MemDevice};
pub use error::{VmmError, VmmResult};
pub use map::{
    HandleMap, HandleMapEntry, HeapMap, HeapMapEntry, ModuleMap, ModuleMapEntry, PteMap,
    PteMapEntry, ThreadMap, ThreadMapEntry, VadMap, VadMapEntry,
};
pub use model::{
    MemoryModel, MemoryModelX64, MemoryModelX86, MemoryModelX86Pae, PagedRead, VirtToPhys,
};
pub use process::{
    OsIntegration, Phys2VirtInfo, Process, ProcessPersistent, ProcessTable, ProcessToken,
    PID_CLONE_WITH_KERNELMEMORY, PROCESS_TABLE_ENTRIES_MAX,
};
pub use scatter::{page_base, page_offset, MemScatter, VmmFlags, ADDR_INVALID, PAGE_SIZE};
pub use sync::Event;
pub use work::{WorkPool, WORK_POOL_THREADS};

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

/// Engine construction parameters.
pub struct VmmConfig {
    /// Backing physical transport.
    pub device: Box<dyn MemDevice>,
    /// Page-table format of the target.
    pub model: Box<dyn MemoryModel>,
    /// Optional OS-specific enumeration hooks.
    pub os: Option<Box<dyn OsIntegration>>,
    /// Flags OR-ed into every call.
    pub default_flags: VmmFlags,
    /// Descriptor arena bound per cache tier.
    pub cache_max_entries: u32,
    /// Work pool size.
    pub worker_threads: usize,
}

impl VmmConfig {
    pub fn new(device: Box<dyn MemDevice>, model: Box<dyn MemoryModel>) -> Self {
        Self {
            device,
            model,
            os: None,
            default_flags: VmmFlags::empty(),
            cache_max_entries: CACHE_MAX_ENTRIES,
            worker_threads: WORK_POOL_THREADS,
        }
    }

    pub fn os(mut self, os: Box<dyn OsIntegration>) -> Self {
        self.os = Some(os);
        self
    }

    pub fn default_flags(mut self, flags: VmmFlags) -> Self {
        self.default_flags = flags;
        self
    }
}

/// Interlocked pipeline counters. Authoritative for diagnostics; a partial
/// read is normal operation, not an error.
#[derive(Default)]
pub(crate) struct VmmStats {
    pub phys_cache_hit: AtomicU64,
    pub phys_read_success: AtomicU64,
    pub phys_read_fail: AtomicU64,
    pub phys_write: AtomicU64,
    pub tlb_cache_hit: AtomicU64,
    pub tlb_read_success: AtomicU64,
    pub tlb_read_fail: AtomicU64,
    pub process_refresh: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmmStatsSnapshot {
    pub phys_cache_hit: u64,
    pub phys_read_success: u64,
    pub phys_read_fail: u64,
    pub phys_write: u64,
    pub tlb_cache_hit: u64,
    pub tlb_read_success: u64,
    pub tlb_read_fail: u64,
    pub process_refresh: u64,
}

/// The memory access engine.
///
/// Cheap to share behind [`Arc`]; all operations take `&self`. [`Vmm::close`]
/// (or drop) tears down the work pool, the memory model and the caches, in
/// that order; operations on a closed engine degrade to no-ops and misses.
pub struct Vmm {
    pub(crate) device: Box<dyn MemDevice>,
    pub(crate) model: Box<dyn MemoryModel>,
    pub(crate) os: Option<Box<dyn OsIntegration>>,
    pub(crate) cache_phys: CacheTable,
    pub(crate) cache_tlb: CacheTable,
    pub(crate) cache_paging: CacheTable,
    pub(crate) proc_container: RwLock<Arc<ProcessTable>>,
    pub(crate) work: Arc<WorkPool>,
    /// Serializes one-shot lazy initializations, token state in particular.
    pub(crate) lock_master: Mutex<()>,
    pub(crate) default_flags: VmmFlags,
    pub(crate) stats: VmmStats,
    active: AtomicBool,
}

impl Vmm {
    /// Bring up the engine: process table, the three cache tiers, then the
    /// work pool.
    pub fn new(config: VmmConfig) -> Arc<Self> {
        let vmm = Arc::new(Self {
            device: config.device,
            model: config.model,
            os: config.os,
            cache_phys: CacheTable::new(CacheTag::Phys, config.cache_max_entries),
            cache_tlb: CacheTable::new(CacheTag::Tlb, config.cache_max_entries),
            cache_paging: CacheTable::new(CacheTag::Paging, config.cache_max_entries),
            proc_container: RwLock::new(Arc::new(ProcessTable::new())),
            work: WorkPool::new(config.worker_threads),
            lock_master: Mutex::new(()),
            default_flags: config.default_flags,
            stats: VmmStats::default(),
            active: AtomicBool::new(true),
        });
        debug!("vmm: initialized ({} model)", vmm.model.name());
        vmm
    }

    /// Flags OR-ed into every call.
    pub fn default_flags(&self) -> VmmFlags {
        self.default_flags
    }

    /// Architecture name of the active memory model.
    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> VmmStatsSnapshot {
        VmmStatsSnapshot {
            phys_cache_hit: self.stats.phys_cache_hit.load(Ordering::Relaxed),
            phys_read_success: self.stats.phys_read_success.load(Ordering::Relaxed),
            phys_read_fail: self.stats.phys_read_fail.load(Ordering::Relaxed),
            phys_write: self.stats.phys_write.load(Ordering::Relaxed),
            tlb_cache_hit: self.stats.tlb_cache_hit.load(Ordering::Relaxed),
            tlb_read_success: self.stats.tlb_read_success.load(Ordering::Relaxed),
            tlb_read_fail: self.stats.tlb_read_fail.load(Ordering::Relaxed),
            process_refresh: self.stats.process_refresh.load(Ordering::Relaxed),
        }
    }

    /// Tear down: work pool first, then the memory model, then the caches.
    /// Idempotent; also run on drop.
    pub fn close(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.work.close();
        self.model.close();
        *self.proc_container.write() = Arc::new(ProcessTable::new());
        self.cache_phys.close();
        self.cache_tlb.close();
        self.cache_paging.close();
        debug!("vmm: closed");
    }
}

impl Drop for Vmm {
    fn drop(&mut self) {
        self.close();
    }
}
