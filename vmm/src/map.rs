//! Per-process map objects.
//!
//! Maps are immutable once published and shared by reference. The PTE map is
//! built by the memory model; the remaining maps come from the optional
//! OS-integration layer. All builders run under the owning process's build
//! lock and are invoked lazily on first access.

use std::sync::Arc;

use crate::process::Process;
use crate::Vmm;

/// One mapped virtual range, produced by a page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteMapEntry {
    pub va: u64,
    /// Number of 4 KiB pages in the range.
    pub pages: u64,
    /// Representative page-table entry (flag bits are uniform across the
    /// merged range).
    pub pte: u64,
}

/// Hardware page-table map of a process, ordered by virtual address.
#[derive(Debug, Default)]
pub struct PteMap {
    pub entries: Vec<PteMapEntry>,
}

impl PteMap {
    /// Entry covering `va`, if any.
    pub fn find(&self, va: u64) -> Option<&PteMapEntry> {
        let i = self
            .entries
            .partition_point(|e| e.va + e.pages * 0x1000 <= va);
        self.entries.get(i).filter(|e| e.va <= va)
    }
}

/// One virtual address descriptor.
#[derive(Debug, Clone)]
pub struct VadMapEntry {
    pub va_start: u64,
    /// Inclusive end of the described range.
    pub va_end: u64,
    pub protection: u32,
    pub text: Option<String>,
}

/// Virtual-address-descriptor map, ordered by start address.
#[derive(Debug, Default)]
pub struct VadMap {
    pub entries: Vec<VadMapEntry>,
}

impl VadMap {
    pub fn find(&self, va: u64) -> Option<&VadMapEntry> {
        let i = self.entries.partition_point(|e| e.va_end < va);
        self.entries.get(i).filter(|e| e.va_start <= va)
    }
}

/// One loaded module.
#[derive(Debug, Clone)]
pub struct ModuleMapEntry {
    pub base: u64,
    pub size: u64,
    pub entry_point: u64,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ModuleMap {
    pub entries: Vec<ModuleMapEntry>,
}

impl ModuleMap {
    pub fn find_by_name(&self, name: &str) -> Option<&ModuleMapEntry> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

/// One process heap.
#[derive(Debug, Clone, Copy)]
pub struct HeapMapEntry {
    pub va: u64,
    pub size: u64,
    pub id: u32,
    pub primary: bool,
}

#[derive(Debug, Default)]
pub struct HeapMap {
    pub entries: Vec<HeapMapEntry>,
}

/// One thread, keyed by TID.
#[derive(Debug, Clone, Copy)]
pub struct ThreadMapEntry {
    pub tid: u32,
    pub va_teb: u64,
    pub va_start_address: u64,
    pub va_stack_base: u64,
    pub va_stack_limit: u64,
    pub state: u32,
}

/// Thread map, ordered by TID.
#[derive(Debug, Default)]
pub struct ThreadMap {
    pub entries: Vec<ThreadMapEntry>,
}

impl ThreadMap {
    pub fn find(&self, tid: u32) -> Option<&ThreadMapEntry> {
        self.entries
            .binary_search_by_key(&tid, |e| e.tid)
            .ok()
            .and_then(|i| self.entries.get(i))
    }
}

/// One open handle.
#[derive(Debug, Clone, Copy)]
pub struct HandleMapEntry {
    pub handle: u64,
    pub va_object: u64,
    pub access: u32,
    pub type_index: u32,
}

#[derive(Debug, Default)]
pub struct HandleMap {
    pub entries: Vec<HandleMapEntry>,
}

macro_rules! os_map_getter {
    ($fn_name:ident, $slot:ident, $builder:ident, $map:ty) => {
        /// Lazily built map; `None` when no OS layer is attached or the
        /// build declines.
        pub fn $fn_name(&self, process: &Arc<Process>) -> Option<Arc<$map>> {
            if let Some(m) = process.maps.$slot.lock().clone() {
                return Some(m);
            }
            let os = self.os.as_ref()?;
            let _g = process.lock_update.lock();
            if let Some(m) = process.maps.$slot.lock().clone() {
                return Some(m);
            }
            let m = Arc::new(os.$builder(self, process)?);
            *process.maps.$slot.lock() = Some(Arc::clone(&m));
            Some(m)
        }
    };
}

impl Vmm {
    /// Hardware page-table map of `process`, built on first access.
    pub fn map_get_pte(&self, process: &Arc<Process>) -> Option<Arc<PteMap>> {
        if let Some(m) = process.maps.pte.lock().clone() {
            return Some(m);
        }
        let _g = process.lock_update.lock();
        if let Some(m) = process.maps.pte.lock().clone() {
            return Some(m);
        }
        let m = Arc::new(self.model.pte_map_initialize(self, process)?);
        *process.maps.pte.lock() = Some(Arc::clone(&m));
        Some(m)
    }

    os_map_getter!(map_get_vad, vad, build_vad_map, VadMap);
    os_map_getter!(map_get_module, module, build_module_map, ModuleMap);
    os_map_getter!(map_get_heap, heap, build_heap_map, HeapMap);
    os_map_getter!(map_get_handle, handle, build_handle_map, HandleMap);

    /// Thread map; the build runs under its own lock so slow thread walks do
    /// not block the other builders.
    pub fn map_get_thread(&self, process: &Arc<Process>) -> Option<Arc<ThreadMap>> {
        if let Some(m) = process.maps.thread.lock().clone() {
            return Some(m);
        }
        let os = self.os.as_ref()?;
        let _g = process.maps.lock_thread_build.lock();
        if let Some(m) = process.maps.thread.lock().clone() {
            return Some(m);
        }
        let m = Arc::new(os.build_thread_map(self, process)?);
        *process.maps.thread.lock() = Some(Arc::clone(&m));
        Some(m)
    }

    /// Schedule a thread-map build on the work pool and return immediately.
    pub fn map_get_thread_async(self: &Arc<Self>, process: &Arc<Process>) {
        if process.maps.thread.lock().is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let process = Arc::clone(process);
        self.work.submit(
            move || {
                if let Some(vmm) = weak.upgrade() {
                    let _ = vmm.map_get_thread(&process);
                }
            },
            None,
        );
    }
}
