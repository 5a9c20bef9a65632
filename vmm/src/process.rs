//! Process objects and the generational process table.
//!
//! A refresh never mutates the visible table. New entries accumulate in a
//! next-generation table reachable only through the live one; `create_finish`
//! publishes the new generation with a single container swap. Callers holding
//! process handles from an older generation keep them alive through their
//! reference counts.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::error::{VmmError, VmmResult};
use crate::map::{HandleMap, HeapMap, ModuleMap, PteMap, ThreadMap, VadMap};
use crate::scatter::{page_base, VmmFlags};
use crate::Vmm;

/// Fixed size of the open-addressed process table.
pub const PROCESS_TABLE_ENTRIES_MAX: usize = 0x1000;

/// PID bit requesting a kernel-visible clone of the base process.
pub const PID_CLONE_WITH_KERNELMEMORY: u32 = 0x8000_0000;

/// Null link in the insertion-order chain.
const NIL_SLOT: u16 = u16::MAX;

/// Token state of a process. Populated once per generation by the
/// OS-integration layer under the engine master lock.
#[derive(Debug, Default, Clone)]
pub struct ProcessToken {
    pub luid: u64,
    pub session_id: u32,
    pub sid: Option<Vec<u8>>,
    pub sid_string: Option<String>,
}

/// Per-process state that survives refresh generations.
#[derive(Default)]
pub struct ProcessPersistent {
    /// Kernel path of the main image, once resolved.
    pub path_kernel: Mutex<Option<String>>,
    /// Command line, once resolved.
    pub command_line: Mutex<Option<String>>,
    /// Last reverse-translation target.
    pub(crate) phys2virt_target: AtomicU64,
    /// Prefetch address cache maintained by the VAD map builder.
    pub vad_prefetch: Mutex<Option<Arc<Vec<u64>>>>,
    /// Prefetch address cache maintained by the module map builder.
    pub module_prefetch: Mutex<Option<Arc<Vec<u64>>>>,
    /// Prefetch address cache maintained by the thread map builder.
    pub thread_prefetch: Mutex<Option<Arc<Vec<u64>>>>,
}

/// Published map objects of one process. Slots hold immutable, shared maps;
/// builders run under the owning process's update lock (thread maps have
/// their own build lock so slow thread walks do not stall other builders).
#[derive(Default)]
pub struct ProcessMaps {
    pub(crate) pte: Mutex<Option<Arc<PteMap>>>,
    pub(crate) vad: Mutex<Option<Arc<VadMap>>>,
    pub(crate) module: Mutex<Option<Arc<ModuleMap>>>,
    pub(crate) heap: Mutex<Option<Arc<HeapMap>>>,
    pub(crate) thread: Mutex<Option<Arc<ThreadMap>>>,
    pub(crate) handle: Mutex<Option<Arc<HandleMap>>>,
    pub(crate) lock_thread_build: Mutex<()>,
}

/// Cached reverse translation for one physical target page.
#[derive(Debug, Clone)]
pub struct Phys2VirtInfo {
    pub pid: u32,
    pub pa_target: u64,
    /// Virtual addresses translating onto the target, in-page offset applied.
    pub vas: Vec<u64>,
}

/// One analyzed process.
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    /// 0 is a live process; anything else is a termination state.
    pub state: u32,
    /// Short name, truncated to 15 bytes.
    pub name: String,
    /// Kernel directory table base.
    pub dtb: u64,
    /// Optional user-mode directory table base.
    pub dtb_user_opt: u64,
    /// Hide supervisor pages from this view.
    pub user_only: bool,
    /// Raw copy of the OS process record, uninterpreted.
    pub eprocess: Vec<u8>,
    tlb_spider_done: AtomicBool,
    token_initialized: AtomicBool,
    token: Mutex<ProcessToken>,
    /// General update serialization (map builds, spider state).
    pub lock_update: Mutex<()>,
    /// Plugin-side serialization, unused by the core itself.
    pub lock_plugin: Mutex<()>,
    pub(crate) maps: ProcessMaps,
    pub persistent: Arc<ProcessPersistent>,
    pub(crate) phys2virt: Mutex<Option<Arc<Phys2VirtInfo>>>,
    /// Set only on clone objects; keeps the original alive.
    pub(crate) clone_parent: Option<Arc<Process>>,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: u32,
        ppid: u32,
        state: u32,
        dtb: u64,
        dtb_user_opt: u64,
        name: &str,
        user_only: bool,
        eprocess: &[u8],
        persistent: Arc<ProcessPersistent>,
    ) -> Self {
        let mut name = name.to_owned();
        name.truncate(15);
        Self {
            pid,
            ppid,
            state,
            name,
            dtb,
            dtb_user_opt,
            user_only,
            eprocess: eprocess.to_vec(),
            tlb_spider_done: AtomicBool::new(false),
            token_initialized: AtomicBool::new(false),
            token: Mutex::new(ProcessToken::default()),
            lock_update: Mutex::new(()),
            lock_plugin: Mutex::new(()),
            maps: ProcessMaps::default(),
            persistent,
            phys2virt: Mutex::new(None),
            clone_parent: None,
        }
    }

    /// Shallow clone sharing maps and persistent state with the parent.
    /// Returns `None` when `parent` is itself a clone.
    pub(crate) fn clone_of(parent: &Arc<Process>) -> Option<Self> {
        if parent.clone_parent.is_some() {
            return None;
        }
        Some(Self {
            pid: parent.pid,
            ppid: parent.ppid,
            state: parent.state,
            name: parent.name.clone(),
            dtb: parent.dtb,
            dtb_user_opt: parent.dtb_user_opt,
            user_only: parent.user_only,
            eprocess: parent.eprocess.clone(),
            tlb_spider_done: AtomicBool::new(parent.tlb_spider_done.load(Ordering::Relaxed)),
            token_initialized: AtomicBool::new(parent.token_initialized.load(Ordering::Relaxed)),
            token: Mutex::new(parent.token.lock().clone()),
            lock_update: Mutex::new(()),
            lock_plugin: Mutex::new(()),
            maps: ProcessMaps {
                pte: Mutex::new(parent.maps.pte.lock().clone()),
                vad: Mutex::new(parent.maps.vad.lock().clone()),
                module: Mutex::new(parent.maps.module.lock().clone()),
                heap: Mutex::new(parent.maps.heap.lock().clone()),
                thread: Mutex::new(parent.maps.thread.lock().clone()),
                handle: Mutex::new(parent.maps.handle.lock().clone()),
                lock_thread_build: Mutex::new(()),
            },
            persistent: Arc::clone(&parent.persistent),
            phys2virt: Mutex::new(None),
            clone_parent: Some(Arc::clone(parent)),
        })
    }

    /// True for non-terminated processes.
    pub fn is_active(&self) -> bool {
        self.state == 0
    }

    /// True for clone objects created through the clone PID bit.
    pub fn is_clone(&self) -> bool {
        self.clone_parent.is_some()
    }

    pub fn tlb_spider_done(&self) -> bool {
        self.tlb_spider_done.load(Ordering::Acquire)
    }

    pub fn set_tlb_spider_done(&self, done: bool) {
        self.tlb_spider_done.store(done, Ordering::Release);
    }

    pub fn token_initialized(&self) -> bool {
        self.token_initialized.load(Ordering::Acquire)
    }

    /// Token contents. Meaningful once `token_initialized` reports true.
    pub fn token(&self) -> ProcessToken {
        self.token.lock().clone()
    }

    /// Publish token contents and mark the token initialized. Called by the
    /// OS-integration batch under the engine master lock.
    pub fn token_complete(&self, token: ProcessToken) {
        *self.token.lock() = token;
        self.token_initialized.store(true, Ordering::Release);
    }
}

/// OS-specific enumeration hooks.
///
/// The engine stores the produced map objects by reference and never
/// interprets them. All hooks run with the relevant process lock held and
/// may call back into the engine for reads.
pub trait OsIntegration: Send + Sync {
    /// Populate token state for the whole generation. Invoked at most once
    /// per process per generation, serialized by the engine master lock;
    /// implementations mark processed entries via `Process::token_complete`.
    fn token_ensure(&self, vmm: &Vmm, table: &ProcessTable);

    fn build_vad_map(&self, vmm: &Vmm, process: &Arc<Process>) -> Option<VadMap> {
        let _ = (vmm, process);
        None
    }

    fn build_module_map(&self, vmm: &Vmm, process: &Arc<Process>) -> Option<ModuleMap> {
        let _ = (vmm, process);
        None
    }

    fn build_heap_map(&self, vmm: &Vmm, process: &Arc<Process>) -> Option<HeapMap> {
        let _ = (vmm, process);
        None
    }

    fn build_thread_map(&self, vmm: &Vmm, process: &Arc<Process>) -> Option<ThreadMap> {
        let _ = (vmm, process);
        None
    }

    fn build_handle_map(&self, vmm: &Vmm, process: &Arc<Process>) -> Option<HandleMap> {
        let _ = (vmm, process);
        None
    }
}

struct TableSlots {
    m: Vec<Option<Arc<Process>>>,
    /// Insertion-order chain, most recent first.
    flink_m: Vec<u16>,
    head: u16,
}

/// One generation of the process table.
pub struct ProcessTable {
    slots: RwLock<TableSlots>,
    c: AtomicU32,
    c_active: AtomicU32,
    /// Next generation under construction, if a refresh is in flight.
    next: Mutex<Option<Arc<ProcessTable>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(TableSlots {
                m: vec![None; PROCESS_TABLE_ENTRIES_MAX],
                flink_m: vec![NIL_SLOT; PROCESS_TABLE_ENTRIES_MAX],
                head: NIL_SLOT,
            }),
            c: AtomicU32::new(0),
            c_active: AtomicU32::new(0),
            next: Mutex::new(None),
        }
    }

    /// Total entries in this generation.
    pub fn count(&self) -> u32 {
        self.c.load(Ordering::Relaxed)
    }

    /// Non-terminated entries in this generation.
    pub fn count_active(&self) -> u32 {
        self.c_active.load(Ordering::Relaxed)
    }

    /// Open-addressed lookup. Bounded by one table sweep.
    pub fn lookup(&self, pid: u32) -> Option<Arc<Process>> {
        let slots = self.slots.read();
        let start = (pid as usize) % PROCESS_TABLE_ENTRIES_MAX;
        let mut i = start;
        loop {
            match &slots.m[i] {
                None => return None,
                Some(p) if p.pid == pid => return Some(Arc::clone(p)),
                _ => {
                    i = (i + 1) % PROCESS_TABLE_ENTRIES_MAX;
                    if i == start {
                        return None;
                    }
                }
            }
        }
    }

    pub(crate) fn insert(&self, process: Arc<Process>) -> VmmResult<()> {
        let active = process.is_active();
        let mut slots = self.slots.write();
        let start = (process.pid as usize) % PROCESS_TABLE_ENTRIES_MAX;
        let mut i = start;
        loop {
            if slots.m[i].is_none() {
                slots.m[i] = Some(process);
                slots.flink_m[i] = slots.head;
                slots.head = i as u16;
                self.c.fetch_add(1, Ordering::Relaxed);
                if active {
                    self.c_active.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(());
            }
            i = (i + 1) % PROCESS_TABLE_ENTRIES_MAX;
            if i == start {
                return Err(VmmError::TableFull);
            }
        }
    }

    /// Processes in insertion-chain order (most recent first).
    pub fn processes(&self, show_terminated: bool) -> Vec<Arc<Process>> {
        let slots = self.slots.read();
        let mut out = Vec::with_capacity(self.count() as usize);
        let mut i = slots.head;
        while i != NIL_SLOT {
            if let Some(p) = &slots.m[i as usize] {
                if show_terminated || p.is_active() {
                    out.push(Arc::clone(p));
                }
            }
            i = slots.flink_m[i as usize];
        }
        out
    }

    /// Successor of `pid` in the insertion chain, terminated entries
    /// included.
    fn next_in_chain(&self, pid: u32) -> Option<Arc<Process>> {
        let slots = self.slots.read();
        let start = (pid as usize) % PROCESS_TABLE_ENTRIES_MAX;
        let mut i = start;
        loop {
            let p = slots.m[i].as_ref()?;
            if p.pid == pid {
                let next = slots.flink_m[i];
                if next == NIL_SLOT {
                    return None;
                }
                return slots.m[next as usize].as_ref().map(Arc::clone);
            }
            i = (i + 1) % PROCESS_TABLE_ENTRIES_MAX;
            if i == start {
                return None;
            }
        }
    }

    fn first_in_chain(&self) -> Option<Arc<Process>> {
        let slots = self.slots.read();
        if slots.head == NIL_SLOT {
            return None;
        }
        slots.m[slots.head as usize].as_ref().map(Arc::clone)
    }

    /// Next-generation table, created on first use.
    pub(crate) fn next_generation(&self) -> Arc<ProcessTable> {
        let mut next = self.next.lock();
        next.get_or_insert_with(|| Arc::new(ProcessTable::new())).clone()
    }

    pub(crate) fn take_next(&self) -> Option<Arc<ProcessTable>> {
        self.next.lock().take()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmm {
    /// Live process-table generation.
    pub fn process_table(&self) -> Arc<ProcessTable> {
        Arc::clone(&self.proc_container.read())
    }

    /// Look up a process by PID in the live generation.
    pub fn process_get(&self, pid: u32) -> Option<Arc<Process>> {
        self.process_get_ex(pid, VmmFlags::empty())
    }

    /// Look up a process by PID, honoring `PROCESS_TOKEN` and the clone PID
    /// bit.
    pub fn process_get_ex(&self, pid: u32, flags: VmmFlags) -> Option<Arc<Process>> {
        let table = self.process_table();
        self.process_get_in(&table, pid, flags)
    }

    fn process_get_in(
        &self,
        table: &Arc<ProcessTable>,
        pid: u32,
        flags: VmmFlags,
    ) -> Option<Arc<Process>> {
        let want_token = (flags | self.default_flags).contains(VmmFlags::PROCESS_TOKEN);
        if let Some(p) = table.lookup(pid) {
            if want_token && !p.token_initialized() {
                self.process_token_try_ensure(table, &p);
            }
            return Some(p);
        }
        if pid & PID_CLONE_WITH_KERNELMEMORY != 0 {
            let base = self.process_get_in(table, pid & !PID_CLONE_WITH_KERNELMEMORY, flags)?;
            let mut clone = Process::clone_of(&base)?;
            clone.user_only = false;
            return Some(Arc::new(clone));
        }
        None
    }

    /// Iterate the live generation. `prev` is consumed; pass `None` to
    /// start. Terminated processes are skipped unless
    /// `PROCESS_SHOW_TERMINATED` is set.
    pub fn process_get_next(
        &self,
        prev: Option<Arc<Process>>,
        flags: VmmFlags,
    ) -> Option<Arc<Process>> {
        let eff = flags | self.default_flags;
        let show_terminated = eff.contains(VmmFlags::PROCESS_SHOW_TERMINATED);
        let want_token = eff.contains(VmmFlags::PROCESS_TOKEN);
        let table = self.process_table();
        let mut cur = match prev {
            None => table.first_in_chain(),
            Some(p) => table.next_in_chain(p.pid),
        };
        while let Some(p) = cur {
            if p.is_active() || show_terminated {
                if want_token && !p.token_initialized() {
                    self.process_token_try_ensure(&table, &p);
                }
                return Some(p);
            }
            cur = table.next_in_chain(p.pid);
        }
        None
    }

    /// PIDs of the live generation in iteration order.
    pub fn process_list_pids(&self, flags: VmmFlags) -> Vec<u32> {
        let show_terminated =
            (flags | self.default_flags).contains(VmmFlags::PROCESS_SHOW_TERMINATED);
        self.process_table()
            .processes(show_terminated)
            .iter()
            .map(|p| p.pid)
            .collect()
    }

    /// Stage a process into the next generation.
    ///
    /// Validates the directory table base for live processes, carries the
    /// existing process object forward unless `total_refresh`, and inherits
    /// persistent state across a total refresh. The staged entry becomes
    /// visible at [`Vmm::process_create_finish`].
    #[allow(clippy::too_many_arguments)]
    pub fn process_create_entry(
        &self,
        total_refresh: bool,
        pid: u32,
        ppid: u32,
        state: u32,
        dtb: u64,
        dtb_user_opt: u64,
        name: &str,
        user_only: bool,
        eprocess: &[u8],
    ) -> VmmResult<Arc<Process>> {
        if state == 0 {
            let table_pa = page_base(dtb);
            let page = self
                .tlb_page_table(table_pa, false)
                .ok_or(VmmError::InvalidPageTable { pa: table_pa })?;
            if !self.model.page_table_verify(self, page.data(), dtb, true) {
                warn!("process {}: directory table base {:#x} rejected", pid, dtb);
                return Err(VmmError::InvalidPageTable { pa: table_pa });
            }
        }
        let live = self.process_table();
        let next = live.next_generation();
        if next.lookup(pid).is_some() {
            return Err(VmmError::AlreadyExists { pid });
        }
        let carried = if total_refresh { None } else { live.lookup(pid) };
        let process = match carried {
            Some(p) => p,
            None => {
                // Persistent state survives even a total refresh.
                let persistent = live
                    .lookup(pid)
                    .map(|old| Arc::clone(&old.persistent))
                    .unwrap_or_default();
                Arc::new(Process::new(
                    pid,
                    ppid,
                    state,
                    dtb,
                    dtb_user_opt,
                    name,
                    user_only,
                    eprocess,
                    persistent,
                ))
            }
        };
        next.insert(Arc::clone(&process))?;
        Ok(process)
    }

    /// Publish the staged generation. A no-op when no refresh is in flight.
    pub fn process_create_finish(&self) {
        let live = self.process_table();
        if let Some(next) = live.take_next() {
            *self.proc_container.write() = next;
            self.stats.process_refresh.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Clear the TLB spider flag across the live generation.
    pub fn process_tlb_spider_clear(&self) {
        for p in self.process_table().processes(true) {
            if p.tlb_spider_done() {
                let _g = p.lock_update.lock();
                p.set_tlb_spider_done(false);
            }
        }
    }

    pub(crate) fn process_token_try_ensure(
        &self,
        table: &Arc<ProcessTable>,
        process: &Arc<Process>,
    ) {
        if process.token_initialized() {
            return;
        }
        let _master = self.lock_master.lock();
        if process.token_initialized() {
            return;
        }
        if let Some(os) = &self.os {
            os.token_ensure(self, table);
        }
    }

    /// Cached reverse translation for `process`.
    ///
    /// A fresh target triggers a rebuild under the process update lock; a
    /// zero target reuses the previously stored one.
    pub fn phys2virt_information(
        &self,
        process: &Arc<Process>,
        pa_target: u64,
    ) -> Arc<Phys2VirtInfo> {
        let target = if pa_target != 0 {
            process
                .persistent
                .phys2virt_target
                .store(pa_target, Ordering::Relaxed);
            pa_target
        } else {
            process.persistent.phys2virt_target.load(Ordering::Relaxed)
        };
        if target != 0 {
            let stale = {
                let slot = process.phys2virt.lock();
                slot.as_ref().map_or(true, |c| c.pa_target != target)
            };
            if stale {
                let _g = process.lock_update.lock();
                let still_stale = {
                    let slot = process.phys2virt.lock();
                    slot.as_ref().map_or(true, |c| c.pa_target != target)
                };
                if still_stale {
                    let vas = self.model.phys_to_virt(self, process, target);
                    let info = Arc::new(Phys2VirtInfo {
                        pid: process.pid,
                        pa_target: target,
                        vas,
                    });
                    *process.phys2virt.lock() = Some(Arc::clone(&info));
                    return info;
                }
            }
        }
        if let Some(info) = process.phys2virt.lock().clone() {
            return info;
        }
        let _g = process.lock_update.lock();
        let mut slot = process.phys2virt.lock();
        if let Some(info) = slot.clone() {
            return info;
        }
        let info = Arc::new(Phys2VirtInfo {
            pid: process.pid,
            pa_target: 0,
            vas: Vec::new(),
        });
        *slot = Some(Arc::clone(&info));
        info
    }
}
