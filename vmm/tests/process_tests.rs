//! Process table generations, clones, tokens, maps and the parallel fan-out.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use ramview_vmm::{
    BufferDevice, CacheTag, MemoryModelX64, OsIntegration, Process, ProcessTable, ProcessToken,
    Vmm, VmmConfig, VmmFlags, PID_CLONE_WITH_KERNELMEMORY,
};

fn create(vmm: &Vmm, pid: u32, state: u32) -> Arc<Process> {
    vmm.process_create_entry(false, pid, 4, state, DTB, 0, &format!("proc-{}", pid), true, &[])
        .expect("create entry")
}

#[test]
fn generation_swap_publishes_atomically() {
    let (vmm, _rec) = vmm_with_image();
    create(&vmm, 100, 0);
    // staged, not yet visible
    assert!(vmm.process_get(100).is_none());
    vmm.process_create_finish();
    let first = vmm.process_get(100).expect("visible after finish");

    // refresh: carry 100 forward, add 200
    let carried = create(&vmm, 100, 0);
    assert!(Arc::ptr_eq(&first, &carried));
    create(&vmm, 200, 0);
    assert!(vmm.process_get(200).is_none());
    vmm.process_create_finish();
    let got = vmm.process_get(200).expect("visible after finish");
    assert_eq!(got.pid, 200);
    let still = vmm.process_get(100).expect("carried over");
    assert!(Arc::ptr_eq(&first, &still));
    vmm.close();
}

#[test]
fn duplicate_stage_is_rejected() {
    let (vmm, _rec) = vmm_with_image();
    create(&vmm, 100, 0);
    assert!(vmm
        .process_create_entry(false, 100, 4, 0, DTB, 0, "dup", true, &[])
        .is_err());
    vmm.process_create_finish();
    vmm.close();
}

#[test]
fn invalid_dtb_is_rejected_for_live_processes() {
    let (vmm, _rec) = vmm_with_image();
    // garbage page fails verification
    assert!(vmm
        .process_create_entry(false, 300, 4, 0, PA_GARBAGE, 0, "bad", true, &[])
        .is_err());
    // terminated processes skip the check
    assert!(vmm
        .process_create_entry(false, 300, 4, 1, PA_GARBAGE, 0, "dead", true, &[])
        .is_ok());
    vmm.process_create_finish();
    vmm.close();
}

#[test]
fn total_refresh_creates_fresh_objects_but_keeps_persistent_state() {
    let (vmm, _rec) = vmm_with_image();
    let p1 = create(&vmm, 100, 0);
    vmm.process_create_finish();
    *p1.persistent.command_line.lock() = Some("cmd.exe /c".into());

    let p2 = vmm
        .process_create_entry(true, 100, 4, 0, DTB, 0, "proc-100", true, &[])
        .expect("create");
    vmm.process_create_finish();
    assert!(!Arc::ptr_eq(&p1, &p2));
    assert!(Arc::ptr_eq(&p1.persistent, &p2.persistent));
    assert_eq!(
        p2.persistent.command_line.lock().as_deref(),
        Some("cmd.exe /c")
    );
    vmm.close();
}

#[test]
fn list_pids_and_iteration_respect_terminated_filter() {
    let (vmm, _rec) = vmm_with_image();
    create(&vmm, 100, 0);
    create(&vmm, 200, 1);
    create(&vmm, 300, 0);
    vmm.process_create_finish();

    let active = vmm.process_list_pids(VmmFlags::empty());
    assert_eq!(active.len(), 2);
    assert!(!active.contains(&200));
    let all = vmm.process_list_pids(VmmFlags::PROCESS_SHOW_TERMINATED);
    assert_eq!(all.len(), 3);
    let unique: HashSet<u32> = all.iter().copied().collect();
    assert_eq!(unique.len(), 3);

    let table = vmm.process_table();
    assert_eq!(table.count(), 3);
    assert_eq!(table.count_active(), 2);

    // iteration consumes the previous handle and skips terminated entries
    let mut seen = Vec::new();
    let mut cur = vmm.process_get_next(None, VmmFlags::empty());
    while let Some(p) = cur {
        seen.push(p.pid);
        cur = vmm.process_get_next(Some(p), VmmFlags::empty());
    }
    assert_eq!(seen.len(), 2);
    assert!(!seen.contains(&200));
    vmm.close();
}

#[test]
fn clone_pid_bit_yields_kernel_visible_clone() {
    let (vmm, _rec) = vmm_with_image();
    create(&vmm, 100, 0);
    vmm.process_create_finish();
    let base = vmm.process_get(100).expect("base");
    assert!(base.user_only);
    let clone = vmm
        .process_get(100 | PID_CLONE_WITH_KERNELMEMORY)
        .expect("clone");
    assert_eq!(clone.pid, 100);
    assert!(clone.is_clone());
    assert!(!clone.user_only);
    assert!(Arc::ptr_eq(&clone.persistent, &base.persistent));
    // the clone is a view, not a table entry
    assert_eq!(vmm.process_table().count(), 1);
    vmm.close();
}

struct CountingOs {
    token_batches: Arc<AtomicUsize>,
}

impl OsIntegration for CountingOs {
    fn token_ensure(&self, _vmm: &Vmm, table: &ProcessTable) {
        self.token_batches.fetch_add(1, Ordering::SeqCst);
        for p in table.processes(true) {
            p.token_complete(ProcessToken {
                luid: 0x3E7,
                session_id: p.pid % 2,
                sid: Some(vec![1, 1, 0, 0]),
                sid_string: Some(format!("S-1-5-18-{}", p.pid)),
            });
        }
    }
}

#[test]
fn token_lazy_init_runs_once_per_generation() {
    let batches = Arc::new(AtomicUsize::new(0));
    let (device, _rec) = RecordingDevice::new(Box::new(BufferDevice::new(build_image())));
    let mut config = VmmConfig::new(device, Box::new(MemoryModelX64));
    config.worker_threads = 4;
    config.os = Some(Box::new(CountingOs {
        token_batches: Arc::clone(&batches),
    }));
    let vmm = Vmm::new(config);

    create(&vmm, 100, 0);
    create(&vmm, 200, 0);
    vmm.process_create_finish();

    let p = vmm
        .process_get_ex(100, VmmFlags::PROCESS_TOKEN)
        .expect("get");
    assert!(p.token_initialized());
    assert_eq!(p.token().luid, 0x3E7);
    // second lookup does not re-run the batch
    let _ = vmm.process_get_ex(200, VmmFlags::PROCESS_TOKEN).expect("get");
    assert_eq!(batches.load(Ordering::SeqCst), 1);

    // a total refresh produces fresh objects: one more batch
    let _ = vmm
        .process_create_entry(true, 100, 4, 0, DTB, 0, "proc-100", true, &[])
        .expect("create");
    vmm.process_create_finish();
    let _ = vmm.process_get_ex(100, VmmFlags::PROCESS_TOKEN).expect("get");
    assert_eq!(batches.load(Ordering::SeqCst), 2);
    vmm.close();
}

#[test]
fn parallel_foreach_touches_every_selected_pid_once() {
    let (vmm, _rec) = vmm_with_image();
    for pid in 0..50u32 {
        create(&vmm, 100 + pid, 0);
    }
    create(&vmm, 999, 1); // terminated, filtered by the criteria
    vmm.process_create_finish();

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&counter);
    let s = Arc::clone(&seen);
    vmm.process_foreach_parallel(Some(|p: &Process| p.is_active()), move |p| {
        c.fetch_add(1, Ordering::SeqCst);
        s.lock().push(p.pid);
    });
    assert_eq!(counter.load(Ordering::SeqCst), 50);
    let seen = seen.lock();
    let unique: HashSet<u32> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 50);
    assert!(!unique.contains(&999));
    vmm.close();
}

#[test]
fn pte_map_reflects_the_page_tables() {
    let (vmm, _rec) = vmm_with_image();
    let process = create(&vmm, 4, 0);
    vmm.process_create_finish();
    let map = vmm.map_get_pte(&process).expect("pte map");
    let entry = map.find(VA_BASE).expect("mapped range");
    assert!(entry.va <= VA_BASE);
    assert!(entry.pages >= MAPPED_PAGES as u64);
    assert!(map.find(0xDEAD_0000).is_none());
    // built once, shared afterwards
    let again = vmm.map_get_pte(&process).expect("pte map");
    assert!(Arc::ptr_eq(&map, &again));
    vmm.close();
}

#[test]
fn phys2virt_finds_reverse_translations() {
    let (vmm, _rec) = vmm_with_image();
    let process = create(&vmm, 4, 0);
    vmm.process_create_finish();
    let target = PA_DATA + 0x2000 + 0x77;
    let info = vmm.phys2virt_information(&process, target);
    assert_eq!(info.pa_target, target);
    assert!(info.vas.contains(&(VA_BASE + 0x2000 + 0x77)));
    // cached for repeat queries with the same target
    let again = vmm.phys2virt_information(&process, 0);
    assert!(Arc::ptr_eq(&info, &again));
    vmm.close();
}

#[test]
fn tlb_clear_resets_spider_flags() {
    let (vmm, _rec) = vmm_with_image();
    let process = create(&vmm, 4, 0);
    vmm.process_create_finish();
    process.set_tlb_spider_done(true);
    vmm.cache_clear(CacheTag::Tlb);
    assert!(!process.tlb_spider_done());
    vmm.close();
}
