//! Fixed-size work pool and the parallel per-process fan-out.
//!
//! Workers consume a FIFO of work units. An idle worker parks on its own
//! wake event after registering on the idle stack; submission wakes one
//! registered worker. Shutdown flips the enabled flag, wakes everyone until
//! the pool drains and signals the completion events of unexecuted units so
//! waiters never hang.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use log::{debug, error};
use parking_lot::Mutex;

use crate::process::Process;
use crate::sync::Event;
use crate::Vmm;

/// Number of pool threads.
pub const WORK_POOL_THREADS: usize = 32;

struct WorkUnit {
    func: Box<dyn FnOnce() + Send>,
    finish: Option<Arc<Event>>,
}

/// The engine work pool.
pub struct WorkPool {
    enabled: AtomicBool,
    units: SegQueue<WorkUnit>,
    avail: SegQueue<usize>,
    wake: Vec<Arc<Event>>,
    alive: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    pub fn new(threads: usize) -> Arc<Self> {
        let wake = (0..threads).map(|_| Arc::new(Event::new())).collect();
        let pool = Arc::new(Self {
            enabled: AtomicBool::new(true),
            units: SegQueue::new(),
            avail: SegQueue::new(),
            wake,
            alive: AtomicUsize::new(threads),
            handles: Mutex::new(Vec::with_capacity(threads)),
        });
        let mut handles = pool.handles.lock();
        for i in 0..threads {
            let p = Arc::clone(&pool);
            let handle = std::thread::Builder::new()
                .name(format!("vmm-work-{}", i))
                .spawn(move || worker_loop(p, i));
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    error!("work pool: failed to spawn worker {}: {}", i, e);
                    pool.alive.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        drop(handles);
        debug!("work pool: {} threads started", threads);
        pool
    }

    /// Queue a unit. `finish` is signaled after the unit ran, or at shutdown
    /// if the unit never runs.
    pub fn submit<F>(&self, func: F, finish: Option<Arc<Event>>)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.enabled.load(Ordering::Acquire) {
            if let Some(ev) = finish {
                ev.set();
            }
            return;
        }
        self.units.push(WorkUnit {
            func: Box::new(func),
            finish,
        });
        if let Some(i) = self.avail.pop() {
            self.wake[i].set();
        }
    }

    /// Units waiting for a worker.
    pub fn pending(&self) -> usize {
        self.units.len()
    }

    /// Stop the pool: drain workers, then release any waiters on units that
    /// never ran.
    pub fn close(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        while self.alive.load(Ordering::Acquire) > 0 {
            for ev in &self.wake {
                ev.set();
            }
            std::thread::yield_now();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            let _ = h.join();
        }
        while let Some(unit) = self.units.pop() {
            if let Some(ev) = unit.finish {
                ev.set();
            }
        }
        debug!("work pool: closed");
    }
}

fn worker_loop(pool: Arc<WorkPool>, idx: usize) {
    while pool.enabled.load(Ordering::Acquire) {
        if let Some(unit) = pool.units.pop() {
            if catch_unwind(AssertUnwindSafe(unit.func)).is_err() {
                error!("work pool: unit panicked on worker {}", idx);
            }
            if let Some(ev) = unit.finish {
                ev.set();
            }
        } else {
            pool.wake[idx].reset();
            pool.avail.push(idx);
            // Recheck after registering idle; a unit may have been queued in
            // between, with no one left to wake us.
            if !pool.units.is_empty() {
                continue;
            }
            pool.wake[idx].wait();
        }
    }
    pool.alive.fetch_sub(1, Ordering::AcqRel);
}

struct ForeachShared {
    event: Event,
    remaining: AtomicUsize,
    cursor: AtomicUsize,
    pids: Vec<u32>,
    action: Box<dyn Fn(&Arc<Process>) + Send + Sync>,
}

impl Vmm {
    /// Queue a closure on the work pool.
    pub fn work_submit<F>(&self, func: F, finish: Option<Arc<Event>>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.work.submit(func, finish);
    }

    /// Run `action` once for every selected process, fanned out over the
    /// work pool. Blocks until the last action returned.
    ///
    /// `criteria` filters the candidate set (terminated processes are
    /// candidates); `None` selects everything.
    pub fn process_foreach_parallel<F>(
        self: &Arc<Self>,
        criteria: Option<fn(&Process) -> bool>,
        action: F,
    ) where
        F: Fn(&Arc<Process>) + Send + Sync + 'static,
    {
        let pids: Vec<u32> = self
            .process_table()
            .processes(true)
            .into_iter()
            .filter(|p| criteria.map_or(true, |c| c(p)))
            .map(|p| p.pid)
            .collect();
        if pids.is_empty() {
            return;
        }
        let n = pids.len();
        let shared = Arc::new(ForeachShared {
            event: Event::new(),
            remaining: AtomicUsize::new(n),
            cursor: AtomicUsize::new(n),
            pids,
            action: Box::new(action),
        });
        for _ in 0..n {
            let vmm = Arc::clone(self);
            let sh = Arc::clone(&shared);
            self.work.submit(
                move || {
                    let i = sh.cursor.fetch_sub(1, Ordering::AcqRel) - 1;
                    if let Some(p) = vmm.process_get(sh.pids[i]) {
                        (sh.action)(&p);
                    }
                    if sh.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        sh.event.set();
                    }
                },
                None,
            );
        }
        shared.event.wait();
    }
}
