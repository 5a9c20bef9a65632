//! Shared fixtures: a synthetic x64 target image plus instrumented devices.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ramview_vmm::{
    page_base, BufferDevice, MemDevice, MemScatter, MemoryModelX64, Vmm, VmmConfig, ADDR_INVALID,
    PAGE_SIZE,
};

/// Image size: 256 pages.
pub const IMG_SIZE: usize = 0x10_0000;
/// Directory table base of the synthetic process.
pub const DTB: u64 = 0x1000;
/// First mapped virtual address.
pub const VA_BASE: u64 = 0x10000;
/// Physical backing of the first mapped page.
pub const PA_DATA: u64 = 0x20000;
/// Number of consecutively mapped pages.
pub const MAPPED_PAGES: usize = 16;
/// A page deliberately filled with garbage entries pointing past the image.
pub const PA_GARBAGE: u64 = 0x3F000;

fn put_entry(img: &mut [u8], table: u64, idx: usize, val: u64) {
    let off = table as usize + idx * 8;
    img[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Build a RAM image with a 4-level mapping of
/// `VA_BASE + k*0x1000 -> PA_DATA + k*0x1000` (page `k` filled with
/// `0xA0 + k`), a self-referencing directory table base at `DTB`, and one
/// garbage page at `PA_GARBAGE`.
pub fn build_image() -> Vec<u8> {
    let mut img = vec![0u8; IMG_SIZE];
    // pml4 -> pdpt -> pd -> pt
    put_entry(&mut img, 0x1000, 0, 0x2000 | 0x27);
    put_entry(&mut img, 0x1000, 510, 0x1000 | 0x27); // self reference
    put_entry(&mut img, 0x2000, 0, 0x3000 | 0x27);
    put_entry(&mut img, 0x3000, 0, 0x4000 | 0x27);
    for k in 0..MAPPED_PAGES {
        let pa = PA_DATA + (k as u64) * PAGE_SIZE as u64;
        put_entry(&mut img, 0x4000, 16 + k, pa | 0x67);
        let base = pa as usize;
        img[base..base + PAGE_SIZE].fill(0xA0 + k as u8);
    }
    img[PA_GARBAGE as usize..PA_GARBAGE as usize + PAGE_SIZE].fill(0xFF);
    img
}

#[derive(Default)]
pub struct Recorder {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    /// Addresses of every read batch, in call order.
    pub batches: Mutex<Vec<Vec<u64>>>,
}

impl Recorder {
    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Device wrapper recording batch shapes.
pub struct RecordingDevice {
    inner: Box<dyn MemDevice>,
    rec: Arc<Recorder>,
}

impl RecordingDevice {
    pub fn new(inner: Box<dyn MemDevice>) -> (Box<Self>, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        (
            Box::new(Self {
                inner,
                rec: Arc::clone(&rec),
            }),
            rec,
        )
    }
}

impl MemDevice for RecordingDevice {
    fn read_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        self.rec.reads.fetch_add(1, Ordering::SeqCst);
        self.rec
            .batches
            .lock()
            .push(mems.iter().map(|m| m.addr).collect());
        self.inner.read_scatter(mems);
    }

    fn write_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        self.rec.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_scatter(mems);
    }

    fn pa_max(&self) -> u64 {
        self.inner.pa_max()
    }
}

/// Transport backed by a sparse page set; everything else fails.
pub struct SparseDevice {
    pages: Mutex<HashMap<u64, Vec<u8>>>,
    pa_max: u64,
}

impl SparseDevice {
    pub fn new(pa_max: u64) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            pa_max,
        }
    }

    pub fn insert_page(&self, addr: u64, fill: u8) {
        self.pages.lock().insert(page_base(addr), vec![fill; PAGE_SIZE]);
    }
}

impl MemDevice for SparseDevice {
    fn read_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        let pages = self.pages.lock();
        for mem in mems.iter_mut() {
            if mem.valid || mem.addr == ADDR_INVALID {
                continue;
            }
            let off = (mem.addr - page_base(mem.addr)) as usize;
            if let Some(page) = pages.get(&page_base(mem.addr)) {
                let len = mem.len();
                if off + len <= PAGE_SIZE {
                    mem.buf_mut().copy_from_slice(&page[off..off + len]);
                    mem.valid = true;
                }
            }
        }
    }

    fn write_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        let mut pages = self.pages.lock();
        for mem in mems.iter_mut() {
            if mem.valid || mem.addr == ADDR_INVALID {
                continue;
            }
            let base = page_base(mem.addr);
            let off = (mem.addr - base) as usize;
            let len = mem.len();
            if off + len <= PAGE_SIZE {
                let page = pages.entry(base).or_insert_with(|| vec![0; PAGE_SIZE]);
                page[off..off + len].copy_from_slice(mem.buf());
                mem.valid = true;
            }
        }
    }

    fn pa_max(&self) -> u64 {
        self.pa_max
    }
}

/// Engine over the standard image, with batch recording.
pub fn vmm_with_image() -> (Arc<Vmm>, Arc<Recorder>) {
    let (device, rec) = RecordingDevice::new(Box::new(BufferDevice::new(build_image())));
    let mut config = VmmConfig::new(device, Box::new(MemoryModelX64));
    config.worker_threads = 8;
    (Vmm::new(config), rec)
}

/// Engine over a sparse device, with batch recording.
pub fn vmm_sparse(pa_max: u64, pages: &[(u64, u8)]) -> (Arc<Vmm>, Arc<Recorder>) {
    let sparse = SparseDevice::new(pa_max);
    for &(addr, fill) in pages {
        sparse.insert_page(addr, fill);
    }
    let (device, rec) = RecordingDevice::new(Box::new(sparse));
    let mut config = VmmConfig::new(device, Box::new(MemoryModelX64));
    config.worker_threads = 8;
    (Vmm::new(config), rec)
}

/// Expected fill byte of mapped data page `k`.
pub fn data_byte(k: usize) -> u8 {
    0xA0 + k as u8
}
