//! Walker coverage for the 32-bit and PAE memory models.

use std::sync::Arc;

use ramview_vmm::{
    BufferDevice, MemoryModelX86, MemoryModelX86Pae, Process, Vmm, VmmConfig,
};

const IMG_SIZE: usize = 0x40000;
const DATA_PA: u64 = 0x5000;

fn put32(img: &mut [u8], table: u64, idx: usize, val: u32) {
    let off = table as usize + idx * 4;
    img[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put64(img: &mut [u8], table: u64, idx: usize, val: u64) {
    let off = table as usize + idx * 8;
    img[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Legacy 2-level layout: `0x10000 -> 0x5000` through a page table, plus a
/// 4 MiB page at `0x0040_0000 -> 0x0`.
fn x86_vmm() -> (Arc<Vmm>, Arc<Process>) {
    let mut img = vec![0u8; IMG_SIZE];
    put32(&mut img, 0x1000, 0, 0x2000 | 0x27);
    put32(&mut img, 0x1000, 1, 0x27 | 0x80);
    put32(&mut img, 0x2000, 16, DATA_PA as u32 | 0x67);
    img[DATA_PA as usize..DATA_PA as usize + 0x1000].fill(0xC3);
    let mut config = VmmConfig::new(
        Box::new(BufferDevice::new(img)),
        Box::new(MemoryModelX86),
    );
    config.worker_threads = 2;
    let vmm = Vmm::new(config);
    let process = vmm
        .process_create_entry(false, 4, 0, 0, 0x1000, 0, "system", true, &[])
        .expect("create");
    vmm.process_create_finish();
    (vmm, process)
}

/// PAE 3-level layout: `0x10000 -> 0x5000` through a page table, plus a
/// 2 MiB page at `0x0020_0000 -> 0x0`.
fn pae_vmm() -> (Arc<Vmm>, Arc<Process>) {
    let mut img = vec![0u8; IMG_SIZE];
    put64(&mut img, 0x1000, 0, 0x2000 | 0x1);
    put64(&mut img, 0x2000, 0, 0x3000 | 0x27);
    put64(&mut img, 0x2000, 1, 0x27 | 0x80);
    put64(&mut img, 0x3000, 16, DATA_PA | 0x67);
    img[DATA_PA as usize..DATA_PA as usize + 0x1000].fill(0xC4);
    let mut config = VmmConfig::new(
        Box::new(BufferDevice::new(img)),
        Box::new(MemoryModelX86Pae),
    );
    config.worker_threads = 2;
    let vmm = Vmm::new(config);
    let process = vmm
        .process_create_entry(false, 4, 0, 0, 0x1000, 0, "system", true, &[])
        .expect("create");
    vmm.process_create_finish();
    (vmm, process)
}

#[test]
fn x86_translates_small_and_large_pages() {
    let (vmm, process) = x86_vmm();
    assert_eq!(vmm.virt_to_phys(&process, 0x10000), Some(DATA_PA));
    assert_eq!(vmm.virt_to_phys(&process, 0x10123), Some(DATA_PA + 0x123));
    assert_eq!(vmm.virt_to_phys(&process, 0x0041_2345), Some(0x12345));
    assert_eq!(vmm.virt_to_phys(&process, 0x0001_F000), None);
    // addresses past 4 GiB never map
    assert_eq!(vmm.virt_to_phys(&process, 0x1_0000_0000), None);
    vmm.close();
}

#[test]
fn x86_reads_through_the_mapping() {
    let (vmm, process) = x86_vmm();
    let mut buf = [0u8; 0x80];
    vmm.read(Some(&process), 0x10040, &mut buf).expect("read");
    assert!(buf.iter().all(|&b| b == 0xC3));
    vmm.close();
}

#[test]
fn x86_pte_map_and_reverse_translation() {
    let (vmm, process) = x86_vmm();
    let map = vmm.map_get_pte(&process).expect("pte map");
    assert!(map.find(0x10000).is_some());
    assert!(map.find(0x0040_0000).is_some());
    let info = vmm.phys2virt_information(&process, DATA_PA + 0x10);
    assert!(info.vas.contains(&0x10010));
    vmm.close();
}

#[test]
fn pae_translates_small_and_large_pages() {
    let (vmm, process) = pae_vmm();
    assert_eq!(vmm.virt_to_phys(&process, 0x10000), Some(DATA_PA));
    assert_eq!(vmm.virt_to_phys(&process, 0x10777), Some(DATA_PA + 0x777));
    assert_eq!(vmm.virt_to_phys(&process, 0x0021_2345), Some(0x12345));
    assert_eq!(vmm.virt_to_phys(&process, 0x4000_0000), None);
    vmm.close();
}

#[test]
fn pae_reads_through_the_mapping() {
    let (vmm, process) = pae_vmm();
    let mut buf = [0u8; 0x40];
    vmm.read(Some(&process), 0x10FC0, &mut buf).expect("read");
    assert!(buf.iter().all(|&b| b == 0xC4));
    vmm.close();
}

#[test]
fn pae_reverse_translation_finds_the_mapping() {
    let (vmm, process) = pae_vmm();
    let info = vmm.phys2virt_information(&process, DATA_PA);
    assert!(info.vas.contains(&0x10000));
    vmm.close();
}
