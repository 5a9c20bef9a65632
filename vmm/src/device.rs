//! Backing transport abstraction.
//!
//! The engine talks to target physical memory exclusively through
//! [`MemDevice`]: a batched scatter read, a batched scatter write, and an
//! advertised maximum physical address used to clamp zero-pad fixups.
//! Implementations cover live DMA hardware, crash dumps or plain RAM images;
//! [`BufferDevice`] ships the last of these.

use parking_lot::RwLock;

use crate::scatter::{MemScatter, ADDR_INVALID};

/// A batched physical memory transport.
///
/// Contract for both calls: descriptors whose `valid` flag is already set and
/// descriptors whose address is [`ADDR_INVALID`] must be skipped; for every
/// other descriptor the implementation transfers exactly `len()` bytes at
/// `addr` and sets `valid` on success. Descriptors never cross a page
/// boundary. Calls block until the batch is complete.
pub trait MemDevice: Send + Sync {
    /// Fill each descriptor buffer from target memory.
    fn read_scatter(&self, mems: &mut [&mut MemScatter<'_>]);

    /// Write each descriptor buffer to target memory.
    fn write_scatter(&self, mems: &mut [&mut MemScatter<'_>]);

    /// Maximum physical address backed by the device (exclusive).
    fn pa_max(&self) -> u64;
}

/// Transport over an in-memory RAM image.
///
/// Addresses map 1:1 onto offsets into the image. Transfers reaching past the
/// end of the image fail in full rather than partially.
pub struct BufferDevice {
    ram: RwLock<Vec<u8>>,
}

impl BufferDevice {
    /// Wrap a RAM image.
    pub fn new(ram: Vec<u8>) -> Self {
        Self {
            ram: RwLock::new(ram),
        }
    }

    /// Allocate a zeroed image of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0; size])
    }

    /// Copy `data` into the image at `addr`. Setup helper for embedders
    /// building synthetic targets.
    pub fn load(&self, addr: u64, data: &[u8]) {
        let mut ram = self.ram.write();
        let start = addr as usize;
        let end = start + data.len();
        if end <= ram.len() {
            ram[start..end].copy_from_slice(data);
        }
    }
}

impl MemDevice for BufferDevice {
    fn read_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        let ram = self.ram.read();
        for mem in mems.iter_mut() {
            if mem.valid || mem.addr == ADDR_INVALID {
                continue;
            }
            let start = mem.addr as usize;
            let Some(end) = start.checked_add(mem.len()) else {
                continue;
            };
            if end <= ram.len() {
                let len = mem.len();
                mem.buf_mut().copy_from_slice(&ram[start..start + len]);
                mem.valid = true;
            }
        }
    }

    fn write_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        let mut ram = self.ram.write();
        for mem in mems.iter_mut() {
            if mem.valid || mem.addr == ADDR_INVALID {
                continue;
            }
            let start = mem.addr as usize;
            let Some(end) = start.checked_add(mem.len()) else {
                continue;
            };
            if end <= ram.len() {
                ram[start..end].copy_from_slice(mem.buf());
                mem.valid = true;
            }
        }
    }

    fn pa_max(&self) -> u64 {
        self.ram.read().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scatter::PAGE_SIZE;

    #[test]
    fn read_write_roundtrip() {
        let dev = BufferDevice::zeroed(4 * PAGE_SIZE);
        let mut wbuf = [0xA5u8; 0x20];
        let mut wmem = MemScatter::new(0x1008, &mut wbuf);
        dev.write_scatter(&mut [&mut wmem]);
        assert!(wmem.valid);

        let mut rbuf = [0u8; 0x20];
        let mut rmem = MemScatter::new(0x1008, &mut rbuf);
        dev.read_scatter(&mut [&mut rmem]);
        assert!(rmem.valid);
        assert_eq!(rmem.buf(), &[0xA5u8; 0x20][..]);
    }

    #[test]
    fn out_of_range_read_fails() {
        let dev = BufferDevice::zeroed(PAGE_SIZE);
        let mut buf = [0u8; PAGE_SIZE];
        let mut mem = MemScatter::new(PAGE_SIZE as u64, &mut buf);
        dev.read_scatter(&mut [&mut mem]);
        assert!(!mem.valid);
    }

    #[test]
    fn valid_descriptors_are_skipped() {
        let dev = BufferDevice::zeroed(PAGE_SIZE);
        let mut buf = [0xFFu8; 0x10];
        let mut mem = MemScatter::new(0, &mut buf);
        mem.valid = true;
        dev.read_scatter(&mut [&mut mem]);
        assert_eq!(mem.buf(), &[0xFFu8; 0x10][..]);
    }
}
