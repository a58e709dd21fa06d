//! In-memory device backend.
//!
//! Keeps the register file in a hash map and device memory in a byte
//! vector, and records every register write in order. Tests drive status
//! registers directly and assert on the write log, so ordering-sensitive
//! sequences (doorbells, the destroy override window) can be checked
//! without hardware.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;

use crate::buffer::device_mem_offset;
use crate::device::constants::QCSR_SQPI;
use crate::device::{ArenaRegion, DeviceAdaptor};
use crate::Error;

/// One recorded register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrWrite {
    pub offset: u32,
    pub value: u32,
}

pub struct EmulatedDevice {
    csr: RefCell<HashMap<u32, u32>>,
    write_log: RefCell<Vec<CsrWrite>>,
    dev_mem: RefCell<Vec<u8>>,
    arena: *mut u8,
    arena_layout: Layout,
    /// When set, a send doorbell write is answered by advancing the
    /// matching completion head to the same value, as a cooperative
    /// remote peer would cause the hardware to do.
    auto_complete: Cell<bool>,
}

impl EmulatedDevice {
    pub fn new(arena_size: usize, dev_mem_size: usize) -> Self {
        let arena_layout =
            Layout::from_size_align(arena_size, 4096).expect("arena size overflows a layout");
        let arena = unsafe { alloc::alloc_zeroed(arena_layout) };
        assert!(!arena.is_null(), "emulated arena allocation failed");

        Self {
            csr: RefCell::new(HashMap::new()),
            write_log: RefCell::new(Vec::new()),
            dev_mem: RefCell::new(vec![0u8; dev_mem_size]),
            arena,
            arena_layout,
            auto_complete: Cell::new(false),
        }
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.set(enabled);
    }

    /// Set a register without going through the write log. Tests use this
    /// to model status registers the hardware would drive.
    pub fn set_csr(&self, offset: u32, value: u32) {
        self.csr.borrow_mut().insert(offset, value);
    }

    pub fn csr(&self, offset: u32) -> u32 {
        self.csr.borrow().get(&offset).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<CsrWrite> {
        self.write_log.borrow().clone()
    }

    pub fn clear_writes(&self) {
        self.write_log.borrow_mut().clear();
    }

    fn is_send_doorbell(offset: u32) -> bool {
        offset >= QCSR_SQPI && (offset - QCSR_SQPI) % 0x100 == 0
    }
}

impl Drop for EmulatedDevice {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.arena, self.arena_layout) };
    }
}

impl DeviceAdaptor for EmulatedDevice {
    fn read_csr(&self, offset: u32) -> u32 {
        self.csr(offset)
    }

    fn write_csr(&self, offset: u32, value: u32) {
        self.write_log.borrow_mut().push(CsrWrite { offset, value });
        self.csr.borrow_mut().insert(offset, value);

        if self.auto_complete.get() && Self::is_send_doorbell(offset) {
            // the completion head register sits 8 bytes below the doorbell
            self.csr.borrow_mut().insert(offset - 8, value);
        }
    }

    fn dma_read(&self, dev_addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        let off = device_mem_offset(dev_addr) as usize;
        let mem = self.dev_mem.borrow();
        let end = off.checked_add(buf.len()).filter(|&e| e <= mem.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&mem[off..end]);
                Ok(())
            }
            None => Err(Error::Dma(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read past end of device memory",
            ))),
        }
    }

    fn dma_write(&self, dev_addr: u64, data: &[u8]) -> Result<(), Error> {
        let off = device_mem_offset(dev_addr) as usize;
        let mut mem = self.dev_mem.borrow_mut();
        let end = off.checked_add(data.len()).filter(|&e| e <= mem.len());
        match end {
            Some(end) => {
                mem[off..end].copy_from_slice(data);
                Ok(())
            }
            None => Err(Error::Dma(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of device memory",
            ))),
        }
    }

    fn virt_to_phys(&self, virt: u64) -> Result<u64, Error> {
        Ok(virt)
    }

    fn host_arena(&self) -> ArenaRegion {
        ArenaRegion {
            base: self.arena,
            size: self.arena_layout.size() as u64,
        }
    }

    fn device_mem_size(&self) -> u64 {
        self.dev_mem.borrow().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::qp_csr_addr;

    #[test]
    fn write_log_preserves_order() {
        let dev = EmulatedDevice::new(4096, 4096);
        dev.write_csr(0x10, 1);
        dev.write_csr(0x20, 2);
        dev.write_csr(0x10, 3);
        assert_eq!(
            dev.writes(),
            vec![
                CsrWrite { offset: 0x10, value: 1 },
                CsrWrite { offset: 0x20, value: 2 },
                CsrWrite { offset: 0x10, value: 3 },
            ]
        );
        assert_eq!(dev.read_csr(0x10), 3);
    }

    #[test]
    fn auto_complete_mirrors_doorbell_to_completion_head() {
        let dev = EmulatedDevice::new(4096, 4096);
        dev.set_auto_complete(true);
        let db = qp_csr_addr(QCSR_SQPI, 2);
        dev.write_csr(db, 7);
        assert_eq!(dev.read_csr(db - 8), 7);
    }

    #[test]
    fn dma_round_trips_and_bounds_checks() {
        let dev = EmulatedDevice::new(4096, 256);
        dev.dma_write(0x40, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        dev.dma_read(0x40, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(dev.dma_write(0xF8, &[0u8; 16]).is_err());
    }
}
