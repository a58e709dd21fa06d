//! PCIe hardware backend.
//!
//! Registers are reached through an `mmap` of the card's PCIe resource
//! file with `O_SYNC` (uncached, so every access is a posted bus cycle).
//! Device memory is reached through the DMA character device exposed by
//! the kernel module, and host physical addresses come from the kernel's
//! pagemap interface.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use tracing::debug;

use crate::buffer::device_mem_offset;
use crate::device::constants::CSR_MAP_SIZE;
use crate::device::{ArenaRegion, DeviceAdaptor};
use crate::Error;

const HUGE_PAGE_SIZE: u64 = 1 << 21;
const PAGE_SHIFT: u64 = 12;
const PAGEMAP_ENTRY_SIZE: u64 = 8;
const PFN_MASK: u64 = 0x7F_FFFF_FFFF_FFFF;
const DEVICE_MEM_SIZE: u64 = 4 << 30;

/// The DMA character device rejects single transfers above this size.
const RW_MAX_SIZE: usize = 0x7FFF_F000;

pub struct HardwareDevice {
    bar: *mut u8,
    dma: RefCell<File>,
    arena: *mut u8,
    arena_size: u64,
    // keeps the mapping's backing fd open for the lifetime of the device
    _resource: File,
}

impl HardwareDevice {
    /// Map the register BAR from `pcie_resource`, open the DMA character
    /// device, and pin a hugepage arena of `num_hugepages` two-megabyte
    /// pages.
    pub fn open(
        pcie_resource: &Path,
        dma_device: &Path,
        num_hugepages: u32,
    ) -> Result<Self, Error> {
        let resource = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(pcie_resource)
            .map_err(Error::RegisterWindow)?;

        let bar = unsafe {
            libc::mmap(
                ptr::null_mut(),
                CSR_MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                resource.as_raw_fd(),
                0,
            )
        };
        if bar == libc::MAP_FAILED {
            return Err(Error::RegisterWindow(io::Error::last_os_error()));
        }

        let dma = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dma_device)
            .map_err(Error::Dma)?;

        let arena_size = u64::from(num_hugepages) * HUGE_PAGE_SIZE;
        let arena = unsafe {
            libc::mmap(
                ptr::null_mut(),
                arena_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if arena == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(bar, CSR_MAP_SIZE) };
            return Err(Error::ArenaAlloc(err));
        }

        // pin the arena so pagemap translations stay valid
        if unsafe { libc::mlock(arena, arena_size as usize) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(arena, arena_size as usize);
                libc::munmap(bar, CSR_MAP_SIZE);
            }
            return Err(Error::ArenaAlloc(err));
        }
        unsafe { ptr::write_bytes(arena as *mut u8, 0, arena_size as usize) };

        debug!(
            ?pcie_resource,
            arena_size, "mapped register window and hugepage arena"
        );

        Ok(Self {
            bar: bar as *mut u8,
            dma: RefCell::new(dma),
            arena: arena as *mut u8,
            arena_size,
            _resource: resource,
        })
    }
}

impl Drop for HardwareDevice {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.arena as *mut libc::c_void, self.arena_size as usize);
            libc::munmap(self.arena as *mut libc::c_void, self.arena_size as usize);
            libc::munmap(self.bar as *mut libc::c_void, CSR_MAP_SIZE);
        }
    }
}

impl DeviceAdaptor for HardwareDevice {
    fn read_csr(&self, offset: u32) -> u32 {
        unsafe { ptr::read_volatile(self.bar.add(offset as usize) as *const u32) }
    }

    fn write_csr(&self, offset: u32, value: u32) {
        unsafe { ptr::write_volatile(self.bar.add(offset as usize) as *mut u32, value) }
    }

    fn dma_read(&self, dev_addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut dma = self.dma.borrow_mut();
        let base = device_mem_offset(dev_addr);
        let mut done = 0usize;
        while done < buf.len() {
            let len = (buf.len() - done).min(RW_MAX_SIZE);
            dma.seek(SeekFrom::Start(base + done as u64))
                .map_err(Error::Dma)?;
            dma.read_exact(&mut buf[done..done + len]).map_err(Error::Dma)?;
            done += len;
        }
        Ok(())
    }

    fn dma_write(&self, dev_addr: u64, data: &[u8]) -> Result<(), Error> {
        let mut dma = self.dma.borrow_mut();
        let base = device_mem_offset(dev_addr);
        let mut done = 0usize;
        while done < data.len() {
            let len = (data.len() - done).min(RW_MAX_SIZE);
            dma.seek(SeekFrom::Start(base + done as u64))
                .map_err(Error::Dma)?;
            dma.write_all(&data[done..done + len]).map_err(Error::Dma)?;
            done += len;
        }
        Ok(())
    }

    fn virt_to_phys(&self, virt: u64) -> Result<u64, Error> {
        let mut pagemap = File::open("/proc/self/pagemap").map_err(Error::AddrTranslation)?;
        pagemap
            .seek(SeekFrom::Start((virt >> PAGE_SHIFT) * PAGEMAP_ENTRY_SIZE))
            .map_err(Error::AddrTranslation)?;
        let mut entry = [0u8; 8];
        pagemap
            .read_exact(&mut entry)
            .map_err(Error::AddrTranslation)?;
        let pfn = u64::from_le_bytes(entry) & PFN_MASK;
        if pfn == 0 {
            return Err(Error::AddrTranslation(io::Error::new(
                io::ErrorKind::NotFound,
                "page frame not present",
            )));
        }
        Ok((pfn << PAGE_SHIFT) + (virt & 0xfff))
    }

    fn host_arena(&self) -> ArenaRegion {
        ArenaRegion {
            base: self.arena,
            size: self.arena_size,
        }
    }

    fn device_mem_size(&self) -> u64 {
        DEVICE_MEM_SIZE
    }
}
