//! The NIC shell: address-translation windows and buffer carving.
//!
//! [`RnicDevice`] owns the device backend, programs the bridge that maps
//! NIC-side AXI addresses onto the pinned host arena, and hands out
//! buffers from the host arena and from card memory with simple bump
//! allocation.

use std::rc::Rc;

use tracing::debug;

use crate::buffer::{
    carve_offset, split_addr, Buffer, BufferLocation, WinSize, DEVICE_MEM_OFFSET,
};
use crate::device::constants::{
    bdf_csr_addr, AXIB_ADDR_MASK, AXIB_BDF_FUNCTION, AXIB_BDF_MAP_CONTROL, AXIB_BDF_NUM_WINDOWS,
    AXIB_BDF_PASID, AXIB_BDF_RESERVED, AXIB_BDF_TRANSLATE_LSB, AXIB_BDF_TRANSLATE_MSB,
    AXIB_BDF_WIN_STRIDE, AXI_BAR_SIZE,
};
use crate::device::{ArenaRegion, DeviceAdaptor};
use crate::Error;

pub struct RnicDevice {
    pub(crate) adaptor: Rc<dyn DeviceAdaptor>,
    pub(crate) win_size: WinSize,
    pub(crate) num_qp: u32,
    arena: ArenaRegion,
    arena_phys: u64,
    host_offset: u64,
    dev_offset: u64,
}

impl RnicDevice {
    /// Wrap a device backend, resolve the host arena's physical address,
    /// and program the address-translation bridge.
    pub fn new(adaptor: Rc<dyn DeviceAdaptor>, num_qp: u32) -> Result<Self, Error> {
        let arena = adaptor.host_arena();
        let arena_phys = adaptor.virt_to_phys(arena.base as u64)?;
        let dev = Self {
            adaptor,
            win_size: WinSize::from_aperture(AXI_BAR_SIZE),
            num_qp,
            arena,
            arena_phys,
            host_offset: 0,
            dev_offset: 0,
        };
        dev.config_axib_bdf();
        Ok(dev)
    }

    pub fn num_qp(&self) -> u32 {
        self.num_qp
    }

    pub fn win_size(&self) -> WinSize {
        self.win_size
    }

    /// Program all translation windows so AXI traffic from the NIC lands
    /// in the pinned host arena. Each window covers one eighth of the
    /// bridge aperture.
    fn config_axib_bdf(&self) {
        let (phys_lo, phys_hi) = split_addr(self.arena_phys);
        let lsb_mask = (AXIB_ADDR_MASK as u32).wrapping_sub(self.win_size.lsb);
        let msb_mask = (AXIB_ADDR_MASK as u32).wrapping_sub(self.win_size.msb);
        let win_pages = (((AXI_BAR_SIZE >> 3) + 1) >> 12) as u32;

        for win in 0..AXIB_BDF_NUM_WINDOWS {
            self.adaptor
                .write_csr(bdf_csr_addr(AXIB_BDF_TRANSLATE_LSB, win), phys_lo & lsb_mask);
            self.adaptor.write_csr(
                bdf_csr_addr(AXIB_BDF_TRANSLATE_MSB, win),
                (phys_hi & msb_mask) + win * AXIB_BDF_WIN_STRIDE,
            );
            self.adaptor.write_csr(bdf_csr_addr(AXIB_BDF_PASID, win), 0);
            self.adaptor.write_csr(bdf_csr_addr(AXIB_BDF_FUNCTION, win), 0);
            self.adaptor.write_csr(
                bdf_csr_addr(AXIB_BDF_MAP_CONTROL, win),
                0xC000_0000 | win_pages,
            );
            self.adaptor.write_csr(bdf_csr_addr(AXIB_BDF_RESERVED, win), 0);
        }
        debug!(arena_phys = self.arena_phys, "programmed translation windows");
    }

    /// Carve a buffer out of the host arena or out of card memory.
    ///
    /// Buffers never straddle a hardware page unless they are larger than
    /// one, and allocation never reuses space; queues live for the life of
    /// the device.
    pub fn allocate_buffer(
        &mut self,
        size: u64,
        location: BufferLocation,
    ) -> Result<Buffer, Error> {
        match location {
            BufferLocation::HostMem => {
                let start = carve_offset(self.host_offset, size);
                if start + size > self.arena.size {
                    return Err(Error::HostArenaExhausted);
                }
                let ptr = unsafe { self.arena.base.add(start as usize) };
                let dma_addr = self.adaptor.virt_to_phys(ptr as u64)?;
                self.host_offset = start + size;
                Ok(Buffer {
                    ptr,
                    dma_addr,
                    size,
                    location,
                })
            }
            BufferLocation::DeviceMem => {
                let start = carve_offset(self.dev_offset, size);
                if start + size > self.adaptor.device_mem_size() {
                    return Err(Error::DeviceMemExhausted);
                }
                self.dev_offset = start + size;
                Ok(Buffer {
                    ptr: std::ptr::null_mut(),
                    dma_addr: DEVICE_MEM_OFFSET + start,
                    size,
                    location,
                })
            }
        }
    }
}
