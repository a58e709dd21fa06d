//! Device backends.
//!
//! [`DeviceAdaptor`] is the seam between the driver logic and the machine:
//! the hardware backend maps a real PCIe BAR and talks to a DMA character
//! device, while the emulated backend keeps a register file in memory so
//! the control plane can be exercised without an FPGA.

use crate::Error;

mod emulated;
mod hardware;

pub(crate) mod constants;

pub use emulated::{CsrWrite, EmulatedDevice};
pub use hardware::HardwareDevice;

/// A contiguous host memory region the driver carves buffers out of.
#[derive(Debug, Clone, Copy)]
pub struct ArenaRegion {
    pub base: *mut u8,
    pub size: u64,
}

/// Raw access to one NIC: register I/O, device-memory DMA, and the host
/// memory the rings live in.
///
/// Register offsets are byte offsets into the control BAR. DMA addresses
/// are card-local addresses with the device-memory tag already stripped.
pub trait DeviceAdaptor {
    /// Read a 32-bit control or status register.
    fn read_csr(&self, offset: u32) -> u32;

    /// Write a 32-bit control register.
    fn write_csr(&self, offset: u32, value: u32);

    /// Copy device memory into `buf`, starting at `dev_addr`.
    fn dma_read(&self, dev_addr: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Copy `data` into device memory at `dev_addr`.
    fn dma_write(&self, dev_addr: u64, data: &[u8]) -> Result<(), Error>;

    /// Translate a host virtual address into the physical address the NIC
    /// must be given.
    fn virt_to_phys(&self, virt: u64) -> Result<u64, Error>;

    /// The pinned host arena backing host-resident queues and payloads.
    fn host_arena(&self) -> ArenaRegion;

    /// Capacity of the card-side memory in bytes.
    fn device_mem_size(&self) -> u64;
}
