//! Buffers and the two address spaces they live in.
//!
//! Host buffers come out of a pinned hugepage arena and are named by their
//! physical address. Device buffers live in card memory and are named by a
//! tagged 64-bit address: the top bits carry a fixed pattern that marks the
//! address as device-resident, the low bits are the card-local offset.

pub(crate) const HARDWARE_PAGE_SIZE: u64 = 4096;
pub(crate) const PAGE_ALIGN_MASK: u64 = 0xffff_ffff_ffff_f000;
pub(crate) const PAGE_OFFSET_MASK: u64 = 0xfff;

/// Tag pattern marking an address as device-resident.
pub const DEVICE_MEM_OFFSET: u64 = 0xa350_0000_0000_0000;
/// Bits of the tag pattern that take part in the comparison.
pub const DEVICE_MEM_MASK: u64 = 0xfff0_0000_0000_0000;
/// Bits of a tagged address that form the card-local offset.
pub(crate) const DEVICE_MEM_ADDRESS_MASK: u64 = 0x0000_001F_FFFF_FFFF;

/// Whether `addr` carries the device-memory tag.
pub fn is_device_address(addr: u64) -> bool {
    (addr & DEVICE_MEM_MASK) == DEVICE_MEM_OFFSET
}

/// Strip the tag from a device-resident address, leaving the card-local
/// offset the DMA engine understands.
pub fn device_mem_offset(addr: u64) -> u64 {
    addr & DEVICE_MEM_ADDRESS_MASK
}

/// Where a buffer's backing storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLocation {
    HostMem,
    DeviceMem,
}

/// A carved-out region of host or device memory.
///
/// `ptr` is valid only for host buffers; device buffers have a null `ptr`
/// and are reached through DMA. `dma_addr` is the address the NIC is given:
/// a host physical address, or a tagged device address.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub(crate) ptr: *mut u8,
    pub dma_addr: u64,
    pub size: u64,
    pub location: BufferLocation,
}

impl Buffer {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// View a host buffer as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no DMA engine is writing the buffer while the
    /// slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.size as usize)
    }

    /// Mutable view of a host buffer.
    ///
    /// # Safety
    ///
    /// Same aliasing rules as [`Buffer::as_slice`], plus exclusivity of the
    /// returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.size as usize)
    }
}

/// Size of one address-translation window, kept as a pair of 32-bit masks.
///
/// Local addresses handed to the NIC in work queue entries are masked down
/// to the window before they go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub lsb: u32,
    pub msb: u32,
}

impl WinSize {
    pub(crate) fn from_aperture(aperture: u64) -> Self {
        Self {
            lsb: aperture as u32,
            msb: (aperture >> 32) as u32,
        }
    }

    /// Mask an address down to the window, split into low and high words.
    pub fn mask(&self, addr: u64) -> (u32, u32) {
        (addr as u32 & self.lsb, (addr >> 32) as u32 & self.msb)
    }

    /// Prepare a DMA address for a hardware register pair. Host addresses
    /// are masked to the window; device addresses are flat-mapped and pass
    /// through untouched.
    pub fn mask_dma(&self, addr: u64) -> (u32, u32) {
        if is_device_address(addr) {
            split_addr(addr)
        } else {
            self.mask(addr)
        }
    }
}

/// Split an address into the low/high register words, unmasked.
pub(crate) fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

/// Move a bump-allocator offset forward so a buffer of `size` bytes placed
/// there does not straddle a hardware page unnecessarily.
///
/// Small buffers are kept inside a single page; larger buffers start on a
/// page boundary.
pub(crate) fn carve_offset(offset: u64, size: u64) -> u64 {
    let in_page = offset & PAGE_OFFSET_MASK;
    if size <= HARDWARE_PAGE_SIZE {
        if in_page + size > HARDWARE_PAGE_SIZE {
            return (offset & PAGE_ALIGN_MASK) + HARDWARE_PAGE_SIZE;
        }
    } else if in_page != 0 {
        return (offset & PAGE_ALIGN_MASK) + HARDWARE_PAGE_SIZE;
    }
    offset
}
