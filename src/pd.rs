//! Protection domains and memory region registration.
//!
//! A protection domain is a row in the engine's on-chip table tying an
//! r_key to the one buffer remote peers may touch through it. Domains are
//! never shared between queue pairs; tearing a queue pair down frees its
//! domain number for reuse.

use tracing::debug;

use crate::buffer::{split_addr, Buffer, BufferLocation};
use crate::device::constants::{
    PDT_ACCESSDESC, PDT_BUFBASEADDRLSB, PDT_BUFBASEADDRMSB, PDT_BUFRKEY, PDT_PDNUM,
    PDT_VIRTADDRLSB, PDT_VIRTADDRMSB, PDT_WRRDBUFLEN,
};
use crate::rdma::RdmaDevice;
use crate::Error;

/// Remote access rights recorded in the domain's table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PdAccessType {
    ReadOnly = 0,
    WriteOnly = 1,
    ReadWrite = 2,
}

pub struct ProtectionDomain {
    pub pd_num: u32,
    pub r_key: u32,
    pub(crate) access: PdAccessType,
    pub(crate) mr_buffer: Option<Buffer>,
}

impl ProtectionDomain {
    /// The registered buffer, if a memory region has been attached.
    pub fn mr_buffer(&self) -> Option<&Buffer> {
        self.mr_buffer.as_ref()
    }
}

impl RdmaDevice {
    /// Claim a protection domain number and write its table row.
    pub fn allocate_pd(&mut self, pd_num: u32) -> Result<ProtectionDomain, Error> {
        if !self.pd_in_use.insert(pd_num) {
            return Err(Error::PdInUse(pd_num));
        }
        self.write_pd_csr(PDT_PDNUM, pd_num, pd_num);
        debug!(pd_num, "allocated protection domain");
        Ok(ProtectionDomain {
            pd_num,
            r_key: 0,
            access: PdAccessType::ReadWrite,
            mr_buffer: None,
        })
    }

    /// Attach a buffer to the domain so remote peers holding `r_key` may
    /// reach it. The virtual address column is what remote offsets are
    /// relative to: the host pointer for host buffers, the tagged address
    /// for device buffers.
    pub fn register_memory_region(
        &mut self,
        pd: &mut ProtectionDomain,
        r_key: u32,
        access: PdAccessType,
        buffer: Buffer,
    ) {
        let virt = match buffer.location {
            BufferLocation::HostMem => buffer.as_mut_ptr() as u64,
            BufferLocation::DeviceMem => buffer.dma_addr,
        };
        let (virt_lo, virt_hi) = split_addr(virt);
        let (base_lo, base_hi) = self.rnic.win_size.mask_dma(buffer.dma_addr);

        self.write_pd_csr(PDT_VIRTADDRLSB, pd.pd_num, virt_lo);
        self.write_pd_csr(PDT_VIRTADDRMSB, pd.pd_num, virt_hi);
        self.write_pd_csr(PDT_BUFBASEADDRLSB, pd.pd_num, base_lo);
        self.write_pd_csr(PDT_BUFBASEADDRMSB, pd.pd_num, base_hi);
        self.write_pd_csr(PDT_BUFRKEY, pd.pd_num, r_key);
        self.write_pd_csr(PDT_WRRDBUFLEN, pd.pd_num, buffer.size as u32);
        // high half carries the length bits that do not fit the 32-bit
        // length register
        self.write_pd_csr(
            PDT_ACCESSDESC,
            pd.pd_num,
            (((buffer.size >> 32) as u32) << 16) | access as u32,
        );

        pd.r_key = r_key;
        pd.access = access;
        pd.mr_buffer = Some(buffer);
        debug!(pd_num = pd.pd_num, r_key, size = buffer.size, "registered memory region");
    }
}
