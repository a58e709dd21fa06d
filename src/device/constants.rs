//! Register map of the RDMA engine and the address-translation bridge.
//!
//! Global registers live in a single block; per-QP and per-PD registers are
//! addressed by adding a fixed stride to the QP1 (or PD0) offset.

// Global configuration registers.
pub(crate) const GCSR_XRNICCONF: u32 = 0x0002_0000;
pub(crate) const GCSR_XRNICADCONF: u32 = 0x0002_0004;
pub(crate) const GCSR_MACXADDLSB: u32 = 0x0002_0010;
pub(crate) const GCSR_MACXADDMSB: u32 = 0x0002_0014;
pub(crate) const GCSR_IPV4XADD: u32 = 0x0002_0070;
pub(crate) const GCSR_ERRBUFBA: u32 = 0x0002_0060;
pub(crate) const GCSR_ERRBUFBAMSB: u32 = 0x0002_0064;
pub(crate) const GCSR_ERRBUFSZ: u32 = 0x0002_0068;
pub(crate) const GCSR_ERRBUFWPTR: u32 = 0x0002_006C;
pub(crate) const GCSR_IPKTERRQBA: u32 = 0x0002_0088;
pub(crate) const GCSR_IPKTERRQBAMSB: u32 = 0x0002_008C;
pub(crate) const GCSR_IPKTERRQSZ: u32 = 0x0002_0090;
pub(crate) const GCSR_IPKTERRQWPTR: u32 = 0x0002_0094;
pub(crate) const GCSR_DATBUFBA: u32 = 0x0002_00A0;
pub(crate) const GCSR_DATBUFBAMSB: u32 = 0x0002_00A4;
pub(crate) const GCSR_DATBUFSZ: u32 = 0x0002_00A8;
pub(crate) const GCSR_RESPERRPKTBA: u32 = 0x0002_00B0;
pub(crate) const GCSR_RESPERRPKTBAMSB: u32 = 0x0002_00B4;
pub(crate) const GCSR_RESPERRSZ: u32 = 0x0002_00B8;
pub(crate) const GCSR_RESPERRSZMSB: u32 = 0x0002_00BC;
pub(crate) const GCSR_INTEN: u32 = 0x0002_0180;
pub(crate) const GCSR_INTSTS: u32 = 0x0002_0184;
// first of eight consecutive per-queue interrupt status words each
pub(crate) const GCSR_RQINTSTS1: u32 = 0x0002_0190;
pub(crate) const GCSR_CQINTSTS1: u32 = 0x0002_01B0;

// Global status registers, read-only from the host.
pub(crate) const GCSR_INSRRPKTCNT: u32 = 0x0002_0100;
pub(crate) const GCSR_INAMPKTCNT: u32 = 0x0002_0104;
pub(crate) const GCSR_OUTIOPKTCNT: u32 = 0x0002_0108;
pub(crate) const GCSR_OUTAMPKTCNT: u32 = 0x0002_010C;
pub(crate) const GCSR_LSTINPKT: u32 = 0x0002_0110;
pub(crate) const GCSR_LSTOUTPKT: u32 = 0x0002_0114;
pub(crate) const GCSR_ININVDUPCNT: u32 = 0x0002_0118;
pub(crate) const GCSR_INNCKPKTSTS: u32 = 0x0002_011C;
pub(crate) const GCSR_OUTRNRPKTSTS: u32 = 0x0002_0120;
pub(crate) const GCSR_WQEPROCSTS: u32 = 0x0002_0124;
pub(crate) const GCSR_QPMSTS: u32 = 0x0002_012C;
pub(crate) const GCSR_INALLDRPPKTCNT: u32 = 0x0002_0130;
pub(crate) const GCSR_INNAKPKTCNT: u32 = 0x0002_0134;
pub(crate) const GCSR_OUTNAKPKTCNT: u32 = 0x0002_0138;
pub(crate) const GCSR_RESPHNDSTS: u32 = 0x0002_013C;
pub(crate) const GCSR_RETRYCNTSTS: u32 = 0x0002_0140;
pub(crate) const GCSR_INCNPPKTCNT: u32 = 0x0002_0174;
pub(crate) const GCSR_OUTCNPPKTCNT: u32 = 0x0002_0178;
pub(crate) const GCSR_OUTRDRSPPKTCNT: u32 = 0x0002_017C;

// Per-QP registers; these are the QP1 offsets, see `qp_csr_addr`.
pub(crate) const QCSR_QPCONF: u32 = 0x0002_0200;
pub(crate) const QCSR_QPADVCONF: u32 = 0x0002_0204;
pub(crate) const QCSR_RQBA: u32 = 0x0002_0208;
pub(crate) const QCSR_RQBAMSB: u32 = 0x0002_02C0;
pub(crate) const QCSR_SQBA: u32 = 0x0002_0210;
pub(crate) const QCSR_SQBAMSB: u32 = 0x0002_02C8;
pub(crate) const QCSR_CQBA: u32 = 0x0002_0218;
pub(crate) const QCSR_CQBAMSB: u32 = 0x0002_02D0;
pub(crate) const QCSR_RQWPTRDBADD: u32 = 0x0002_0220;
pub(crate) const QCSR_RQWPTRDBADDMSB: u32 = 0x0002_0224;
pub(crate) const QCSR_CQDBADD: u32 = 0x0002_0228;
pub(crate) const QCSR_CQDBADDMSB: u32 = 0x0002_022C;
pub(crate) const QCSR_CQHEAD: u32 = 0x0002_0230;
pub(crate) const QCSR_RQCI: u32 = 0x0002_0234;
pub(crate) const QCSR_SQPI: u32 = 0x0002_0238;
pub(crate) const QCSR_QDEPTH: u32 = 0x0002_023C;
pub(crate) const QCSR_SQPSN: u32 = 0x0002_0240;
pub(crate) const QCSR_LSTRQREQ: u32 = 0x0002_0244;
pub(crate) const QCSR_DESTQPCONF: u32 = 0x0002_0248;
pub(crate) const QCSR_MACDESADDLSB: u32 = 0x0002_0250;
pub(crate) const QCSR_MACDESADDMSB: u32 = 0x0002_0254;
pub(crate) const QCSR_IPDESADDR1: u32 = 0x0002_0260;
pub(crate) const QCSR_PD: u32 = 0x0002_02B0;

// Per-QP status registers.
pub(crate) const QCSR_STATSSN: u32 = 0x0002_0280;
pub(crate) const QCSR_STATMSN: u32 = 0x0002_0284;
pub(crate) const QCSR_STATQP: u32 = 0x0002_0288;
pub(crate) const QCSR_STATCURSQPTR: u32 = 0x0002_028C;
pub(crate) const QCSR_STATRESPSN: u32 = 0x0002_0290;
pub(crate) const QCSR_STATRQBUFCA: u32 = 0x0002_0294;
pub(crate) const QCSR_STATWQE: u32 = 0x0002_0298;
pub(crate) const QCSR_STATRQPIDB: u32 = 0x0002_029C;
pub(crate) const QCSR_STATRQBUFCAMSB: u32 = 0x0002_02D8;

// Protection domain table; PD0 offsets, see `pd_csr_addr`.
pub(crate) const PDT_PDNUM: u32 = 0x0001_8000;
pub(crate) const PDT_VIRTADDRLSB: u32 = 0x0001_8004;
pub(crate) const PDT_VIRTADDRMSB: u32 = 0x0001_8008;
pub(crate) const PDT_BUFBASEADDRLSB: u32 = 0x0001_800C;
pub(crate) const PDT_BUFBASEADDRMSB: u32 = 0x0001_8010;
pub(crate) const PDT_BUFRKEY: u32 = 0x0001_8014;
pub(crate) const PDT_WRRDBUFLEN: u32 = 0x0001_8018;
pub(crate) const PDT_ACCESSDESC: u32 = 0x0001_801C;

// Address-translation bridge between host physical addresses and the AXI
// addresses the NIC emits. Eight windows, a six-register block each.
pub(crate) const AXIB_BDF_TRANSLATE_LSB: u32 = 0x0010_2420;
pub(crate) const AXIB_BDF_TRANSLATE_MSB: u32 = 0x0010_2424;
pub(crate) const AXIB_BDF_PASID: u32 = 0x0010_2428;
pub(crate) const AXIB_BDF_FUNCTION: u32 = 0x0010_242C;
pub(crate) const AXIB_BDF_MAP_CONTROL: u32 = 0x0010_2430;
pub(crate) const AXIB_BDF_RESERVED: u32 = 0x0010_2434;
pub(crate) const AXIB_BDF_WIN_STRIDE: u32 = 0x20;
pub(crate) const AXIB_BDF_NUM_WINDOWS: u32 = 8;

/// Size of the register window mapped from the PCIe resource file.
pub(crate) const CSR_MAP_SIZE: usize = 0x0020_0000;

/// Aperture of the address-translation bridge, as a mask (one terabyte).
pub(crate) const AXI_BAR_SIZE: u64 = 0x0000_00FF_FFFF_FFFF;
pub(crate) const AXIB_ADDR_MASK: u64 = 0xFFFF_FFFF;

pub(crate) const QP_STRIDE: u32 = 0x100;
pub(crate) const PD_STRIDE: u32 = 0x100;

/// Address of a per-QP register. QP ids are one-based.
pub(crate) const fn qp_csr_addr(offset: u32, qpid: u32) -> u32 {
    offset + QP_STRIDE * (qpid - 1)
}

/// Address of a protection domain table entry register.
pub(crate) const fn pd_csr_addr(offset: u32, pd_num: u32) -> u32 {
    offset + PD_STRIDE * pd_num
}

/// Address of a per-window address-translation bridge register.
pub(crate) const fn bdf_csr_addr(offset: u32, win: u32) -> u32 {
    offset + AXIB_BDF_WIN_STRIDE * win
}
