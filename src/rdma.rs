//! The RDMA engine: global configuration and teardown.
//!
//! [`RdmaDevice`] sits on top of [`RnicDevice`] and owns every queue pair
//! and protection domain. Opening the device programs the engine-wide
//! registers (station address, error and data buffers, engine enable);
//! destroying it tears down all queue pairs and disables the engine.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::str::FromStr;

use bitflags::bitflags;
use tracing::{debug, info};

use crate::buffer::{split_addr, Buffer, BufferLocation};
use crate::device::constants::{
    pd_csr_addr, qp_csr_addr, GCSR_DATBUFBA, GCSR_DATBUFBAMSB, GCSR_DATBUFSZ, GCSR_ERRBUFBA,
    GCSR_ERRBUFBAMSB, GCSR_ERRBUFSZ, GCSR_ERRBUFWPTR, GCSR_INALLDRPPKTCNT, GCSR_INAMPKTCNT,
    GCSR_INCNPPKTCNT, GCSR_ININVDUPCNT, GCSR_INNAKPKTCNT, GCSR_INNCKPKTSTS, GCSR_INSRRPKTCNT,
    GCSR_INTEN, GCSR_INTSTS, GCSR_IPKTERRQBA, GCSR_IPKTERRQBAMSB, GCSR_IPKTERRQSZ,
    GCSR_CQINTSTS1, GCSR_IPKTERRQWPTR, GCSR_IPV4XADD, GCSR_LSTINPKT, GCSR_LSTOUTPKT, GCSR_MACXADDLSB,
    GCSR_MACXADDMSB, GCSR_OUTAMPKTCNT, GCSR_OUTCNPPKTCNT, GCSR_OUTIOPKTCNT, GCSR_OUTNAKPKTCNT,
    GCSR_OUTRDRSPPKTCNT, GCSR_OUTRNRPKTSTS, GCSR_QPMSTS, GCSR_RESPERRPKTBA, GCSR_RESPERRPKTBAMSB,
    GCSR_RESPERRSZ, GCSR_RESPERRSZMSB, GCSR_RESPHNDSTS, GCSR_RETRYCNTSTS, GCSR_RQINTSTS1,
    GCSR_WQEPROCSTS, GCSR_XRNICADCONF, GCSR_XRNICCONF, QCSR_CQHEAD, QCSR_RQCI, QCSR_SQPI,
    QCSR_STATCURSQPTR, QCSR_STATMSN, QCSR_STATQP, QCSR_STATRESPSN, QCSR_STATRQBUFCA,
    QCSR_STATRQBUFCAMSB, QCSR_STATRQPIDB, QCSR_STATSSN, QCSR_STATWQE,
};
use crate::qp::{QueuePair, TIMEOUT_THRESHOLD};
use crate::rnic::RnicDevice;
use crate::Error;

/// A 48-bit station address, pre-split into the register words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr {
    pub lsb: u32,
    pub msb: u32,
}

impl MacAddr {
    pub fn from_bytes(b: [u8; 6]) -> Self {
        Self {
            msb: (u32::from(b[0]) << 8) | u32::from(b[1]),
            lsb: (u32::from(b[2]) << 24)
                | (u32::from(b[3]) << 16)
                | (u32::from(b[4]) << 8)
                | u32::from(b[5]),
        }
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or(Error::MacParse)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| Error::MacParse)?;
        }
        if parts.next().is_some() {
            return Err(Error::MacParse);
        }
        Ok(Self::from_bytes(bytes))
    }
}

/// Engine-wide configuration written once at open time.
///
/// The error, drop-queue, data and response-error buffers must have been
/// allocated from this device so their DMA addresses are meaningful to
/// the engine.
pub struct RdmaGlobalConfig {
    pub local_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    pub udp_sport: u16,
    pub err_buf: Buffer,
    pub num_err_buf: u16,
    pub per_err_buf_size: u16,
    pub ipkt_err_q: Buffer,
    pub data_buf: Buffer,
    pub num_data_buf: u16,
    pub per_data_buf_size: u16,
    pub resp_err_buf: Buffer,
}

pub struct RdmaDevice {
    pub(crate) rnic: RnicDevice,
    pub(crate) qps: HashMap<u32, QueuePair>,
    pub(crate) pd_in_use: HashSet<u32>,
    pub(crate) poll_timeout: u32,
    opened: bool,
}

bitflags! {
    /// Engine interrupt sources, the low bits of INTEN.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptMask: u32 {
        const PKT_VALIDATION_ERR = 1;
        const MAD_RECEIVED = 1 << 1;
        // bit 2 is reserved but the stock configuration sets it
        const _ = 1 << 2;
        const RNR_NACK_GENERATED = 1 << 3;
        const WQE_COMPLETION = 1 << 4;
        const ILLEGAL_SQ_OPCODE = 1 << 5;
        const RQ_PKT_RECEIVED = 1 << 6;
        const FATAL_ERROR = 1 << 7;
        const CNP_SCHEDULING = 1 << 8;
    }
}

/// Engine enable plus error-buffer enable, the low byte of XRNICCONF.
const XRNIC_EN_WITH_ERRBUF: u32 = (1 << 5) | 1;
/// Retry-count-exceeded is handled in software, not as a hardware fatal.
const XRNIC_RETRY_CNT_FATAL_DIS: u32 = 1 << 2;
const XRNIC_BASE_COUNT_WIDTH: u32 = 10;

pub(crate) fn xrnic_conf(udp_sport: u16, num_qp: u32) -> u32 {
    (u32::from(udp_sport) << 16) | (num_qp << 8) | XRNIC_EN_WITH_ERRBUF
}

pub(crate) fn xrnic_advanced_conf(sw_override: bool, override_qpid: u32) -> u32 {
    (override_qpid << 24)
        | (XRNIC_BASE_COUNT_WIDTH << 16)
        | XRNIC_RETRY_CNT_FATAL_DIS
        | u32::from(sw_override)
}

impl RdmaDevice {
    pub fn new(rnic: RnicDevice) -> Self {
        Self {
            rnic,
            qps: HashMap::new(),
            pd_in_use: HashSet::new(),
            poll_timeout: TIMEOUT_THRESHOLD,
            opened: false,
        }
    }

    /// Bound on doorbell polling iterations before an operation reports a
    /// timeout instead of spinning forever.
    pub fn set_poll_timeout(&mut self, iterations: u32) {
        self.poll_timeout = iterations;
    }

    pub fn num_qp(&self) -> u32 {
        self.rnic.num_qp
    }

    pub fn qp(&self, qpid: u32) -> Option<&QueuePair> {
        self.qps.get(&qpid)
    }

    /// Carve a buffer from the host arena or card memory.
    pub fn allocate_buffer(
        &mut self,
        size: u64,
        location: BufferLocation,
    ) -> Result<Buffer, Error> {
        self.rnic.allocate_buffer(size, location)
    }

    /// Program the engine-wide registers and enable the engine.
    pub fn open(&mut self, config: &RdmaGlobalConfig) -> Result<(), Error> {
        if self.opened {
            return Err(Error::AlreadyOpened);
        }

        let dev = &self.rnic.adaptor;

        dev.write_csr(GCSR_MACXADDLSB, config.local_mac.lsb);
        dev.write_csr(GCSR_MACXADDMSB, config.local_mac.msb);
        dev.write_csr(GCSR_IPV4XADD, u32::from(config.local_ip));

        let (err_lo, err_hi) = self.rnic.win_size.mask_dma(config.err_buf.dma_addr);
        dev.write_csr(GCSR_ERRBUFBA, err_lo);
        dev.write_csr(GCSR_ERRBUFBAMSB, err_hi);
        dev.write_csr(
            GCSR_ERRBUFSZ,
            u32::from(config.num_err_buf) | (u32::from(config.per_err_buf_size) << 16),
        );

        let (errq_lo, errq_hi) = self.rnic.win_size.mask_dma(config.ipkt_err_q.dma_addr);
        dev.write_csr(GCSR_IPKTERRQBA, errq_lo);
        dev.write_csr(GCSR_IPKTERRQBAMSB, errq_hi);
        dev.write_csr(GCSR_IPKTERRQSZ, config.ipkt_err_q.size as u32);

        let (dat_lo, dat_hi) = self.rnic.win_size.mask_dma(config.data_buf.dma_addr);
        dev.write_csr(GCSR_DATBUFBA, dat_lo);
        dev.write_csr(GCSR_DATBUFBAMSB, dat_hi);
        dev.write_csr(
            GCSR_DATBUFSZ,
            u32::from(config.num_data_buf) | (u32::from(config.per_data_buf_size) << 16),
        );

        let (resp_lo, resp_hi) = self.rnic.win_size.mask_dma(config.resp_err_buf.dma_addr);
        dev.write_csr(GCSR_RESPERRPKTBA, resp_lo);
        dev.write_csr(GCSR_RESPERRPKTBAMSB, resp_hi);
        let (sz_lo, sz_hi) = split_addr(config.resp_err_buf.size);
        dev.write_csr(GCSR_RESPERRSZ, sz_lo);
        dev.write_csr(GCSR_RESPERRSZMSB, sz_hi);

        // every source except CNP scheduling, as the kernel side expects
        let intr = InterruptMask::all() - InterruptMask::CNP_SCHEDULING;
        dev.write_csr(GCSR_INTEN, intr.bits());

        dev.write_csr(GCSR_XRNICADCONF, xrnic_advanced_conf(false, 0));
        dev.write_csr(
            GCSR_XRNICCONF,
            xrnic_conf(config.udp_sport, self.rnic.num_qp),
        );

        self.opened = true;
        info!(
            udp_sport = config.udp_sport,
            num_qp = self.rnic.num_qp,
            "RDMA engine enabled"
        );
        Ok(())
    }

    /// Tear down every queue pair, then disable the engine.
    pub fn destroy(&mut self) -> Result<(), Error> {
        let qpids: Vec<u32> = self.qps.keys().copied().collect();
        for qpid in qpids {
            self.destroy_qp(qpid)?;
        }
        self.rnic.adaptor.write_csr(GCSR_XRNICCONF, 0);
        self.opened = false;
        debug!("RDMA engine disabled");
        Ok(())
    }

    pub(crate) fn read_qp_csr(&self, offset: u32, qpid: u32) -> u32 {
        self.rnic.adaptor.read_csr(qp_csr_addr(offset, qpid))
    }

    pub(crate) fn write_qp_csr(&self, offset: u32, qpid: u32, value: u32) {
        self.rnic.adaptor.write_csr(qp_csr_addr(offset, qpid), value);
    }

    pub(crate) fn write_pd_csr(&self, offset: u32, pd_num: u32, value: u32) {
        self.rnic.adaptor.write_csr(pd_csr_addr(offset, pd_num), value);
    }

    /// Log the engine-wide and per-QP status registers. Called on timeout
    /// before the error is returned so the hardware state is on record.
    pub fn dump_registers(&self, sender: bool, qpid: u32) {
        let dev = &self.rnic.adaptor;

        info!(side = if sender { "sender" } else { "receiver" }, qpid, "register dump");
        info!(
            xrnicconf = dev.read_csr(GCSR_XRNICCONF),
            xrnicadconf = dev.read_csr(GCSR_XRNICADCONF),
            inten = dev.read_csr(GCSR_INTEN),
            intsts = dev.read_csr(GCSR_INTSTS),
            "global config"
        );
        for word in 0..8 {
            info!(
                word,
                rqintsts = dev.read_csr(GCSR_RQINTSTS1 + 4 * word),
                cqintsts = dev.read_csr(GCSR_CQINTSTS1 + 4 * word),
                "per-queue interrupt status"
            );
        }
        info!(
            insrrpktcnt = dev.read_csr(GCSR_INSRRPKTCNT),
            inampktcnt = dev.read_csr(GCSR_INAMPKTCNT),
            outiopktcnt = dev.read_csr(GCSR_OUTIOPKTCNT),
            outampktcnt = dev.read_csr(GCSR_OUTAMPKTCNT),
            lstinpkt = dev.read_csr(GCSR_LSTINPKT),
            lstoutpkt = dev.read_csr(GCSR_LSTOUTPKT),
            ininvdupcnt = dev.read_csr(GCSR_ININVDUPCNT),
            innckpktsts = dev.read_csr(GCSR_INNCKPKTSTS),
            outrnrpktsts = dev.read_csr(GCSR_OUTRNRPKTSTS),
            wqeprocsts = dev.read_csr(GCSR_WQEPROCSTS),
            "packet counters"
        );
        info!(
            qpmsts = dev.read_csr(GCSR_QPMSTS),
            inalldrppktcnt = dev.read_csr(GCSR_INALLDRPPKTCNT),
            innakpktcnt = dev.read_csr(GCSR_INNAKPKTCNT),
            outnakpktcnt = dev.read_csr(GCSR_OUTNAKPKTCNT),
            resphndsts = dev.read_csr(GCSR_RESPHNDSTS),
            retrycntsts = dev.read_csr(GCSR_RETRYCNTSTS),
            incnppktcnt = dev.read_csr(GCSR_INCNPPKTCNT),
            outcnppktcnt = dev.read_csr(GCSR_OUTCNPPKTCNT),
            outrdrsppktcnt = dev.read_csr(GCSR_OUTRDRSPPKTCNT),
            errbufwptr = dev.read_csr(GCSR_ERRBUFWPTR),
            ipkterrqwptr = dev.read_csr(GCSR_IPKTERRQWPTR),
            "engine status"
        );
        info!(
            statqp = self.read_qp_csr(QCSR_STATQP, qpid),
            statssn = self.read_qp_csr(QCSR_STATSSN, qpid),
            statmsn = self.read_qp_csr(QCSR_STATMSN, qpid),
            statcursqptr = self.read_qp_csr(QCSR_STATCURSQPTR, qpid),
            statrespsn = self.read_qp_csr(QCSR_STATRESPSN, qpid),
            statwqe = self.read_qp_csr(QCSR_STATWQE, qpid),
            sqpi = self.read_qp_csr(QCSR_SQPI, qpid),
            cqhead = self.read_qp_csr(QCSR_CQHEAD, qpid),
            "qp status"
        );
        if !sender {
            info!(
                statrqpidb = self.read_qp_csr(QCSR_STATRQPIDB, qpid),
                rqci = self.read_qp_csr(QCSR_RQCI, qpid),
                statrqbufca = self.read_qp_csr(QCSR_STATRQBUFCA, qpid),
                statrqbufcamsb = self.read_qp_csr(QCSR_STATRQBUFCAMSB, qpid),
                "receive status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_word_packs_sport_qp_count_and_enable() {
        assert_eq!(xrnic_conf(0x12B7, 8), 0x12B7_0821);
        assert_eq!(xrnic_conf(0, 1), 0x0000_0121);
    }

    #[test]
    fn advanced_config_word_carries_the_override_bit() {
        let armed = xrnic_advanced_conf(true, 3);
        assert_eq!(armed & 1, 1);
        assert_eq!(armed >> 24, 3);
        assert_eq!(armed & (1 << 2), 1 << 2);

        let disarmed = xrnic_advanced_conf(false, 0);
        assert_eq!(disarmed & 1, 0);
        assert_eq!(disarmed >> 16 & 0xFF, 10);
    }

    #[test]
    fn interrupt_mask_covers_the_low_byte() {
        let intr = InterruptMask::all() - InterruptMask::CNP_SCHEDULING;
        assert_eq!(intr.bits(), 0xFF);
    }

    #[test]
    fn mac_addr_parses_and_splits() {
        let mac: MacAddr = "16:31:4b:00:02:01".parse().unwrap();
        assert_eq!(mac.msb, 0x1631);
        assert_eq!(mac.lsb, 0x4B00_0201);
        assert!("16:31:4b".parse::<MacAddr>().is_err());
        assert!("zz:31:4b:00:02:01".parse::<MacAddr>().is_err());
    }
}
