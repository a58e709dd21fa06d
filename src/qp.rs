//! Queue pairs: the send/receive/completion rings and every doorbell that
//! moves them.
//!
//! All queue indices here are monotonic producer/consumer counters bounded
//! by the queue depth; they do not wrap. The driver's shadow copies are
//! advanced only after the matching hardware register has been written or
//! observed, so the shadow never runs ahead of the engine.

use std::net::Ipv4Addr;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::buffer::{split_addr, Buffer, BufferLocation};
use crate::device::constants::{
    GCSR_XRNICADCONF, QCSR_CQBA, QCSR_CQBAMSB, QCSR_CQDBADD, QCSR_CQDBADDMSB, QCSR_CQHEAD,
    QCSR_DESTQPCONF, QCSR_IPDESADDR1, QCSR_LSTRQREQ, QCSR_MACDESADDLSB, QCSR_MACDESADDMSB,
    QCSR_PD, QCSR_QDEPTH, QCSR_QPADVCONF, QCSR_QPCONF, QCSR_RQBA, QCSR_RQBAMSB, QCSR_RQCI,
    QCSR_RQWPTRDBADD, QCSR_RQWPTRDBADDMSB, QCSR_SQBA, QCSR_SQBAMSB, QCSR_SQPI, QCSR_SQPSN,
    QCSR_STATCURSQPTR, QCSR_STATMSN, QCSR_STATQP, QCSR_STATRQPIDB,
};
use crate::pd::ProtectionDomain;
use crate::rdma::{xrnic_advanced_conf, MacAddr, RdmaDevice};
use crate::wqe::{Wqe, WqeOpcode, WQE_SIZE};
use crate::Error;

/// Default bound on doorbell polling iterations.
pub(crate) const TIMEOUT_THRESHOLD: u32 = 1_000_000;

/// Bound on the quiesce wait during fatal recovery.
const RECOVERY_THRESHOLD: u32 = 100_000;

/// Bytes per receive queue entry.
pub const RQE_SIZE: u32 = 512;

/// Bytes per completion queue entry.
const CQE_SIZE: u32 = 4;

/// MTU selector for a 4096-byte path MTU.
const MTU_CONFIG_4096: u32 = 4;

const IP_TTL: u32 = 64;

bitflags! {
    /// Control bits of the per-QP configuration register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QpControl: u32 {
        const ENABLE = 1;
        const RQ_INTR_EN = 1 << 2;
        const CQ_INTR_EN = 1 << 3;
        const HW_HANDSHAKE_DIS = 1 << 4;
        const CQE_WRITE_EN = 1 << 5;
        const UNDER_RECOVERY = 1 << 6;
        const IPV6 = 1 << 7;
    }
}

// STATQP: low byte is the fatal code, bits 9 and 10 report the SQ and RQ
// state machines as quiesced.
const STATQP_FATAL_MASK: u32 = 0xFF;
const STATQP_QUIESCED_MASK: u32 = 0x600;

/// Parameters for [`RdmaDevice::allocate_qp`].
pub struct QpConfig {
    pub qpid: u32,
    pub dst_qpid: u32,
    pub qdepth: u32,
    /// Where the three rings live.
    pub location: BufferLocation,
    /// Host address the engine writes the completion head to.
    pub cq_cidb_addr: u64,
    /// Host address the engine writes the receive producer index to.
    pub rq_cidb_addr: u64,
    pub dst_mac: MacAddr,
    pub dst_ip: Ipv4Addr,
    pub partition_key: u16,
}

/// Parameters for one work queue entry.
pub struct WqeParams {
    pub wrid: u16,
    /// Slot in the send queue, in entries.
    pub wqe_idx: u32,
    pub laddr: u64,
    pub length: u32,
    pub opcode: WqeOpcode,
    pub remote_offset: u64,
    pub r_key: u32,
    /// Inline payload for short sends, ignored by other opcodes.
    pub small_payload: [u32; 4],
    pub immdt_data: u32,
}

/// Outcome of a bounded doorbell poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The doorbell moved; carries the new value.
    Ready(u32),
    TimedOut,
}

pub struct QueuePair {
    pub qpid: u32,
    pub dst_qpid: u32,
    pub qdepth: u32,
    pub(crate) sq: Buffer,
    pub(crate) cq: Buffer,
    pub(crate) rq: Buffer,
    pub sq_pidb: u32,
    pub sq_cidb: u32,
    pub cq_cidb: u32,
    pub rq_pidb: u32,
    pub rq_cidb: u32,
    pub sq_psn: u32,
    pub last_rq_psn: u32,
    pub(crate) pd: ProtectionDomain,
}

impl QueuePair {
    pub fn sq(&self) -> &Buffer {
        &self.sq
    }

    pub fn cq(&self) -> &Buffer {
        &self.cq
    }

    pub fn rq(&self) -> &Buffer {
        &self.rq
    }

    pub fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }
}

fn qp_config_word(qdepth_rqe: u32) -> u32 {
    let ctrl = QpControl::ENABLE
        | QpControl::RQ_INTR_EN
        | QpControl::CQ_INTR_EN
        | QpControl::HW_HANDSHAKE_DIS
        | QpControl::CQE_WRITE_EN;
    ctrl.bits() | (MTU_CONFIG_4096 << 8) | (qdepth_rqe << 16)
}

impl RdmaDevice {
    fn qp_ref(&self, qpid: u32) -> Result<&QueuePair, Error> {
        self.qps.get(&qpid).ok_or(Error::InvalidQp(qpid))
    }

    fn qp_mut(&mut self, qpid: u32) -> Result<&mut QueuePair, Error> {
        self.qps.get_mut(&qpid).ok_or(Error::InvalidQp(qpid))
    }

    /// Allocate the three rings, program every per-QP register, and enable
    /// the queue pair. The protection domain is owned by the queue pair
    /// from here on.
    pub fn allocate_qp(&mut self, pd: ProtectionDomain, config: QpConfig) -> Result<(), Error> {
        let qpid = config.qpid;
        if qpid == 0 || qpid > self.rnic.num_qp || self.qps.contains_key(&qpid) {
            return Err(Error::InvalidQp(qpid));
        }

        let sq = self
            .rnic
            .allocate_buffer(u64::from(config.qdepth) * WQE_SIZE as u64, config.location)?;
        let cq = self
            .rnic
            .allocate_buffer(u64::from(config.qdepth) * u64::from(CQE_SIZE), config.location)?;
        let rq = self
            .rnic
            .allocate_buffer(u64::from(config.qdepth) * u64::from(RQE_SIZE), config.location)?;

        let win = self.rnic.win_size;
        let (rq_lo, rq_hi) = win.mask_dma(rq.dma_addr);
        self.write_qp_csr(QCSR_RQBA, qpid, rq_lo);
        self.write_qp_csr(QCSR_RQBAMSB, qpid, rq_hi);
        let (sq_lo, sq_hi) = win.mask_dma(sq.dma_addr);
        self.write_qp_csr(QCSR_SQBA, qpid, sq_lo);
        self.write_qp_csr(QCSR_SQBAMSB, qpid, sq_hi);
        let (cq_lo, cq_hi) = win.mask_dma(cq.dma_addr);
        self.write_qp_csr(QCSR_CQBA, qpid, cq_lo);
        self.write_qp_csr(QCSR_CQBAMSB, qpid, cq_hi);

        let (rq_db_lo, rq_db_hi) = win.mask_dma(config.rq_cidb_addr);
        self.write_qp_csr(QCSR_RQWPTRDBADD, qpid, rq_db_lo);
        self.write_qp_csr(QCSR_RQWPTRDBADDMSB, qpid, rq_db_hi);
        let (cq_db_lo, cq_db_hi) = win.mask_dma(config.cq_cidb_addr);
        self.write_qp_csr(QCSR_CQDBADD, qpid, cq_db_lo);
        self.write_qp_csr(QCSR_CQDBADDMSB, qpid, cq_db_hi);

        self.write_qp_csr(QCSR_DESTQPCONF, qpid, config.dst_qpid);
        self.write_qp_csr(QCSR_QDEPTH, qpid, config.qdepth | (config.qdepth << 16));
        self.write_qp_csr(QCSR_MACDESADDLSB, qpid, config.dst_mac.lsb);
        self.write_qp_csr(QCSR_MACDESADDMSB, qpid, config.dst_mac.msb);
        self.write_qp_csr(QCSR_IPDESADDR1, qpid, u32::from(config.dst_ip));
        self.write_qp_csr(QCSR_PD, qpid, pd.pd_num);
        self.write_qp_csr(
            QCSR_QPADVCONF,
            qpid,
            (u32::from(config.partition_key) << 16) | (IP_TTL << 8),
        );
        // config register last, with the enable bit, once the rings are
        // visible to the engine
        self.write_qp_csr(QCSR_QPCONF, qpid, qp_config_word(RQE_SIZE));

        self.qps.insert(
            qpid,
            QueuePair {
                qpid,
                dst_qpid: config.dst_qpid,
                qdepth: config.qdepth,
                sq,
                cq,
                rq,
                sq_pidb: 0,
                sq_cidb: 0,
                cq_cidb: 0,
                rq_pidb: 0,
                rq_cidb: 0,
                sq_psn: 0,
                last_rq_psn: 0,
                pd,
            },
        );
        debug!(
            qpid,
            dst_qpid = config.dst_qpid,
            qdepth = config.qdepth,
            "queue pair enabled"
        );
        Ok(())
    }

    /// Seed the expected PSN of the next inbound request.
    pub fn config_last_rq_psn(&mut self, qpid: u32, psn: u32) -> Result<(), Error> {
        self.qp_mut(qpid)?.last_rq_psn = psn;
        // high byte carries the opcode of the last request
        self.write_qp_csr(QCSR_LSTRQREQ, qpid, (0x0a << 24) | (psn & 0x00FF_FFFF));
        Ok(())
    }

    /// Seed the PSN of the next outbound request.
    pub fn config_sq_psn(&mut self, qpid: u32, psn: u32) -> Result<(), Error> {
        self.qp_mut(qpid)?.sq_psn = psn;
        self.write_qp_csr(QCSR_SQPSN, qpid, psn);
        Ok(())
    }

    /// Serialize a work queue entry into its send queue slot. The local
    /// address is masked to the translation window; nothing is submitted
    /// until a doorbell rings.
    pub fn create_wqe(&mut self, qpid: u32, params: WqeParams) -> Result<(), Error> {
        let sq = {
            let qp = self.qp_ref(qpid)?;
            if params.wqe_idx >= qp.qdepth {
                return Err(Error::SqOverflow(qpid));
            }
            qp.sq
        };

        let (laddr_lo, laddr_hi) = self.rnic.win_size.mask_dma(params.laddr);
        let (ro_lo, ro_hi) = split_addr(params.remote_offset);
        let wqe = Wqe {
            wrid: params.wrid,
            laddr_lo,
            laddr_hi,
            length: params.length,
            opcode: params.opcode as u32,
            remote_offset_lo: ro_lo,
            remote_offset_hi: ro_hi,
            r_key: params.r_key,
            small_payload: params.small_payload,
            immdt_data: params.immdt_data,
        };
        let bytes = wqe.to_bytes();
        let offset = params.wqe_idx as usize * WQE_SIZE;

        match sq.location {
            BufferLocation::HostMem => unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), sq.as_mut_ptr().add(offset), WQE_SIZE);
            },
            BufferLocation::DeviceMem => {
                self.rnic
                    .adaptor
                    .dma_write(sq.dma_addr + offset as u64, &bytes)?;
            }
        }
        Ok(())
    }

    /// Bounded poll of the completion head until it moves past `sq_cidb`.
    pub fn poll_cq_cidb(&self, qpid: u32, sq_cidb: u32) -> PollResult {
        let mut iterations = 0u32;
        loop {
            let cidb = self.read_qp_csr(QCSR_CQHEAD, qpid);
            if cidb != sq_cidb {
                return PollResult::Ready(cidb);
            }
            iterations += 1;
            if iterations > self.poll_timeout {
                return PollResult::TimedOut;
            }
        }
    }

    /// Submit one work queue entry and wait for its completion.
    pub fn post_send(&mut self, qpid: u32) -> Result<(), Error> {
        let (sq_cidb, new_pidb) = {
            let qp = self.qp_mut(qpid)?;
            if qp.sq_pidb + 1 > qp.qdepth {
                return Err(Error::SqOverflow(qpid));
            }
            qp.sq_pidb += 1;
            (qp.sq_cidb, qp.sq_pidb)
        };
        self.write_qp_csr(QCSR_SQPI, qpid, new_pidb);

        match self.poll_cq_cidb(qpid, sq_cidb) {
            PollResult::Ready(cidb) => {
                let qp = self.qp_mut(qpid)?;
                qp.cq_cidb = cidb;
                qp.sq_cidb += 1;
                Ok(())
            }
            PollResult::TimedOut => {
                self.dump_registers(true, qpid);
                Err(Error::CompletionTimeout(qpid))
            }
        }
    }

    /// Submit `batch_size` already-serialized entries with one doorbell
    /// write and wait until all of them complete.
    pub fn post_batch_send(&mut self, qpid: u32, batch_size: u32) -> Result<(), Error> {
        let (sq_cidb, new_pidb) = {
            let qp = self.qp_mut(qpid)?;
            if batch_size > qp.qdepth || qp.sq_pidb + batch_size > qp.qdepth {
                return Err(Error::SqOverflow(qpid));
            }
            qp.sq_pidb += batch_size;
            (qp.sq_cidb, qp.sq_pidb)
        };
        self.write_qp_csr(QCSR_SQPI, qpid, new_pidb);

        let mut cidb = sq_cidb;
        while cidb < new_pidb {
            match self.poll_cq_cidb(qpid, cidb) {
                PollResult::Ready(db) => cidb = db,
                PollResult::TimedOut => {
                    self.dump_registers(true, qpid);
                    return Err(Error::CompletionTimeout(qpid));
                }
            }
        }
        let qp = self.qp_mut(qpid)?;
        qp.cq_cidb = cidb;
        qp.sq_cidb = cidb;
        Ok(())
    }

    /// Bounded poll of the receive producer index until the engine lands a
    /// new message. Updates the shadow copy.
    pub fn poll_rq_pidb(&mut self, qpid: u32) -> Result<u32, Error> {
        let known = self.qp_ref(qpid)?.rq_pidb;
        let mut iterations = 0u32;
        loop {
            let pidb = self.read_qp_csr(QCSR_STATRQPIDB, qpid);
            if pidb != known {
                self.qp_mut(qpid)?.rq_pidb = pidb;
                return Ok(pidb);
            }
            iterations += 1;
            if iterations > self.poll_timeout {
                self.dump_registers(false, qpid);
                return Err(Error::ReceiveTimeout(qpid));
            }
        }
    }

    /// Wait for the next inbound message, acknowledge it, and return its
    /// receive queue slot.
    pub fn post_receive(&mut self, qpid: u32) -> Result<Buffer, Error> {
        let pidb = self.poll_rq_pidb(qpid)?;
        let slot_buf = {
            let qp = self.qp_ref(qpid)?;
            // the freshly produced entry sits one slot behind the index
            let slot = if pidb == 0 { qp.qdepth - 1 } else { pidb - 1 };
            let offset = u64::from(slot) * u64::from(RQE_SIZE);
            let ptr = match qp.rq.location {
                BufferLocation::HostMem => unsafe { qp.rq.as_mut_ptr().add(offset as usize) },
                BufferLocation::DeviceMem => std::ptr::null_mut(),
            };
            Buffer {
                ptr,
                dma_addr: qp.rq.dma_addr + offset,
                size: u64::from(RQE_SIZE),
                location: qp.rq.location,
            }
        };
        self.write_rq_cidb(qpid, pidb)?;
        Ok(slot_buf)
    }

    /// RQ consumer doorbell write; the shadow copy is kept in step.
    pub(crate) fn write_rq_cidb(&mut self, qpid: u32, value: u32) -> Result<(), Error> {
        self.write_qp_csr(QCSR_RQCI, qpid, value);
        self.qp_mut(qpid)?.rq_cidb = value;
        Ok(())
    }

    /// Re-acknowledge everything consumed so far. Idempotent; returns
    /// whether the engine has produced entries we have not consumed yet.
    pub fn release_rq_consumed(&mut self, qpid: u32) -> Result<bool, Error> {
        let consumed = self.qp_ref(qpid)?.rq_pidb;
        let produced = self.read_qp_csr(QCSR_STATRQPIDB, qpid);
        self.write_rq_cidb(qpid, consumed)?;
        Ok(produced != consumed)
    }

    /// Recover a queue pair from a fatal condition: wait for the engine to
    /// quiesce it, drain outstanding completions, then park it disabled
    /// with the recovery bit set. Both waits are bounded and expiry of
    /// either surfaces as [`Error::RecoveryTimeout`].
    pub fn qp_fatal_recovery(&mut self, qpid: u32) -> Result<(), Error> {
        self.qp_ref(qpid)?;
        warn!(qpid, "starting fatal recovery");

        let mut iterations = 0u32;
        loop {
            let statqp = self.read_qp_csr(QCSR_STATQP, qpid);
            if statqp & STATQP_QUIESCED_MASK != 0 {
                break;
            }
            iterations += 1;
            if iterations > RECOVERY_THRESHOLD {
                return Err(Error::RecoveryTimeout(qpid));
            }
        }

        let mut iterations = 0u32;
        loop {
            let cqhead = self.read_qp_csr(QCSR_CQHEAD, qpid);
            let sqpi = self.read_qp_csr(QCSR_SQPI, qpid);
            if cqhead == sqpi {
                break;
            }
            iterations += 1;
            if iterations > RECOVERY_THRESHOLD {
                warn!(qpid, cqhead, sqpi, "completions did not drain");
                return Err(Error::RecoveryTimeout(qpid));
            }
        }

        let conf = self.read_qp_csr(QCSR_QPCONF, qpid);
        self.write_qp_csr(
            QCSR_QPCONF,
            qpid,
            (conf & !QpControl::ENABLE.bits()) | QpControl::UNDER_RECOVERY.bits(),
        );
        warn!(qpid, "queue pair parked for recovery");
        Ok(())
    }

    /// Disable a queue pair and reset its hardware indices so the id can
    /// be reused. Index registers are writable only inside the software
    /// override window armed through the advanced configuration register.
    pub fn destroy_qp(&mut self, qpid: u32) -> Result<(), Error> {
        self.qp_ref(qpid)?;

        let statqp = self.read_qp_csr(QCSR_STATQP, qpid);
        let cqhead = self.read_qp_csr(QCSR_CQHEAD, qpid);
        let sqpi = self.read_qp_csr(QCSR_SQPI, qpid);
        let healthy = statqp & STATQP_FATAL_MASK == 0
            && statqp & STATQP_QUIESCED_MASK == STATQP_QUIESCED_MASK
            && cqhead == sqpi;
        if !healthy {
            self.qp_fatal_recovery(qpid)?;
        }

        self.rnic
            .adaptor
            .write_csr(GCSR_XRNICADCONF, xrnic_advanced_conf(true, qpid));

        let conf = self.read_qp_csr(QCSR_QPCONF, qpid);
        self.write_qp_csr(QCSR_QPCONF, qpid, conf & !QpControl::ENABLE.bits());
        for reg in [
            QCSR_RQWPTRDBADD,
            QCSR_SQPI,
            QCSR_CQHEAD,
            QCSR_RQCI,
            QCSR_STATRQPIDB,
            QCSR_STATCURSQPTR,
            QCSR_SQPSN,
            QCSR_LSTRQREQ,
            QCSR_STATMSN,
        ] {
            self.write_qp_csr(reg, qpid, 0);
        }
        self.write_qp_csr(
            QCSR_QPCONF,
            qpid,
            (conf & !QpControl::ENABLE.bits()) | QpControl::UNDER_RECOVERY.bits(),
        );

        self.rnic
            .adaptor
            .write_csr(GCSR_XRNICADCONF, xrnic_advanced_conf(false, 0));

        if let Some(qp) = self.qps.remove(&qpid) {
            self.pd_in_use.remove(&qp.pd.pd_num);
        }
        debug!(qpid, "queue pair destroyed");
        Ok(())
    }
}
