//! User-space control-plane driver for an FPGA-based RDMA-capable SmartNIC.
//!
//! The driver owns the NIC's control and status registers through a memory
//! mapped PCIe BAR, carves send/receive/completion rings out of a hugepage
//! arena or out of on-card memory, and drives the RDMA engine with explicit
//! doorbell writes and doorbell polling. There is no interrupt path and no
//! kernel verbs layer; every state transition is a register access issued
//! from this crate.
//!
//! Typical usage builds the stack bottom-up: open a [`device`] backend, wrap
//! it in an [`RnicDevice`] (which programs the host address-translation
//! windows), wrap that in an [`RdmaDevice`], then allocate protection
//! domains and queue pairs.

use thiserror::Error;

pub mod buffer;
pub mod device;
pub mod pd;
pub mod qp;
pub mod rdma;
pub mod rnic;
pub mod wqe;

pub use buffer::{Buffer, BufferLocation, WinSize};
pub use device::{DeviceAdaptor, EmulatedDevice, HardwareDevice};
pub use pd::{PdAccessType, ProtectionDomain};
pub use qp::{PollResult, QpConfig, QueuePair, WqeParams};
pub use rdma::{InterruptMask, MacAddr, RdmaDevice, RdmaGlobalConfig};
pub use rnic::RnicDevice;
pub use wqe::{Wqe, WqeOpcode};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to map the device register window")]
    RegisterWindow(#[source] std::io::Error),
    #[error("failed to allocate the hugepage arena")]
    ArenaAlloc(#[source] std::io::Error),
    #[error("host buffer arena exhausted")]
    HostArenaExhausted,
    #[error("device memory exhausted")]
    DeviceMemExhausted,
    #[error("send queue overflow on QP {0}")]
    SqOverflow(u32),
    #[error("timed out waiting for a completion on QP {0}")]
    CompletionTimeout(u32),
    #[error("timed out waiting for an incoming receive on QP {0}")]
    ReceiveTimeout(u32),
    #[error("fatal recovery of QP {0} did not reach a safe state")]
    RecoveryTimeout(u32),
    #[error("virtual to physical address translation failed")]
    AddrTranslation(#[source] std::io::Error),
    #[error("DMA transfer to or from device memory failed")]
    Dma(#[source] std::io::Error),
    #[error("invalid queue pair id {0}")]
    InvalidQp(u32),
    #[error("protection domain {0} is already allocated")]
    PdInUse(u32),
    #[error("the RDMA engine is already configured")]
    AlreadyOpened,
    #[error("malformed MAC address string")]
    MacParse,
}
