//! Control-plane scenarios driven end to end against the emulated backend.
//!
//! Register addresses asserted here are spelled out numerically so the
//! tests double as a check that the driver's map matches the hardware
//! documentation: the global block starts at 0x20000 and per-QP registers
//! sit at 0x20200 plus 0x100 per QP.

use std::rc::Rc;

use rnic_driver::{
    BufferLocation, DeviceAdaptor, EmulatedDevice, Error, MacAddr, PdAccessType, QpConfig,
    RdmaDevice, RdmaGlobalConfig, RnicDevice, WqeOpcode, WqeParams,
};

const XRNICCONF: u32 = 0x0002_0000;
const XRNICADCONF: u32 = 0x0002_0004;

const fn qp1(reg: u32) -> u32 {
    0x0002_0200 + reg
}

const QPCONF: u32 = qp1(0x00);
const CQHEAD: u32 = qp1(0x30);
const RQCI: u32 = qp1(0x34);
const SQPI: u32 = qp1(0x38);
const SQPSN: u32 = qp1(0x40);
const LSTRQREQ: u32 = qp1(0x44);
const STATQP: u32 = qp1(0x88);
const STATRQPIDB: u32 = qp1(0x9C);

fn open_device(num_qp: u32) -> (Rc<EmulatedDevice>, RdmaDevice) {
    // makes the diagnostic dumps on the timeout paths visible under
    // `cargo test -- --nocapture`
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let emu = Rc::new(EmulatedDevice::new(1 << 22, 1 << 22));
    let rnic = RnicDevice::new(emu.clone(), num_qp).unwrap();
    let mut dev = RdmaDevice::new(rnic);
    dev.set_poll_timeout(200);

    let err_buf = dev.allocate_buffer(4096, BufferLocation::HostMem).unwrap();
    let ipkt_err_q = dev.allocate_buffer(8192, BufferLocation::HostMem).unwrap();
    let data_buf = dev.allocate_buffer(16384, BufferLocation::HostMem).unwrap();
    let resp_err_buf = dev.allocate_buffer(4096, BufferLocation::HostMem).unwrap();
    let config = RdmaGlobalConfig {
        local_mac: "16:31:4b:00:02:01".parse().unwrap(),
        local_ip: "192.168.0.5".parse().unwrap(),
        udp_sport: 0x12B7,
        err_buf,
        num_err_buf: 64,
        per_err_buf_size: 64,
        ipkt_err_q,
        data_buf,
        num_data_buf: 64,
        per_data_buf_size: 256,
        resp_err_buf,
    };
    dev.open(&config).unwrap();
    (emu, dev)
}

fn setup_qp(dev: &mut RdmaDevice, qpid: u32, location: BufferLocation) {
    let mut pd = dev.allocate_pd(qpid - 1).unwrap();
    let mr = dev.allocate_buffer(8192, location).unwrap();
    dev.register_memory_region(&mut pd, 0x0008, PdAccessType::ReadWrite, mr);

    let doorbells = dev.allocate_buffer(8, BufferLocation::HostMem).unwrap();
    let dst_mac: MacAddr = "16:31:4b:00:02:02".parse().unwrap();
    dev.allocate_qp(
        pd,
        QpConfig {
            qpid,
            dst_qpid: qpid,
            qdepth: 8,
            location,
            cq_cidb_addr: doorbells.dma_addr,
            rq_cidb_addr: doorbells.dma_addr + 4,
            dst_mac,
            dst_ip: "192.168.0.6".parse().unwrap(),
            partition_key: 0x1234,
        },
    )
    .unwrap();
}

fn write_params(wqe_idx: u32, laddr: u64) -> WqeParams {
    WqeParams {
        wrid: wqe_idx as u16,
        wqe_idx,
        laddr,
        length: 256,
        opcode: WqeOpcode::Write,
        remote_offset: 0x1000,
        r_key: 0x0008,
        small_payload: [0; 4],
        immdt_data: 0,
    }
}

#[test]
fn open_enables_the_engine_with_sport_and_qp_count() {
    let (emu, _dev) = open_device(8);
    // udp sport in the high half, qp count and enable bits in the low
    assert_eq!(emu.csr(XRNICCONF), 0x12B7_0821);
    // software override stays disarmed outside of teardown
    assert_eq!(emu.csr(XRNICADCONF) & 1, 0);
}

#[test]
fn qp_allocation_programs_rings_and_enables_last() {
    let (emu, mut dev) = open_device(4);
    emu.clear_writes();
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    let conf = emu.csr(QPCONF);
    assert_eq!(conf & 1, 1, "enable bit set");
    assert_eq!((conf >> 8) & 0xFF, 4, "4 KiB path MTU selector");
    assert_eq!(conf >> 16, 512, "RQE size field");

    // the config register write comes after every ring base write
    let writes = emu.writes();
    let conf_pos = writes.iter().position(|w| w.offset == QPCONF).unwrap();
    let rq_base_pos = writes.iter().position(|w| w.offset == qp1(0x08)).unwrap();
    let sq_base_pos = writes.iter().position(|w| w.offset == qp1(0x10)).unwrap();
    let cq_base_pos = writes.iter().position(|w| w.offset == qp1(0x18)).unwrap();
    assert!(conf_pos > rq_base_pos.max(sq_base_pos).max(cq_base_pos));
}

#[test]
fn send_rings_the_doorbell_and_consumes_the_completion() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
    emu.set_auto_complete(true);

    let laddr = dev.qp(1).unwrap().pd().mr_buffer().unwrap().dma_addr;
    dev.create_wqe(1, write_params(0, laddr)).unwrap();
    dev.post_send(1).unwrap();

    assert_eq!(emu.csr(SQPI), 1);
    let qp = dev.qp(1).unwrap();
    assert_eq!(qp.sq_pidb, 1);
    assert_eq!(qp.sq_cidb, 1);
    assert_eq!(qp.cq_cidb, 1);
}

#[test]
fn batch_send_writes_one_doorbell_for_the_whole_batch() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
    emu.set_auto_complete(true);

    let laddr = dev.qp(1).unwrap().pd().mr_buffer().unwrap().dma_addr;
    for idx in 0..4 {
        dev.create_wqe(1, write_params(idx, laddr + u64::from(idx) * 256))
            .unwrap();
    }
    emu.clear_writes();
    dev.post_batch_send(1, 4).unwrap();

    let doorbells: Vec<_> = emu.writes().into_iter().filter(|w| w.offset == SQPI).collect();
    assert_eq!(doorbells.len(), 1);
    assert_eq!(doorbells[0].value, 4);
    assert_eq!(dev.qp(1).unwrap().sq_cidb, 4);
}

#[test]
fn overflow_is_rejected_before_any_doorbell_write() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
    emu.clear_writes();

    assert!(matches!(
        dev.post_batch_send(1, 9),
        Err(Error::SqOverflow(1))
    ));
    assert!(emu.writes().iter().all(|w| w.offset != SQPI));
    assert_eq!(dev.qp(1).unwrap().sq_pidb, 0, "shadow index untouched");

    // an out-of-range slot is rejected the same way
    assert!(matches!(
        dev.create_wqe(1, write_params(8, 0)),
        Err(Error::SqOverflow(1))
    ));
}

#[test]
fn completion_timeout_surfaces_as_a_typed_error() {
    let (_emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
    dev.set_poll_timeout(50);

    let laddr = dev.qp(1).unwrap().pd().mr_buffer().unwrap().dma_addr;
    dev.create_wqe(1, write_params(0, laddr)).unwrap();
    assert!(matches!(
        dev.post_send(1),
        Err(Error::CompletionTimeout(1))
    ));
}

#[test]
fn receive_slot_is_derived_from_the_producer_index() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    emu.set_csr(STATRQPIDB, 1);
    let slot = dev.post_receive(1).unwrap();
    // producer index 1 names the first 512-byte slot
    assert_eq!(slot.dma_addr, dev.qp(1).unwrap().rq().dma_addr);
    assert_eq!(slot.size, 512);
    assert_eq!(emu.csr(RQCI), 1, "consumer index acknowledged");

    emu.set_csr(STATRQPIDB, 3);
    let slot = dev.post_receive(1).unwrap();
    assert_eq!(
        slot.dma_addr,
        dev.qp(1).unwrap().rq().dma_addr + 2 * 512
    );
}

#[test]
fn release_rq_consumed_is_idempotent() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    emu.set_csr(STATRQPIDB, 2);
    dev.post_receive(1).unwrap();

    // nothing new pending: releasing twice acknowledges the same index
    assert!(!dev.release_rq_consumed(1).unwrap());
    assert!(!dev.release_rq_consumed(1).unwrap());
    assert_eq!(emu.csr(RQCI), 2);

    // the engine produced more; release reports pending work but only
    // acknowledges what was consumed
    emu.set_csr(STATRQPIDB, 5);
    assert!(dev.release_rq_consumed(1).unwrap());
    assert_eq!(emu.csr(RQCI), 2);
}

#[test]
fn receive_timeout_when_no_message_lands() {
    let (_emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
    dev.set_poll_timeout(50);
    assert!(matches!(dev.poll_rq_pidb(1), Err(Error::ReceiveTimeout(1))));
}

#[test]
fn device_resident_wqe_reaches_card_memory() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::DeviceMem);

    dev.create_wqe(1, write_params(2, 0x4000)).unwrap();
    let sq_addr = dev.qp(1).unwrap().sq().dma_addr;

    let mut wqe_bytes = [0u8; 64];
    emu.dma_read(sq_addr + 2 * 64, &mut wqe_bytes).unwrap();
    // wrid, laddr low word, opcode
    assert_eq!(&wqe_bytes[0..4], &[2, 0, 0, 0]);
    assert_eq!(&wqe_bytes[4..8], &[0, 0x40, 0, 0]);
    assert_eq!(wqe_bytes[16], WqeOpcode::Write as u8);
}

#[test]
fn psn_seeding_masks_and_tags_the_registers() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    dev.config_sq_psn(1, 0xABCDEF).unwrap();
    assert_eq!(emu.csr(SQPSN), 0xABCDEF);

    dev.config_last_rq_psn(1, 0x12345678).unwrap();
    // only 24 PSN bits survive, the high byte is the request opcode
    assert_eq!(emu.csr(LSTRQREQ), 0x0A34_5678);
    assert_eq!(dev.qp(1).unwrap().last_rq_psn, 0x12345678);
}

#[test]
fn destroy_resets_indices_inside_the_override_window() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    // healthy QP: no fatal code, both state machines quiesced, drained
    emu.set_csr(STATQP, 0x600);
    emu.clear_writes();
    dev.destroy_qp(1).unwrap();

    let writes = emu.writes();
    let arm = writes
        .iter()
        .position(|w| w.offset == XRNICADCONF && w.value & 1 == 1)
        .expect("override armed");
    let disarm = writes
        .iter()
        .rposition(|w| w.offset == XRNICADCONF && w.value & 1 == 0)
        .expect("override disarmed");
    for reg in [SQPI, CQHEAD, RQCI, SQPSN, LSTRQREQ, STATRQPIDB] {
        let reset = writes
            .iter()
            .position(|w| w.offset == reg && w.value == 0)
            .unwrap_or_else(|| panic!("index register {reg:#x} reset"));
        assert!(arm < reset && reset < disarm, "reset outside override window");
    }

    // the qp id and pd number are free again
    assert!(dev.qp(1).is_none());
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
}

#[test]
fn unhealthy_qp_is_recovered_before_destroy() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    // fatal code set, state machines quiesced, nothing outstanding
    emu.set_csr(STATQP, 0x605);
    dev.destroy_qp(1).unwrap();
    assert!(dev.qp(1).is_none());
}

#[test]
fn recovery_times_out_if_the_engine_never_quiesces() {
    let (_emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    // STATQP stays zero: neither state machine reports quiesced
    assert!(matches!(
        dev.qp_fatal_recovery(1),
        Err(Error::RecoveryTimeout(1))
    ));
}

#[test]
fn recovery_fails_when_completions_never_drain() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    // quiesced, but the completion head never catches the producer
    emu.set_csr(STATQP, 0x600);
    emu.set_csr(SQPI, 5);
    assert!(matches!(
        dev.qp_fatal_recovery(1),
        Err(Error::RecoveryTimeout(1))
    ));
    // the failure is surfaced before the QP is parked
    assert_eq!(emu.csr(QPCONF) & 1, 1, "still enabled");
}

#[test]
fn fatal_recovery_parks_the_qp_disabled() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);

    emu.set_csr(STATQP, 0x205);
    dev.qp_fatal_recovery(1).unwrap();

    let conf = emu.csr(QPCONF);
    assert_eq!(conf & 1, 0, "enable cleared");
    assert_ne!(conf & (1 << 6), 0, "recovery bit set");
}

#[test]
fn destroy_device_tears_down_every_qp() {
    let (emu, mut dev) = open_device(4);
    setup_qp(&mut dev, 1, BufferLocation::HostMem);
    setup_qp(&mut dev, 2, BufferLocation::HostMem);
    emu.set_csr(STATQP, 0x600);
    emu.set_csr(STATQP + 0x100, 0x600);

    dev.destroy().unwrap();
    assert!(dev.qp(1).is_none());
    assert!(dev.qp(2).is_none());
    assert_eq!(emu.csr(XRNICCONF), 0, "engine disabled");
}
