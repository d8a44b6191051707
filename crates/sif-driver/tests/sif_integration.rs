//! End-to-end tests against the simulated IOP
//!
//! Every test brings up a full `Sif` on a `SoftwareIop`: handshake,
//! dispatcher thread, RPC initialisation.

use sif_driver::backends::SoftwareIop;
use sif_driver::codec::CommandHeader;
use sif_driver::dma::ChannelManager;
use sif_driver::protocol::{cmd, frame::PAGE_SIZE};
use sif_driver::rpc::RequestEnd;
use sif_driver::{
    BootState, ClientState, DmaTiming, ManualClock, ModuleLoader, RpcClient, Sif, SifBus,
    SifConfig, SifError, SystemClock,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

fn boot(iop: SoftwareIop) -> (Arc<SoftwareIop>, Sif) {
    let iop = Arc::new(iop);
    let sif = Sif::init(iop.clone(), SifConfig::default()).expect("SIF init");
    (iop, sif)
}

/// Wait up to two seconds for the dispatcher thread to catch up
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn last_command_transfer(iop: &SoftwareIop, cmd_id: u32) -> sif_driver::backends::TransferRecord {
    iop.transfers()
        .into_iter()
        .filter(|t| t.tag.int_0)
        .filter(|t| CommandHeader::decode(&t.payload).is_ok_and(|h| h.cmd_id == cmd_id))
        .last()
        .expect("command transfer")
}

#[test]
fn init_reaches_ready() {
    let (iop, sif) = boot(SoftwareIop::standard());

    assert_eq!(sif.state(), BootState::Ready);
    assert_eq!(sif.iop_buffer(), SoftwareIop::FINAL_SUBADDR);
    assert_eq!(sif.register(0).unwrap(), 1);
    assert!(iop.has_irq_handler());
    assert_eq!(iop.mapped_pages(), 2);

    let init: Vec<_> = iop
        .commands()
        .into_iter()
        .filter(|c| c.cmd_id == cmd::INIT_CMD)
        .collect();
    assert_eq!(init.len(), 2);
    assert_eq!(init[0].opt, 0);
    assert_eq!(iop.host_cmd_buffer(), iop.mainaddr());
    assert_eq!(init[1].opt, 1);
}

#[test]
fn bind_packet_framing() {
    let (iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    sif.bind(&mut client, 0x01).unwrap();

    assert_eq!(client.state(), ClientState::Bound);
    assert_ne!(client.binding().server, 0);

    let bind = last_command_transfer(&iop, cmd::RPC_BIND);
    assert_eq!(bind.tag.qwc().unwrap(), 2);
    assert_eq!(bind.qwc, 3);
    assert_eq!(bind.tag.addr, SoftwareIop::FINAL_SUBADDR);
    assert!(bind.tag.ert);

    let header = CommandHeader::decode(&bind.payload).unwrap();
    assert_eq!(header.packet_size, 28);
    assert_eq!(header.data_size, 0);
}

#[test]
fn echo_call_round_trip() {
    let (iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    sif.bind(&mut client, SoftwareIop::ECHO_SERVICE).unwrap();

    let request: Vec<u8> = (0..200u8).collect();
    let mut response = vec![0u8; 200];
    sif.call(&mut client, 3, &request, &mut response).unwrap();
    assert_eq!(response, request);
    assert_eq!(client.state(), ClientState::Bound);

    // Bulk went first, without an interrupt, to the server buffer
    let transfers = iop.transfers();
    let bulk = &transfers[transfers.len() - 2];
    assert!(!bulk.tag.int_0);
    assert_eq!(bulk.tag.addr, client.binding().server_buffer);
    assert_eq!(&bulk.payload[..200], &request[..]);
}

#[test]
fn concurrent_calls_on_two_clients() {
    let (_iop, sif) = boot(SoftwareIop::standard());
    let sif = Arc::new(sif);

    let workers: Vec<_> = (0..2u8)
        .map(|n| {
            let sif = Arc::clone(&sif);
            std::thread::spawn(move || {
                let mut client = RpcClient::new();
                sif.bind(&mut client, SoftwareIop::ECHO_SERVICE).unwrap();
                for round in 0..20u8 {
                    let request = [n, round, 0xA5, n ^ round];
                    let mut response = [0u8; 4];
                    sif.call(&mut client, 0, &request, &mut response).unwrap();
                    assert_eq!(response, request);
                }
                sif.unbind(&mut client);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(sif.state(), BootState::Ready);
}

#[test]
fn call_before_bind_is_invalid_state() {
    let (_iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    let mut response = [0u8; 4];
    assert!(matches!(
        sif.call(&mut client, 0, b"x", &mut response),
        Err(SifError::InvalidState { .. })
    ));
}

#[test]
fn unknown_service_is_io() {
    let (_iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    let err = sif.bind(&mut client, 0x1234).unwrap_err();
    assert!(matches!(err, SifError::Io { .. }), "{err}");
    assert_eq!(client.state(), ClientState::Failed);
    assert_eq!(client.token(), None);

    // A failed client can bind again
    sif.bind(&mut client, SoftwareIop::ECHO_SERVICE).unwrap();
    assert_eq!(client.state(), ClientState::Bound);
}

#[test]
fn double_bind_is_invalid_state() {
    let (_iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    sif.bind(&mut client, SoftwareIop::ECHO_SERVICE).unwrap();
    assert!(matches!(
        sif.bind(&mut client, SoftwareIop::ECHO_SERVICE),
        Err(SifError::InvalidState { .. })
    ));
}

#[test]
fn oversized_inline_data_is_rejected() {
    let (iop, sif) = boot(SoftwareIop::standard());
    let before = iop.transfers().len();
    assert!(matches!(
        sif.send_command(0x10, 0, &[0u8; 113], None),
        Err(SifError::InvalidArgument { .. })
    ));
    assert_eq!(iop.transfers().len(), before);

    sif.send_command(0x10, 0, &[0u8; 112], None).unwrap();
    assert_eq!(iop.transfers().last().unwrap().qwc, 9);
}

#[test]
fn register_write_from_iop() {
    let (iop, sif) = boot(SoftwareIop::standard());
    iop.send_sreg(5, -17).unwrap();
    assert!(eventually(|| sif.register(5).is_ok_and(|v| v == -17)));
    assert_eq!(sif.state(), BootState::Ready);
}

#[test]
fn out_of_range_register_write_halts_dispatch() {
    let (iop, sif) = boot(SoftwareIop::standard());
    iop.send_sreg(64, 1).unwrap();

    assert!(eventually(|| sif.fault().is_some()));
    assert_eq!(sif.state(), BootState::Failed);
    assert!(sif.fault().unwrap().contains("64"));
}

#[test]
fn halted_dispatch_fails_bind_promptly() {
    let (iop, sif) = boot(SoftwareIop::standard());
    iop.send_sreg(64, 1).unwrap();
    assert!(eventually(|| sif.fault().is_some()));

    let sif = Arc::new(sif);
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(&sif);
    std::thread::spawn(move || {
        let mut client = RpcClient::new();
        let _ = tx.send(worker.bind(&mut client, SoftwareIop::ECHO_SERVICE));
    });

    let outcome = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("bind blocked after dispatch halted");
    let err = outcome.unwrap_err();
    assert!(matches!(err, SifError::ProtocolViolation { .. }), "{err}");
    assert!(err.to_string().contains("64"), "{err}");
}

#[test]
fn halted_dispatch_wakes_a_waiting_call() {
    let (iop, sif) = boot(SoftwareIop::standard().with_silent_service(0x55));
    let sif = Arc::new(sif);
    let mut client = RpcClient::new();
    sif.bind(&mut client, 0x55).unwrap();

    // No timeout: only the fault can end this call.
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(&sif);
    std::thread::spawn(move || {
        let mut response = [0u8; 4];
        let outcome = worker.call(&mut client, 0, b"ping", &mut response);
        let _ = tx.send((outcome, client.state()));
    });
    assert!(eventually(|| iop.held_completions() == 1));

    iop.send_sreg(64, 1).unwrap();
    let (outcome, state) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("call still waiting after dispatch halted");
    assert!(matches!(outcome, Err(SifError::ProtocolViolation { .. })));
    assert_eq!(state, ClientState::Stale);
    assert_eq!(sif.state(), BootState::Failed);
}

#[test]
fn unregistered_user_command_is_dropped() {
    let (iop, sif) = boot(SoftwareIop::standard());
    iop.inject_frame(0x15, b"hello").unwrap();
    iop.send_sreg(7, 70).unwrap();

    // Later traffic is still dispatched
    assert!(eventually(|| sif.register(7).is_ok_and(|v| v == 70)));
    assert_eq!(sif.state(), BootState::Ready);
}

#[test]
fn user_handler_receives_inline_data() {
    let (iop, sif) = boot(SoftwareIop::standard());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sif.register_handler(0x12, move |frame| {
        sink.lock().push(frame.data.to_vec());
        Ok(())
    })
    .unwrap();
    assert!(sif.handler_registered(0x12));

    iop.inject_frame(0x12, b"abc").unwrap();
    assert!(eventually(|| seen.lock().len() == 1));
    assert_eq!(seen.lock()[0], b"abc");
}

#[test]
fn relayed_irq_reaches_sink() {
    let (iop, sif) = boot(SoftwareIop::standard());
    let last = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&last);
    sif.set_irq_sink(Some(Arc::new(move |irq| sink.store(irq, Ordering::SeqCst))));

    iop.relay_irq(42).unwrap();
    assert!(eventually(|| last.load(Ordering::SeqCst) == 42));
}

#[test]
fn iop_initiated_bind_gets_completion() {
    let (iop, sif) = boot(SoftwareIop::standard());
    iop.request_bind(0xABCD, 0x77).unwrap();

    let replied = eventually(|| {
        iop.commands().iter().any(|c| {
            c.cmd_id == cmd::RPC_END
                && RequestEnd::decode(&c.data)
                    .is_ok_and(|end| end.client_ref == 0xABCD && end.client_id == cmd::RPC_BIND)
        })
    });
    assert!(replied);
    assert_eq!(sif.state(), BootState::Ready);
}

#[test]
fn module_loader_maps_status() {
    let (_iop, sif) = boot(SoftwareIop::standard());
    let mut loader = ModuleLoader::new(&sif).unwrap();

    let first = loader.load_rom("rom0:SIO2MAN", &[]).unwrap();
    let second = loader.load_rom("rom0:PADMAN", b"-v").unwrap();
    assert_eq!(second.id, first.id + 1);

    let err = loader.load_rom("host:missing.irx", &[]).unwrap_err();
    assert!(matches!(err, SifError::Io { .. }), "{err}");

    assert!(matches!(
        loader.load_rom(&"p".repeat(300), &[]),
        Err(SifError::InvalidArgument { .. })
    ));
}

#[test]
fn module_loader_needs_the_service() {
    let (_iop, sif) = boot(SoftwareIop::new());
    assert!(matches!(
        ModuleLoader::new(&sif),
        Err(SifError::Io { .. })
    ));
}

#[test]
fn oversized_reset_args_fail_init() {
    let iop = Arc::new(SoftwareIop::standard());
    let config = SifConfig::default().with_reset_args("x".repeat(80));
    assert!(matches!(
        Sif::init(iop.clone(), config),
        Err(SifError::InvalidArgument { .. })
    ));
    assert_eq!(iop.mapped_pages(), 0);
    assert!(!iop.has_irq_handler());
}

#[test]
fn custom_reset_args_reach_the_iop() {
    let iop = Arc::new(SoftwareIop::standard());
    let config = SifConfig::default().with_reset_args("rom0:UDNL rom0:EELOADCNF");
    let _sif = Sif::init(iop.clone(), config).unwrap();
    assert_eq!(iop.reset_args().as_deref(), Some("rom0:UDNL rom0:EELOADCNF"));
}

#[test]
fn hung_boot_times_out_and_cleans_up() {
    let iop = Arc::new(SoftwareIop::standard().hang_boot());
    let clock = Arc::new(ManualClock::new());
    let err = Sif::init_with_clock(iop.clone(), SifConfig::default(), clock).unwrap_err();

    assert!(matches!(err, SifError::Io { .. }), "{err}");
    assert_eq!(iop.mapped_pages(), 0);
    assert!(!iop.has_irq_handler());
}

#[test]
fn withheld_rpc_init_times_out() {
    let iop = Arc::new(SoftwareIop::standard().withhold_rpc_init());
    let clock = Arc::new(ManualClock::new());
    let err = Sif::init_with_clock(iop.clone(), SifConfig::default(), clock).unwrap_err();

    assert!(matches!(err, SifError::Io { .. }), "{err}");
    assert!(err.to_string().contains("RPC initialisation"), "{err}");
    assert_eq!(iop.mapped_pages(), 0);
    assert!(!iop.has_irq_handler());
}

#[test]
fn stalled_channel_reports_busy() {
    let iop = Arc::new(SoftwareIop::new().stall_sif1());
    let bus: Arc<dyn SifBus> = iop.clone();
    let channels = ChannelManager::new(bus, Arc::new(ManualClock::new()), DmaTiming::default())
        .unwrap();

    channels.transmit(None, 0x2000, &[1u8; 16], false).unwrap();
    let err = channels.transmit(None, 0x2000, &[2u8; 16], false).unwrap_err();
    assert!(matches!(err, SifError::Busy { duration_ms: 5000, .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(iop.transfers().len(), 1);
}

#[test]
fn page_exhaustion_on_bind() {
    let (iop, sif) = boot(SoftwareIop::standard().dma_page_limit(2));
    let mut client = RpcClient::new();
    assert!(matches!(
        sif.bind(&mut client, SoftwareIop::ECHO_SERVICE),
        Err(SifError::ResourceExhausted { .. })
    ));
    assert_eq!(client.state(), ClientState::Unbound);
    assert_eq!(iop.mapped_pages(), 2);
}

#[test]
fn response_larger_than_receive_page() {
    let (_iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    sif.bind(&mut client, SoftwareIop::ECHO_SERVICE).unwrap();
    let mut response = vec![0u8; PAGE_SIZE + 1];
    assert!(matches!(
        sif.call(&mut client, 0, b"x", &mut response),
        Err(SifError::InvalidArgument { .. })
    ));
    assert_eq!(client.state(), ClientState::Bound);
}

#[test]
fn silent_service_leaves_client_stale() {
    let (iop, sif) = boot(SoftwareIop::standard().with_silent_service(0x55));
    let mut client = RpcClient::new().with_timeout(Duration::from_millis(50));
    sif.bind(&mut client, 0x55).unwrap();

    let mut response = [0u8; 4];
    let err = sif.call(&mut client, 0, b"ping", &mut response).unwrap_err();
    assert!(matches!(err, SifError::Timeout { .. }), "{err}");
    assert_eq!(client.state(), ClientState::Stale);
    assert_eq!(iop.held_completions(), 1);

    assert!(matches!(
        sif.call(&mut client, 0, b"ping", &mut response),
        Err(SifError::Busy { .. })
    ));

    // Once the late completion lands, the client issues a fresh call
    iop.release_held();
    let reissued = eventually(|| {
        !matches!(
            sif.call(&mut client, 0, b"ping", &mut response),
            Err(SifError::Busy { .. })
        )
    });
    assert!(reissued);
    assert_eq!(iop.held_completions(), 1);
}

#[test]
fn stale_receive_page_outlives_unbind() {
    let (iop, sif) = boot(SoftwareIop::standard().with_silent_service(0x55));
    let mut client = RpcClient::new().with_timeout(Duration::from_millis(50));
    sif.bind(&mut client, 0x55).unwrap();
    assert_eq!(iop.mapped_pages(), 3);

    let mut response = [0u8; 4];
    assert!(matches!(
        sif.call(&mut client, 0, b"ping", &mut response),
        Err(SifError::Timeout { .. })
    ));
    sif.unbind(&mut client);
    assert_eq!(client.state(), ClientState::Unbound);
    // The IOP still owes that page its response.
    assert_eq!(iop.mapped_pages(), 3);

    let mut other = RpcClient::new();
    sif.bind(&mut other, SoftwareIop::ECHO_SERVICE).unwrap();
    assert_eq!(iop.mapped_pages(), 4);
    let mut echo = [0u8; 4];
    sif.call(&mut other, 0, b"pong", &mut echo).unwrap();
    assert_eq!(&echo, b"pong");

    // The late completion frees the parked page.
    iop.release_held();
    assert!(eventually(|| iop.mapped_pages() == 3));
    sif.unbind(&mut other);
    assert_eq!(iop.mapped_pages(), 2);
}

#[test]
fn shutdown_releases_parked_pages() {
    let (iop, sif) = boot(SoftwareIop::standard().with_silent_service(0x55));
    let mut client = RpcClient::new().with_timeout(Duration::from_millis(50));
    sif.bind(&mut client, 0x55).unwrap();

    let mut response = [0u8; 4];
    assert!(sif.call(&mut client, 0, b"ping", &mut response).is_err());
    drop(client);
    assert_eq!(iop.mapped_pages(), 3);

    sif.shutdown();
    assert_eq!(iop.mapped_pages(), 2);
    drop(sif);
    assert_eq!(iop.mapped_pages(), 0);
}

#[test]
fn shutdown_releases_everything() {
    let (iop, sif) = boot(SoftwareIop::standard());
    let mut client = RpcClient::new();
    sif.bind(&mut client, SoftwareIop::ECHO_SERVICE).unwrap();
    assert_eq!(iop.mapped_pages(), 3);

    sif.unbind(&mut client);
    assert_eq!(iop.mapped_pages(), 2);

    sif.shutdown();
    assert_eq!(sif.state(), BootState::Idle);
    assert!(!iop.has_irq_handler());
    assert!(!sif.handler_registered(cmd::RPC_END));
    assert!(matches!(
        sif.bind(&mut client, SoftwareIop::ECHO_SERVICE),
        Err(SifError::InvalidState { .. })
    ));

    drop(sif);
    assert_eq!(iop.mapped_pages(), 0);
}

#[test]
fn independent_instances() {
    let (iop_a, a) = boot(SoftwareIop::standard());
    let (iop_b, b) = boot(SoftwareIop::standard());

    iop_a.send_sreg(3, 11).unwrap();
    iop_b.send_sreg(3, 22).unwrap();
    assert!(eventually(|| a.register(3).is_ok_and(|v| v == 11)));
    assert!(eventually(|| b.register(3).is_ok_and(|v| v == 22)));
}

#[test]
fn system_clock_init_is_prompt() {
    let iop = Arc::new(SoftwareIop::standard());
    let start = Instant::now();
    let _sif =
        Sif::init_with_clock(iop, SifConfig::default(), Arc::new(SystemClock::new())).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}
