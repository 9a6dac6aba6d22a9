//! Transmit and receive paths through the software device model.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use switchline::regs;
use switchline::sim::SimDevice;
use switchline::{
    Config, ConfigBuilder, QueueKind, RxCallback, RxInfo, SwitchTransport, TransmitError,
    TxFrame, TxInfo,
};

const SDQ_COUNT: usize = 64;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> Config {
    ConfigBuilder::new()
        .descriptor_queues(1, 1)
        .completion_queues(2)
        .queue_sizes(SDQ_COUNT, 64, 128, 64)
        .rx_buffer_size(2048)
        .cmd_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

type Received = Arc<Mutex<Vec<(Bytes, RxInfo)>>>;

fn rx_collector() -> (Received, Box<RxCallback>) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let cb = Box::new(move |frame: Bytes, info: &RxInfo| {
        sink.lock().unwrap().push((frame, *info));
    });
    (received, cb)
}

fn bring_up(sim: &Arc<SimDevice>) -> (SwitchTransport, Received) {
    let (received, cb) = rx_collector();
    let transport = SwitchTransport::new(sim.clone(), small_config(), cb).unwrap();
    (transport, received)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn tx_frame(data: &'static [u8]) -> (TxFrame, TxInfo) {
    (
        TxFrame::contiguous(Bytes::from_static(data)),
        TxInfo { local_port: 1 },
    )
}

#[test]
fn transmit_reaches_device_and_completes() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, _received) = bring_up(&sim);

    let (frame, info) = tx_frame(b"hello");
    transport.transmit(frame, &info).unwrap();

    assert!(wait_until(|| sim.transmitted() == vec![b"hello".to_vec()]));
    // The completion frees the descriptor: producer and consumer meet.
    assert!(wait_until(|| {
        transport
            .queue_stats()
            .iter()
            .filter(|s| s.kind == QueueKind::Send)
            .all(|s| s.producer == s.consumer)
    }));
    assert_eq!(sim.mappings_outstanding(), 64); // only posted rx buffers
    transport.fini();
}

#[test]
fn scattered_frame_is_gathered_in_order() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, _received) = bring_up(&sim);

    let frame = TxFrame {
        head: Bytes::from_static(b"he"),
        frags: vec![Bytes::from_static(b"ll"), Bytes::from_static(b"o!")],
    };
    let info = TxInfo { local_port: 1 };
    transport.transmit(frame, &info).unwrap();
    assert!(wait_until(|| sim.transmitted() == vec![b"hello!".to_vec()]));
    transport.fini();
}

#[test]
fn oversized_scatter_list_is_linearized() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, _received) = bring_up(&sim);

    let frame = TxFrame {
        head: Bytes::from_static(b"a"),
        frags: vec![
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
            Bytes::from_static(b"d"),
            Bytes::from_static(b"e"),
        ],
    };
    let info = TxInfo { local_port: 1 };
    transport.transmit(frame, &info).unwrap();
    assert!(wait_until(|| sim.transmitted() == vec![b"abcde".to_vec()]));
    transport.fini();
}

#[test]
fn received_frames_reach_the_callback() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, received) = bring_up(&sim);

    let payload = b"incoming frame";
    assert!(sim.inject_rx(0, payload, 7, 0x19));
    assert!(wait_until(|| received.lock().unwrap().len() == 1));

    let (frame, info) = received.lock().unwrap()[0].clone();
    assert_eq!(&frame[..], payload);
    assert_eq!(info.port, 7);
    assert_eq!(info.trap_id, 0x19);
    assert!(!info.is_lag);
    transport.fini();
}

#[test]
fn receive_ring_replenishes_under_sustained_traffic() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, received) = bring_up(&sim);

    // Several laps of the 64-element receive ring.
    let total = 200usize;
    for i in 0..total {
        let payload = [i as u8; 32];
        while !sim.inject_rx(0, &payload, 1, 1) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    assert!(wait_until(|| received.lock().unwrap().len() == total));
    for (i, (frame, _)) in received.lock().unwrap().iter().enumerate() {
        assert_eq!(&frame[..], &[i as u8; 32]);
    }
    assert_eq!(sim.ring_overflows(), 0);
    transport.fini();
}

#[test]
fn full_send_ring_reports_busy_and_recovers() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, _received) = bring_up(&sim);

    sim.hold_tx_completions();
    let mut accepted = 0;
    loop {
        let (frame, info) = tx_frame(b"pressure");
        match transport.transmit(frame, &info) {
            Ok(()) => accepted += 1,
            Err(TransmitError::Busy) => break,
            Err(e) => panic!("unexpected transmit error: {e}"),
        }
        assert!(accepted <= SDQ_COUNT, "ring accepted more than its size");
    }
    assert_eq!(accepted, SDQ_COUNT);
    let (_, info) = tx_frame(b"");
    assert!(transport.transmit_busy(&info));

    sim.release_tx_completions();
    assert!(wait_until(|| sim.transmitted().len() == SDQ_COUNT));
    // Completions free descriptors and transmit works again.
    assert!(wait_until(|| {
        let (frame, info) = tx_frame(b"after");
        transport.transmit(frame, &info).is_ok()
    }));
    transport.fini();
}

#[test]
fn send_queue_follows_local_port() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let config = ConfigBuilder::new()
        .descriptor_queues(2, 1)
        .completion_queues(3)
        .queue_sizes(64, 64, 128, 64)
        .cmd_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let transport = SwitchTransport::new(sim.clone(), config, Box::new(|_, _| {})).unwrap();

    // port 4 -> queue 0, port 5 -> queue 1.
    transport
        .transmit(
            TxFrame::contiguous(Bytes::from_static(b"even")),
            &TxInfo { local_port: 4 },
        )
        .unwrap();
    transport
        .transmit(
            TxFrame::contiguous(Bytes::from_static(b"odd")),
            &TxInfo { local_port: 5 },
        )
        .unwrap();
    assert!(wait_until(|| sim.transmitted().len() == 2));

    for stat in transport
        .queue_stats()
        .iter()
        .filter(|s| s.kind == QueueKind::Send)
    {
        assert_eq!(
            stat.producer, 1,
            "send queue {} carried the wrong share",
            stat.num
        );
    }
    transport.fini();
}

#[test]
fn unrecognized_events_are_skipped() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, received) = bring_up(&sim);

    // Garbage on both event queues must not derail dispatch.
    sim.inject_event(0, 0x55);
    sim.inject_event(1, 0x55);
    assert!(sim.inject_rx(0, b"still alive", 1, 1));
    assert!(wait_until(|| received.lock().unwrap().len() == 1));
    assert_eq!(&received.lock().unwrap()[0].0[..], b"still alive");
    transport.fini();
}

#[test]
fn quiet_queues_are_not_re_rung() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, received) = bring_up(&sim);

    // Receive traffic wakes every event worker, but event queue 0 only
    // carries command events and has nothing to consume here.
    let before = sim.doorbell_writes(regs::DOORBELL_EQ_OFFSET, 0);
    assert!(sim.inject_rx(0, b"ping", 1, 1));
    assert!(wait_until(|| received.lock().unwrap().len() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.doorbell_writes(regs::DOORBELL_EQ_OFFSET, 0), before);
    transport.fini();
}

#[test]
fn failed_replenishment_drops_the_frame_but_keeps_the_ring() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, received) = bring_up(&sim);

    sim.fail_dma_maps(1);
    assert!(sim.inject_rx(0, b"dropped", 1, 1));
    assert!(sim.inject_rx(0, b"delivered", 1, 1));
    assert!(wait_until(|| !received.lock().unwrap().is_empty()));

    let frames = received.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].0[..], b"delivered");
    drop(frames);
    transport.fini();
}

#[test]
fn teardown_after_traffic_releases_all_memory() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let (transport, received) = bring_up(&sim);

    for _ in 0..10 {
        let (frame, info) = tx_frame(b"frame");
        transport.transmit(frame, &info).unwrap();
    }
    for _ in 0..10 {
        assert!(sim.inject_rx(0, b"frame", 1, 1));
    }
    assert!(wait_until(|| {
        sim.transmitted().len() == 10 && received.lock().unwrap().len() == 10
    }));

    transport.fini();
    assert_eq!(sim.live_queues(), (0, 0, 0, 0));
    assert_eq!(sim.coherent_outstanding(), 0);
    assert_eq!(sim.mappings_outstanding(), 0);
}
