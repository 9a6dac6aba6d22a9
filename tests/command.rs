//! Command channel behavior through a live transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use switchline::regs::{self, opcode};
use switchline::sim::SimDevice;
use switchline::{Config, ConfigBuilder, Error, SwitchTransport};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_with_timeout(timeout: Duration) -> Config {
    ConfigBuilder::new()
        .descriptor_queues(1, 1)
        .completion_queues(2)
        .queue_sizes(64, 64, 128, 64)
        .cmd_timeout(timeout)
        .build()
        .unwrap()
}

fn bring_up(sim: &Arc<SimDevice>, config: Config) -> SwitchTransport {
    SwitchTransport::new(sim.clone(), config, Box::new(|_, _| {})).unwrap()
}

#[test]
fn mailbox_output_round_trip() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = bring_up(&sim, config_with_timeout(Duration::from_secs(2)));

    let out = transport
        .execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)
        .unwrap();
    let psid_end = regs::boardinfo::PSID_OFFSET + regs::boardinfo::PSID_LEN;
    assert_eq!(
        &out[regs::boardinfo::PSID_OFFSET..psid_end],
        b"SIM0000000000000"
    );
    transport.fini();
}

#[test]
fn scripted_status_error_surfaces() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = bring_up(&sim, config_with_timeout(Duration::from_secs(2)));

    sim.program_response(opcode::QUERY_BOARDINFO, 0x03, 0);
    match transport.execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false) {
        Err(Error::CmdStatus { status }) => assert_eq!(status, 0x03),
        other => panic!("unexpected result: {other:?}"),
    }
    // The channel keeps working after a failed command.
    transport
        .execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)
        .unwrap();
    transport.fini();
}

#[test]
fn direct_output_comes_from_the_event() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = bring_up(&sim, config_with_timeout(Duration::from_secs(2)));

    sim.program_response(opcode::QUERY_FW, 0, 0x1122_3344_5566_7788);
    let out = transport
        .execute(opcode::QUERY_FW, 0, 0, None, 8, true)
        .unwrap();
    assert_eq!(out, 0x1122_3344_5566_7788u64.to_be_bytes());
    transport.fini();
}

#[test]
fn timeout_leaves_the_channel_usable() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = bring_up(&sim, config_with_timeout(Duration::from_millis(200)));

    sim.stall_next_command();
    let start = Instant::now();
    let result = transport.execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false);
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(Error::CmdTimeout)));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));

    // The stale completion must not be mistaken for a later command's.
    assert!(sim.complete_stalled(0, 0));
    transport
        .execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)
        .unwrap();
    transport.fini();
}

#[test]
fn failed_command_unblocks_the_queued_one() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = Arc::new(bring_up(&sim, config_with_timeout(Duration::from_secs(5))));

    sim.stall_next_command();
    let first = {
        let transport = transport.clone();
        std::thread::spawn(move || {
            transport.execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)
        })
    };
    // Queue a second command once the first holds the channel.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !sim.command_stalled() {
        assert!(
            Instant::now() < deadline,
            "first command never reached the device"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
    let second = {
        let transport = transport.clone();
        std::thread::spawn(move || {
            transport.execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)
        })
    };

    // Finish the stalled command with an error status.
    assert!(sim.complete_stalled(2, 0));

    match first.join().unwrap() {
        Err(Error::CmdStatus { status }) => assert_eq!(status, 2),
        other => panic!("unexpected first result: {other:?}"),
    }
    // The failure releases the channel; the queued command proceeds.
    second.join().unwrap().unwrap();
    match Arc::try_unwrap(transport) {
        Ok(transport) => transport.fini(),
        Err(_) => panic!("transport still shared"),
    }
}

#[test]
fn concurrent_commands_never_overlap_on_the_device() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = Arc::new(bring_up(&sim, config_with_timeout(Duration::from_secs(2))));

    let mut threads = Vec::new();
    for _ in 0..4 {
        let transport = transport.clone();
        threads.push(std::thread::spawn(move || {
            for _ in 0..25 {
                transport
                    .execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)
                    .unwrap();
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(sim.cir_violations(), 0);
    match Arc::try_unwrap(transport) {
        Ok(transport) => transport.fini(),
        Err(_) => panic!("transport still shared"),
    }
}
