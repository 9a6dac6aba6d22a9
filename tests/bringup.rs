//! Bring-up and teardown against the software device model.

use std::sync::Arc;
use std::time::Duration;

use switchline::resources::res_id;
use switchline::sim::SimDevice;
use switchline::{Config, ConfigBuilder, Error, SwitchTransport};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> Config {
    ConfigBuilder::new()
        .descriptor_queues(2, 2)
        .completion_queues(4)
        .queue_sizes(64, 64, 128, 64)
        .rx_buffer_size(2048)
        .cmd_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

fn bring_up(sim: &Arc<SimDevice>, config: Config) -> Result<SwitchTransport, Error> {
    SwitchTransport::new(sim.clone(), config, Box::new(|_, _| {}))
}

#[test]
fn bring_up_registers_everything() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = bring_up(&sim, small_config()).unwrap();

    assert_eq!(sim.live_queues(), (2, 2, 4, 2));
    assert_eq!(sim.fw_mapped_pages(), 2);
    assert_eq!(sim.cir_violations(), 0);

    let split = transport.kvd_split();
    assert_eq!(
        sim.kvd_programmed(),
        Some((split.linear, split.single, split.double))
    );
    assert_eq!(
        split.linear as u64 + split.single as u64 + split.double as u64,
        0x40000
    );
    assert_eq!(transport.fw_info().cmd_interface_rev, 1);
    assert_eq!(transport.board_info().psid, "SIM0000000000000");
    transport.fini();
}

#[test]
fn teardown_releases_everything() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let transport = bring_up(&sim, small_config()).unwrap();
    transport.fini();

    assert_eq!(sim.live_queues(), (0, 0, 0, 0));
    assert_eq!(sim.fw_mapped_pages(), 0);
    assert_eq!(sim.coherent_outstanding(), 0);
    assert_eq!(sim.mappings_outstanding(), 0);
}

#[test]
fn wrong_command_interface_rev_is_fatal() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    sim.set_cmd_interface_rev(2);
    assert!(matches!(
        bring_up(&sim, small_config()),
        Err(Error::Unsupported(_))
    ));
    assert_eq!(sim.coherent_outstanding(), 0);
}

#[test]
fn doorbell_in_other_bar_is_fatal() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    sim.set_doorbell_bar(1);
    assert!(matches!(
        bring_up(&sim, small_config()),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn queue_caps_exceeded_is_fatal() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    sim.set_max_sdqs(1);
    assert!(matches!(
        bring_up(&sim, small_config()),
        Err(Error::Unsupported(_))
    ));
    // Failed bring-up must not leak queues or memory.
    assert_eq!(sim.live_queues(), (0, 0, 0, 0));
    assert_eq!(sim.coherent_outstanding(), 0);
}

#[test]
fn missing_resource_sentinel_is_fatal() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    sim.omit_resource_sentinel();
    assert!(matches!(
        bring_up(&sim, small_config()),
        Err(Error::ResourceSentinelMissing)
    ));
    assert_eq!(sim.fw_mapped_pages(), 0);
    assert_eq!(sim.coherent_outstanding(), 0);
}

#[test]
fn kvd_minimum_violation_is_fatal() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    sim.set_resources(vec![
        (res_id::KVD_SIZE, 0x40000),
        (res_id::KVD_SINGLE_MIN_SIZE, 0x40000),
        (res_id::KVD_DOUBLE_MIN_SIZE, 0),
    ]);
    assert!(matches!(
        bring_up(&sim, small_config()),
        Err(Error::KvdPartition(_))
    ));
}

#[test]
fn missing_kvd_size_is_fatal() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    sim.set_resources(vec![(res_id::MAX_LAG, 64)]);
    assert!(matches!(
        bring_up(&sim, small_config()),
        Err(Error::KvdPartition(_))
    ));
}

#[test]
fn invalid_config_is_rejected() {
    init_logging();
    let sim = Arc::new(SimDevice::new());
    let mut config = small_config();
    config.cq_count = 100;
    assert!(matches!(bring_up(&sim, config), Err(Error::Config(_))));
}
