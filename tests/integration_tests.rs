//! Integration tests for the NVMe/TCP client
//!
//! These run against an in-process mock controller (see `common/mod.rs`)
//! so the suite is fully hermetic. They cover:
//! - Connection initialisation and Fabric Connect
//! - Discovery
//! - Identify decoding
//! - Block I/O over both the in-capsule and R2T write paths
//! - Reservations
//! - ANA state reporting
//! - Asynchronous event notification

mod common;

use common::{MockConfig, MockController};
use nvmeof_tcp::aen::aen_mask;
use nvmeof_tcp::logpage::AnaState;
use nvmeof_tcp::reservation::{AcquireAction, ReservationType};
use nvmeof_tcp::{ClientConfig, ConnectionState, NvmeClient, DISCOVERY_NQN};
use std::time::Duration;

fn connect(mock: &MockController) -> NvmeClient {
    common::init_logging();
    NvmeClient::connect(
        ClientConfig::new(&mock.host())
            .port(mock.port())
            .subsystem_nqn(common::MOCK_SUBNQN)
            .timeout(Duration::from_secs(5)),
    )
    .expect("connect failed")
}

#[test]
fn test_connect_and_identify_controller() {
    let mock = MockController::start();
    let client = connect(&mock);

    assert_eq!(client.state(), ConnectionState::Active);

    // Negotiated parameters reflect the mock's ICResp
    let negotiated = client.negotiated();
    assert!(negotiated.header_digest);
    assert!(negotiated.data_digest);
    assert_eq!(negotiated.maxh2cdata, 4096);

    // Model number is stripped of trailing spaces; the controller id from
    // the Connect completion matches the Identify data
    let info = client.controller_info();
    assert_eq!(info.model_number, common::MOCK_MODEL);
    assert_eq!(info.serial_number, common::MOCK_SERIAL);
    assert_eq!(client.session_info().controller_id, common::CNTLID);
    assert_eq!(info.controller_id, common::CNTLID);
    assert_eq!(info.subnqn, common::MOCK_SUBNQN);
    assert_eq!(info.nn, 2);

    // A fresh Identify round-trips to the same values
    let fresh = client.identify_controller().unwrap();
    assert_eq!(&fresh, info);

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[test]
fn test_discovery_entries() {
    let mock = MockController::start();
    common::init_logging();

    let client = NvmeClient::connect(
        ClientConfig::new(&mock.host())
            .port(mock.port())
            .subsystem_nqn(DISCOVERY_NQN)
            .timeout(Duration::from_secs(5)),
    )
    .expect("discovery connect failed");

    let entries = client.get_discovery_entries(16).unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.trtype, 3);
        // TRSVCID parses as a decimal port number
        entry.trsvcid.parse::<u16>().expect("trsvcid not decimal");
        // NQNs come back right-trimmed of NULs
        assert!(!entry.subnqn.ends_with('\0'));
        assert!(entry.subnqn.starts_with("nqn."));
    }
    assert_eq!(entries[0].subnqn, common::MOCK_SUBNQN);
    assert_eq!(entries[1].subnqn, DISCOVERY_NQN);

    // Asking for fewer entries truncates
    let one = client.get_discovery_entries(1).unwrap();
    assert_eq!(one.len(), 1);
}

#[test]
fn test_list_and_identify_namespaces() {
    let mock = MockController::start();
    let client = connect(&mock);

    let nsids = client.list_namespaces().unwrap();
    assert_eq!(nsids, vec![1, 2]);

    let ns = client.identify_namespace(1).unwrap();
    assert_eq!(ns.nsze, common::NAMESPACE_BLOCKS);
    assert_eq!(ns.block_size(), common::BLOCK_SIZE as u32);
    assert_eq!(client.block_size(1).unwrap(), 512);
}

#[test]
fn test_read_write_roundtrip() {
    let mock = MockController::start();
    let client = connect(&mock);

    let mut payload = b"ABCDE".to_vec();
    payload.resize(512, 0);
    client.write_data(1, 0, &payload).unwrap();

    let read = client.read_data(1, 0, 1).unwrap();
    assert_eq!(read.len(), 512);
    assert!(read.starts_with(b"ABCDE"));
    assert!(read[5..].iter().all(|&b| b == 0));
}

#[test]
fn test_incapsule_boundary_triggers_r2t() {
    let mock = MockController::start();
    let client = connect(&mock);

    // Exactly the in-capsule limit: no R2T
    let fitting = vec![0x5A; common::INCAPSULE_LIMIT];
    client.write_data(1, 0, &fitting).unwrap();
    assert_eq!(mock.r2t_count(), 0);

    // One block more: serviced through R2T, chunked by MAXH2CDATA
    let oversize = vec![0xA5; common::INCAPSULE_LIMIT + common::BLOCK_SIZE];
    client.write_data(1, 64, &oversize).unwrap();
    assert_eq!(mock.r2t_count(), 1);

    // Both paths delivered identical bytes
    assert_eq!(mock.disk_contents(1, 0, fitting.len()), fitting);
    assert_eq!(mock.disk_contents(1, 64, oversize.len()), oversize);

    let read = client.read_data(1, 64, 17).unwrap();
    assert_eq!(read, oversize);
}

#[test]
fn test_write_zeroes_and_flush() {
    let mock = MockController::start();
    let client = connect(&mock);

    let payload = vec![0xFF; 1024];
    client.write_data(1, 10, &payload).unwrap();
    client.write_zeroes(1, 10, 2).unwrap();
    let read = client.read_data(1, 10, 2).unwrap();
    assert!(read.iter().all(|&b| b == 0));

    client.flush_namespace(1).unwrap();
    client.deallocate(1, 10, 2).unwrap();
}

#[test]
fn test_data_arrives_after_completion() {
    // The controller may post the CQE before its C2H data; both orders
    // must assemble identically
    let mock = MockController::start_with(MockConfig {
        cqe_before_data: true,
        ..MockConfig::default()
    });
    let client = connect(&mock);

    let mut payload = b"ORDER".to_vec();
    payload.resize(512, 7);
    client.write_data(1, 3, &payload).unwrap();
    let read = client.read_data(1, 3, 1).unwrap();
    assert_eq!(read, payload);
}

#[test]
fn test_reservation_lifecycle() {
    let mock = MockController::start();
    let client = connect(&mock);
    let key = 0xCAFE_F00D;

    client.reservation_register(1, 0, key, 0).unwrap();
    client
        .reservation_acquire(1, key, ReservationType::WriteExclusive, AcquireAction::Acquire)
        .unwrap();

    let status = client.reservation_report(1).unwrap();
    assert_eq!(status.rtype, Some(ReservationType::WriteExclusive));
    assert_eq!(status.controllers.len(), 1);
    let holder = status.holder().expect("no reservation holder");
    assert_eq!(holder.key, key);
    assert_eq!(holder.controller_id, common::CNTLID);

    client
        .reservation_release(1, key, ReservationType::WriteExclusive)
        .unwrap();
    let status = client.reservation_report(1).unwrap();
    assert_eq!(status.rtype, None);
    assert!(status.holder().is_none());
}

#[test]
fn test_ana_log_covers_active_namespaces() {
    let mock = MockController::start();
    let client = connect(&mock);

    let log = client.get_ana_log_page().unwrap();
    assert_eq!(log.groups.len(), 2);
    assert_eq!(log.groups[0].state, AnaState::Optimized);
    assert_eq!(log.groups[1].state, AnaState::NonOptimized);

    let total_nsids: usize = log.groups.iter().map(|g| g.namespace_ids.len()).sum();
    assert_eq!(total_nsids, client.list_namespaces().unwrap().len());
}

#[test]
fn test_async_event_notification() {
    let mock = MockController::start();
    let client = connect(&mock);

    client.enable_async_events(aen_mask::NOTICE).unwrap();
    client.request_async_events(4).unwrap();

    // Namespace change: Notice / attribute changed / Changed NS List log
    mock.trigger_event((0x0B << 16) | 0x02);

    let events = client.poll_async_events(Duration::from_secs(1));
    assert!(!events.is_empty(), "no async event delivered");
    let event = &events[0];
    assert_eq!(event.log_page_id, 0x0B);
    assert_eq!(event.event_type, 0x02);
    assert!(event.description.contains("namespace"));
    assert_eq!(client.aen_overflow_count(), 0);

    // The channel is not auto-reposted: three requests remain parked, and
    // polling again without a trigger yields nothing
    let events = client.poll_async_events(Duration::from_millis(100));
    assert!(events.is_empty());
}

#[test]
fn test_get_set_features() {
    let mock = MockController::start();
    let client = connect(&mock);

    client.enable_async_events(aen_mask::NOTICE).unwrap();
    let value = client.get_features(0x0B, 0).unwrap();
    assert_eq!(value, aen_mask::NOTICE);
}

#[test]
fn test_property_access_after_activation() {
    let mock = MockController::start();
    let client = connect(&mock);

    let vs = client.property_get(0x08, false).unwrap();
    assert_eq!(vs, 0x0001_0400);
    assert_eq!(client.session_info().vs, 0x0001_0400);

    let cap = client.property_get(0x00, true).unwrap();
    assert_eq!(cap & 0xFFFF, 31); // MQES
}

#[test]
fn test_keep_alive() {
    let mock = MockController::start();
    common::init_logging();
    let client = NvmeClient::connect(
        ClientConfig::new(&mock.host())
            .port(mock.port())
            .subsystem_nqn(common::MOCK_SUBNQN)
            .timeout(Duration::from_secs(5))
            .kato_ms(400),
    )
    .expect("connect with keep-alive failed");

    // Manual keep-alive works, and the periodic task keeps the session up
    client.keep_alive().unwrap();
    std::thread::sleep(Duration::from_millis(900));
    assert_eq!(client.state(), ConnectionState::Active);
    client.identify_controller().unwrap();
}

#[test]
fn test_disconnect_fails_outstanding_commands() {
    let mock = MockController::start();
    let client = std::sync::Arc::new(connect(&mock));
    mock.blackhole_opcode(0x00); // swallow FLUSH

    let worker = {
        let client = std::sync::Arc::clone(&client);
        std::thread::spawn(move || client.flush_namespace(1))
    };
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(client.in_flight(), 1);

    client.disconnect();
    let result = worker.join().unwrap();
    assert!(
        matches!(result, Err(nvmeof_tcp::NvmeError::Connection(_))),
        "expected connection error, got {:?}",
        result
    );
    // Registry drained on close
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.state(), ConnectionState::Closed);
}
