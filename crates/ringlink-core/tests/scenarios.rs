//! End-to-end engine scenarios against the simulated radio
//!
//! Every test runs on a paused clock, so backoff delays and scan timeouts
//! elapse instantly once the engine is idle.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use ringlink_core::sim::{BondScript, RadioCall, SimulatedExecutor, SimulatedRadio};
use ringlink_core::{
    Advertisement, BackoffPolicy, BondState, CommandKind, CommandOutcome, ConnectionState,
    DeviceRecordStore, ErrorCode, ErrorRecord, Grant, GrantSet, LinkOperation, MemoryStore,
    Peripheral, PersistenceRecord, ReconnectEngine, RingLinkConfig, RingLinkError,
    RingLinkHandle, RingLinkManager, Snapshot, StateChange,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const GATT_ERROR: i32 = 133;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

struct Rig {
    radio: Arc<SimulatedRadio>,
    executor: SimulatedExecutor,
    store: MemoryStore,
    handle: RingLinkHandle,
}

fn rig_with(config: RingLinkConfig, store: MemoryStore, grants: GrantSet) -> Rig {
    let radio = Arc::new(SimulatedRadio::new());
    let executor = SimulatedExecutor::new();
    let engine = ReconnectEngine::with_rng(
        BackoffPolicy::new(config.reconnect.clone()),
        StdRng::seed_from_u64(7),
    );
    let handle = RingLinkManager::builder(config)
        .radio(radio.clone())
        .executor(Arc::new(executor.clone()))
        .store(Box::new(store.clone()))
        .grants(grants)
        .reconnect_engine(engine)
        .spawn()
        .expect("engine should start");
    Rig {
        radio,
        executor,
        store,
        handle,
    }
}

fn rig() -> Rig {
    rig_with(RingLinkConfig::default(), MemoryStore::new(), GrantSet::all())
}

fn ring() -> Peripheral {
    Peripheral::parse("AA:BB:CC:DD:EE:01", Some("Q_Ring_1")).unwrap()
}

fn advertisement(address: &str, name: &str, rssi: i16) -> Advertisement {
    Advertisement {
        address: Some(address.to_string()),
        name: Some(name.to_string()),
        rssi,
        raw: vec![0x02, 0x01, 0x06],
    }
}

async fn wait_state(handle: &RingLinkHandle, state: ConnectionState) -> Snapshot {
    timeout(Duration::from_secs(3600), handle.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("engine never reached {}", state))
        .expect("engine stopped")
}

async fn wait_until(handle: &RingLinkHandle, predicate: impl Fn(&Snapshot) -> bool) -> Snapshot {
    timeout(Duration::from_secs(3600), handle.wait_for(predicate))
        .await
        .expect("condition never met")
        .expect("engine stopped")
}

/// Let the engine drain everything already queued
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn connected(rig: &Rig) {
    rig.handle.connect(ring()).await.expect("connect accepted");
    wait_state(&rig.handle, ConnectionState::Connected).await;
}

fn drain_states(rx: &mut broadcast::Receiver<StateChange>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(change) = rx.try_recv() {
        seen.push(change.new);
    }
    seen
}

fn drain_errors(rx: &mut broadcast::Receiver<ErrorRecord>) -> Vec<ErrorRecord> {
    let mut seen = Vec::new();
    while let Ok(record) = rx.try_recv() {
        seen.push(record);
    }
    seen
}

fn connect_calls(radio: &SimulatedRadio) -> usize {
    radio
        .calls()
        .iter()
        .filter(|c| matches!(c, RadioCall::Connect(_)))
        .count()
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scan_emits_only_compatible_rings_once() {
    let rig = rig();
    let mut sightings = rig.handle.subscribe_sightings();
    rig.handle.start_scan().await.unwrap();

    assert!(rig.radio.emit_advertisement(advertisement("aa:bb:cc:dd:ee:01", "Q_Ring_1", -65)));
    rig.radio.emit_advertisement(advertisement("AA:BB:CC:DD:EE:01", "Q_Ring_1", -66));
    rig.radio.emit_advertisement(advertisement("AA:BB:CC:DD:EE:02", "FitBit", -50));
    rig.radio.emit_advertisement(advertisement("AA:BB:CC:DD:EE:03", "Q_Ring_2", -105));
    settle().await;

    let first = sightings.try_recv().expect("one sighting");
    assert_eq!(first.address.as_str(), "AA:BB:CC:DD:EE:01");
    assert_eq!(first.name.as_deref(), Some("Q_Ring_1"));
    assert_eq!(first.rssi, -65);
    assert!(first.raw_advertisement.is_none());
    assert!(sightings.try_recv().is_err());

    // A significant RSSI change re-emits
    rig.radio.emit_advertisement(advertisement("AA:BB:CC:DD:EE:01", "Q_Ring_1", -55));
    settle().await;
    assert_eq!(sightings.try_recv().unwrap().rssi, -55);
}

#[tokio::test(start_paused = true)]
async fn test_stop_scan_only_while_scanning() {
    let rig = rig();
    assert_eq!(
        rig.handle.stop_scan().await,
        Err(RingLinkError::InvalidTransition {
            from: ConnectionState::Idle,
            to: ConnectionState::Idle
        })
    );

    rig.handle.start_scan().await.unwrap();
    rig.handle.stop_scan().await.unwrap();
    assert_eq!(rig.handle.state(), ConnectionState::Idle);
    assert!(!rig.radio.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_scanning_stops_scan() {
    let rig = rig();
    let mut states = rig.handle.subscribe_states();
    rig.handle.start_scan().await.unwrap();
    connected(&rig).await;

    assert!(!rig.radio.is_scanning());
    assert!(rig.radio.calls().contains(&RadioCall::StopScan));
    assert_eq!(
        drain_states(&mut states),
        vec![
            ConnectionState::Scanning,
            ConnectionState::Connecting,
            ConnectionState::Pairing,
            ConnectionState::Connected
        ]
    );
}

// ----------------------------------------------------------------------------
// Connecting and Errors
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_persists_record() {
    let rig = rig();
    connected(&rig).await;

    let record = DeviceRecordStore::new(Box::new(rig.store.clone()))
        .load()
        .expect("record saved");
    assert_eq!(record.address, "AA:BB:CC:DD:EE:01");
    assert_eq!(record.name.as_deref(), Some("Q_Ring_1"));
    assert!(record.auto_reconnect);
    assert!(rig.handle.is_auto_reconnect_armed());
    assert_eq!(rig.handle.snapshot().mtu, Some(247));
}

#[tokio::test(start_paused = true)]
async fn test_gatt_error_enters_error_until_acknowledged() {
    let rig = rig();
    let mut errors = rig.handle.subscribe_errors();
    rig.radio.set_bond_state(&ring().address, BondState::Bonded);
    rig.radio.fail_next(LinkOperation::Connect, GATT_ERROR);

    rig.handle.connect(ring()).await.unwrap();
    let snapshot = wait_state(&rig.handle, ConnectionState::Error).await;
    let error = snapshot.error.expect("error stored");
    assert_eq!(error.code, "GATT_ERROR");
    assert_eq!(drain_errors(&mut errors), vec![error]);
    assert_eq!(rig.radio.open_links(), 0);

    // Nothing but acknowledge or disconnect leaves ERROR
    let err = rig.handle.start_scan().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);

    assert!(rig.handle.acknowledge_error().await.unwrap());
    assert_eq!(rig.handle.state(), ConnectionState::Idle);
    assert!(rig.handle.current_error().is_none());
    assert!(!rig.handle.acknowledge_error().await.unwrap());

    connected(&rig).await;
}

#[tokio::test(start_paused = true)]
async fn test_pairing_failure_after_retry() {
    let rig = rig();
    rig.radio.script_bonds([
        BondScript::Fail("rejected".into()),
        BondScript::Fail("rejected".into()),
    ]);

    rig.handle.connect(ring()).await.unwrap();
    let snapshot = wait_state(&rig.handle, ConnectionState::Error).await;
    let error = snapshot.error.unwrap();
    assert_eq!(error.code, "PAIRING_FAILED");
    assert!(error.message.contains("rejected"));
    assert_eq!(rig.radio.bond_requests(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_while_pairing_frees_pairing_slot() {
    let rig = rig();
    rig.radio
        .script_bonds([BondScript::Ignore, BondScript::Ignore, BondScript::Succeed]);

    rig.handle.connect(ring()).await.unwrap();
    wait_state(&rig.handle, ConnectionState::Pairing).await;
    rig.radio.drop_link(&ring().address, 8);
    wait_state(&rig.handle, ConnectionState::Error).await;
    assert_eq!(rig.radio.open_links(), 0);

    assert!(rig.handle.acknowledge_error().await.unwrap());
    connected(&rig).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_pairing_stops_bonding() {
    let rig = rig();
    rig.radio.script_bonds([BondScript::Ignore]);

    rig.handle.connect(ring()).await.unwrap();
    wait_state(&rig.handle, ConnectionState::Pairing).await;
    assert_eq!(rig.radio.bond_requests(), 1);

    rig.handle.disconnect().await.unwrap();
    assert_eq!(rig.handle.state(), ConnectionState::Disconnected);

    // No pairing retry once the bond timeout would have elapsed
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(rig.radio.bond_requests(), 1);
    assert_eq!(rig.handle.state(), ConnectionState::Disconnected);

    connected(&rig).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_requires_grant() {
    let rig = rig_with(
        RingLinkConfig::default(),
        MemoryStore::new(),
        GrantSet::all().without(Grant::RadioConnect),
    );
    let err = rig.handle.connect(ring()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PermissionDenied);
    assert_eq!(rig.handle.state(), ConnectionState::Idle);
    assert_eq!(connect_calls(&rig.radio), 0);
}

// ----------------------------------------------------------------------------
// Reconnection
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_with_backoff() {
    let rig = rig();
    connected(&rig).await;
    let mut errors = rig.handle.subscribe_errors();

    rig.radio.fail_next(LinkOperation::Connect, GATT_ERROR);
    rig.radio.fail_next(LinkOperation::Connect, GATT_ERROR);
    rig.radio.drop_link(&ring().address, 8);

    let snapshot = wait_state(&rig.handle, ConnectionState::Reconnecting).await;
    assert_eq!(snapshot.reconnect_attempt, 0);
    assert!(snapshot.auto_reconnect_armed);

    wait_until(&rig.handle, |s| s.reconnect_attempt == 1).await;
    wait_until(&rig.handle, |s| s.reconnect_attempt == 2).await;
    assert_eq!(rig.handle.state(), ConnectionState::Reconnecting);

    rig.radio.clear_calls();
    let snapshot = wait_state(&rig.handle, ConnectionState::Connected).await;
    assert_eq!(snapshot.reconnect_attempt, 0);

    let calls = rig.radio.calls();
    assert!(calls.iter().any(|c| matches!(c, RadioCall::DiscoverServices(_))));
    assert!(calls.iter().any(|c| matches!(c, RadioCall::RequestMtu(_, 247))));

    let codes: Vec<_> = drain_errors(&mut errors).into_iter().map(|e| e.code).collect();
    assert_eq!(codes, vec!["RECONNECT_FAILED", "RECONNECT_FAILED"]);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_disarms_and_forgets() {
    let rig = rig();
    connected(&rig).await;
    assert!(!rig.store.is_empty());

    rig.radio.drop_link(&ring().address, 8);
    wait_state(&rig.handle, ConnectionState::Reconnecting).await;

    rig.handle.disconnect().await.unwrap();
    assert_eq!(rig.handle.state(), ConnectionState::Disconnected);
    assert!(!rig.handle.is_auto_reconnect_armed());
    assert!(rig.store.is_empty());

    rig.radio.clear_calls();
    tokio::time::sleep(Duration::from_secs(400)).await;
    assert_eq!(connect_calls(&rig.radio), 0);
    assert_eq!(rig.handle.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_loss_without_auto_reconnect_goes_disconnected() {
    let rig = rig_with(
        RingLinkConfig::default().with_auto_reconnect(false),
        MemoryStore::new(),
        GrantSet::all(),
    );
    connected(&rig).await;
    rig.radio.drop_link(&ring().address, 8);
    wait_state(&rig.handle, ConnectionState::Disconnected).await;
    assert!(!rig.handle.is_auto_reconnect_armed());
}

#[tokio::test(start_paused = true)]
async fn test_radio_off_pauses_reconnect_until_back_on() {
    let rig = rig();
    connected(&rig).await;

    rig.radio.set_enabled(false);
    wait_state(&rig.handle, ConnectionState::Reconnecting).await;

    rig.radio.clear_calls();
    tokio::time::sleep(Duration::from_secs(400)).await;
    assert_eq!(connect_calls(&rig.radio), 0);
    assert_eq!(rig.handle.state(), ConnectionState::Reconnecting);

    rig.radio.set_enabled(true);
    let snapshot = wait_state(&rig.handle, ConnectionState::Connected).await;
    assert_eq!(snapshot.reconnect_attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_radio_off_while_scanning_returns_to_idle() {
    let rig = rig();
    let mut errors = rig.handle.subscribe_errors();
    rig.handle.start_scan().await.unwrap();

    rig.radio.set_enabled(false);
    wait_state(&rig.handle, ConnectionState::Idle).await;
    let codes: Vec<_> = drain_errors(&mut errors).into_iter().map(|e| e.code).collect();
    assert_eq!(codes, vec!["BLUETOOTH_DISABLED"]);
}

// ----------------------------------------------------------------------------
// Restore and Grants
// ----------------------------------------------------------------------------

fn persisted(auto_reconnect: bool) -> MemoryStore {
    let backend = MemoryStore::new();
    let mut store = DeviceRecordStore::new(Box::new(backend.clone()));
    assert!(store.save(&PersistenceRecord::new(&ring(), 1_700_000_000_000, auto_reconnect)));
    backend
}

#[tokio::test(start_paused = true)]
async fn test_boot_restores_persisted_ring() {
    let rig = rig_with(RingLinkConfig::default(), persisted(true), GrantSet::all());
    assert!(rig.handle.is_auto_reconnect_armed());
    assert_eq!(rig.handle.snapshot().device, Some(ring()));

    rig.handle.notify_boot_completed().unwrap();
    let snapshot = wait_state(&rig.handle, ConnectionState::Connected).await;
    assert_eq!(snapshot.device, Some(ring()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_restore_falls_back_to_reconnect() {
    let rig = rig_with(RingLinkConfig::default(), persisted(true), GrantSet::all());
    rig.radio.set_bond_state(&ring().address, BondState::Bonded);
    rig.radio.fail_next(LinkOperation::Connect, GATT_ERROR);
    let mut states = rig.handle.subscribe_states();

    rig.handle.notify_boot_completed().unwrap();
    wait_state(&rig.handle, ConnectionState::Connected).await;
    assert_eq!(
        drain_states(&mut states),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_boot_without_record_stays_idle() {
    let rig = rig();
    rig.handle.notify_boot_completed().unwrap();
    settle().await;
    assert_eq!(rig.handle.state(), ConnectionState::Idle);
    assert_eq!(connect_calls(&rig.radio), 0);
}

#[tokio::test(start_paused = true)]
async fn test_revoked_grant_tears_down_session() {
    let rig = rig();
    connected(&rig).await;

    rig.handle
        .update_grants(GrantSet::all().without(Grant::RadioConnect))
        .unwrap();
    let snapshot = wait_state(&rig.handle, ConnectionState::Error).await;
    let error = snapshot.error.unwrap();
    assert_eq!(error.code, "PERMISSION_REVOKED");
    assert!(error.message.contains(Grant::RadioConnect.remediation()));
    assert_eq!(rig.radio.open_links(), 0);
    assert!(!snapshot.auto_reconnect_armed);
}

#[tokio::test(start_paused = true)]
async fn test_status_allowed_follows_notification_grant() {
    let rig = rig_with(
        RingLinkConfig::default(),
        MemoryStore::new(),
        GrantSet::all().without(Grant::Notifications),
    );
    assert!(!rig.handle.snapshot().status_allowed);

    rig.handle.update_grants(GrantSet::all()).unwrap();
    wait_until(&rig.handle, |s| s.status_allowed).await;
}

// ----------------------------------------------------------------------------
// Device Commands
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_commands_require_connection() {
    let rig = rig();
    let err = rig.handle.locate_device().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotConnected);
    assert!(rig.executor.requests().is_empty());

    connected(&rig).await;
    let outcome = rig.handle.locate_device().await.unwrap();
    assert!(matches!(outcome, CommandOutcome::Success(_)));

    let requests = rig.executor.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].commands.len(), 1);
    assert_eq!(requests[0].commands[0].kind, CommandKind::Locate);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_command_is_rejected() {
    let rig = rig();
    let err = rig.handle.parse_command("self-destruct").unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownCommand);
    assert!(rig.handle.parse_command("locate").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_link() {
    let rig = rig();
    connected(&rig).await;
    rig.handle.shutdown().unwrap();
    settle().await;
    assert_eq!(rig.radio.open_links(), 0);
    assert_eq!(
        rig.handle.start_scan().await,
        Err(RingLinkError::EngineStopped)
    );
}
