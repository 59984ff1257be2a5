//! Property-based tests for the pure engine components
//!
//! Covers the transition table, the backoff schedule, the device record and
//! advertisement deduplication.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ringlink_core::{
    Advertisement, BackoffPolicy, ConnectionState, ConnectionStateMachine, DeviceAddress,
    DeviceFilter, DeviceRecordStore, FilterVerdict, MemoryStore, Peripheral, PersistenceRecord,
    ReconnectConfig, ScanConfig, StateChange,
};

// ----------------------------------------------------------------------------
// Strategies
// ----------------------------------------------------------------------------

fn arb_state() -> impl Strategy<Value = ConnectionState> {
    prop::sample::select(ConnectionState::ALL.to_vec())
}

fn arb_address() -> impl Strategy<Value = String> {
    any::<[u8; 6]>().prop_map(|bytes| {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    })
}

fn arb_record() -> impl Strategy<Value = PersistenceRecord> {
    (
        arb_address(),
        proptest::option::of("[A-Za-z0-9_]{1,16}"),
        any::<u64>(),
        any::<bool>(),
    )
        .prop_map(|(address, name, ms, auto)| {
            let address = DeviceAddress::parse(&address).unwrap();
            PersistenceRecord::new(&Peripheral::new(address, name), ms, auto)
        })
}

/// Shortest transition path from IDLE to `state`
fn path_to(state: ConnectionState) -> Vec<ConnectionState> {
    use ConnectionState::*;
    match state {
        Idle => vec![],
        Scanning => vec![Scanning],
        Connecting => vec![Connecting],
        Pairing => vec![Connecting, Pairing],
        Connected => vec![Connecting, Connected],
        Disconnected => vec![Connecting, Disconnected],
        Reconnecting => vec![Connecting, Connected, Reconnecting],
        Error => vec![Connecting, Error],
    }
}

fn machine_in(state: ConnectionState) -> (ConnectionStateMachine, Arc<Mutex<Vec<StateChange>>>) {
    let mut machine = ConnectionStateMachine::new();
    for step in path_to(state) {
        assert!(machine.transition_to(step));
    }
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    machine.add_observer(move |old: ConnectionState, new: ConnectionState| {
        sink.lock().unwrap().push(StateChange { old, new });
    });
    (machine, seen)
}

// ----------------------------------------------------------------------------
// Transition Table
// ----------------------------------------------------------------------------

#[test]
fn every_state_pair_follows_the_table() {
    for from in ConnectionState::ALL {
        for to in ConnectionState::ALL {
            let (mut machine, seen) = machine_in(from);
            let applied = machine.transition_to(to);
            let seen = seen.lock().unwrap();

            assert_eq!(applied, from.can_transition_to(to), "{} -> {}", from, to);
            if applied {
                assert_eq!(machine.state(), to);
                assert_eq!(*seen, vec![StateChange { old: from, new: to }]);
            } else {
                assert_eq!(machine.state(), from);
                assert!(seen.is_empty());
            }
        }
    }
}

#[test]
fn error_is_only_left_by_acknowledge_or_disconnect() {
    let (mut machine, _) = machine_in(ConnectionState::Error);
    assert!(machine.error().is_some());
    for to in [
        ConnectionState::Scanning,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
    ] {
        assert!(!machine.transition_to(to));
    }
    assert!(machine.acknowledge_error());
    assert_eq!(machine.state(), ConnectionState::Idle);
    assert!(machine.error().is_none());
}

proptest! {
    /// Random walks never leave the table and keep the error record in step with ERROR
    #[test]
    fn random_walk_respects_table(targets in prop::collection::vec(arb_state(), 1..64)) {
        let (mut machine, seen) = machine_in(ConnectionState::Idle);
        let mut expected = Vec::new();

        for target in targets {
            let from = machine.state();
            let applied = machine.transition_to(target);
            prop_assert_eq!(applied, from.can_transition_to(target));
            if applied {
                expected.push(StateChange { old: from, new: target });
            }
            prop_assert_eq!(
                machine.error().is_some(),
                machine.state() == ConnectionState::Error
            );
        }

        prop_assert_eq!(&*seen.lock().unwrap(), &expected);
    }
}

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

proptest! {
    /// Every delay stays within the global bounds
    #[test]
    fn backoff_delay_is_bounded(attempt in 0u32..10_000, seed in any::<u64>()) {
        let policy = BackoffPolicy::new(ReconnectConfig::default());
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = policy.next_delay(attempt, &mut rng);
        prop_assert!(delay >= Duration::from_secs(1));
        prop_assert!(delay <= Duration::from_secs(360));
    }

    /// Delays stay within twenty percent of the attempt's base
    #[test]
    fn backoff_delay_tracks_bucket(attempt in 1u32..40, seed in any::<u64>()) {
        let policy = BackoffPolicy::new(ReconnectConfig::default());
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = policy.next_delay(attempt, &mut rng).as_millis() as u64;

        let base_ms = match attempt {
            1..=5 => 10_000u64,
            6..=10 => 30_000,
            n => (60_000u64 << (n - 11).min(20)).min(300_000),
        };
        prop_assert_eq!(policy.base_delay(attempt).as_millis() as u64, base_ms);

        let low = base_ms - base_ms / 5;
        let high = (base_ms + base_ms / 5).min(360_000);
        prop_assert!(delay >= low && delay <= high, "attempt {} gave {} ms", attempt, delay);
    }
}

#[test]
fn backoff_base_is_monotonic() {
    let policy = BackoffPolicy::new(ReconnectConfig::default());
    let mut previous = Duration::ZERO;
    for attempt in 1..200 {
        let base = policy.base_delay(attempt);
        assert!(base >= previous, "attempt {}", attempt);
        previous = base;
    }
    assert_eq!(previous, Duration::from_secs(300));
}

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

proptest! {
    /// Save followed by load yields the saved record, or nothing is written
    #[test]
    fn record_survives_save_and_load(record in arb_record()) {
        let backend = MemoryStore::new();
        let mut store = DeviceRecordStore::new(Box::new(backend.clone()));

        let fits = i64::try_from(record.last_connected_ms).is_ok();
        prop_assert_eq!(store.save(&record), fits);
        if !fits {
            prop_assert!(backend.is_empty());
            return Ok(());
        }
        prop_assert_eq!(store.load(), Some(record));

        prop_assert!(store.clear());
        prop_assert_eq!(store.load(), None);
        prop_assert!(backend.is_empty());
    }

    /// Only the latest save is visible
    #[test]
    fn later_save_replaces_earlier(first in arb_record(), second in arb_record()) {
        let mut store = DeviceRecordStore::new(Box::new(MemoryStore::new()));
        let first_saved = store.save(&first);
        let expected = if store.save(&second) {
            Some(second)
        } else if first_saved {
            Some(first)
        } else {
            None
        };
        prop_assert_eq!(store.load(), expected);
    }
}

// ----------------------------------------------------------------------------
// Device Filter
// ----------------------------------------------------------------------------

proptest! {
    /// Repeating an advertisement never adds entries or re-emits
    #[test]
    fn repeated_advertisement_emits_once(
        address in arb_address(),
        rssi in -100i16..=-20,
        repeats in 1usize..20,
    ) {
        let mut filter = DeviceFilter::new(ScanConfig::default());
        let adv = Advertisement {
            address: Some(address),
            name: Some("Q_Ring_7".to_string()),
            rssi,
            raw: vec![0x02, 0x01, 0x06],
        };

        let emitted = (0..repeats)
            .filter(|i| matches!(filter.observe(&adv, *i as u64), FilterVerdict::Emit(_)))
            .count();
        prop_assert_eq!(emitted, 1);
        prop_assert_eq!(filter.len(), 1);
    }

    /// Anything below the RSSI floor is dropped regardless of name
    #[test]
    fn weak_signal_is_never_tracked(address in arb_address(), rssi in -127i16..-100) {
        let mut filter = DeviceFilter::new(ScanConfig::default());
        let adv = Advertisement {
            address: Some(address),
            name: Some("Q_Ring_1".to_string()),
            rssi,
            raw: Vec::new(),
        };
        prop_assert!(matches!(filter.observe(&adv, 0), FilterVerdict::Rejected(_)));
        prop_assert!(filter.is_empty());
    }
}
