//! RingLink connection orchestration engine
//!
//! This crate manages one long-lived Bluetooth Low Energy link to a wearable ring
//! on behalf of an application that may be suspended or closed at any time.
//!
//! ## Architecture
//!
//! The engine is organized into several modules, leaves first:
//!
//! - [`filter`] - Advertisement validation and per-address deduplication
//! - [`permissions`] - Missing access grants per operation and platform version
//! - [`link`] - Radio link setup (connect, service discovery, MTU) and teardown
//! - [`pairing`] - Bonding workflow with timeout and a single retry
//! - [`persistence`] - Durable record of the last connected ring
//! - [`backoff`] / [`reconnect`] - Jittered backoff and the auto-reconnect engine
//! - [`state`] - Connection state machine and its transition table
//! - [`commands`] - Serialized, optionally batched device commands
//! - [`status`] - Persistent status surface rendering
//! - [`manager`] - The actor that composes everything and the handle applications use
//!
//! Radio access, vendor command execution and durable storage are trait seams
//! ([`RadioStack`], [`CommandExecutor`], [`KeyValueStore`]). The [`sim`] module
//! provides scriptable implementations for tests and demos.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringlink_core::{
//!     sim::{SimulatedExecutor, SimulatedRadio},
//!     GrantSet, MemoryStore, Peripheral, RingLinkConfig, RingLinkManager,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = Arc::new(SimulatedRadio::new());
//! let handle = RingLinkManager::builder(RingLinkConfig::default())
//!     .radio(radio)
//!     .executor(Arc::new(SimulatedExecutor::new()))
//!     .store(Box::new(MemoryStore::new()))
//!     .grants(GrantSet::all())
//!     .spawn()?;
//!
//! let peripheral = Peripheral::parse("AA:BB:CC:DD:EE:01", Some("Q_Ring_1"))?;
//! handle.connect(peripheral).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod link;
pub mod manager;
pub mod pairing;
pub mod permissions;
pub mod persistence;
pub mod radio;
pub mod reconnect;
pub mod sim;
pub mod state;
pub mod status;
pub mod timer;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use backoff::BackoffPolicy;
pub use commands::{
    CommandDispatcher, CommandExecutor, CommandKind, CommandOutcome, DeviceCommand,
    DeviceRequest,
};
pub use config::{
    CommandConfig, LinkConfig, PairingConfig, PermissionConfig, ReconnectConfig,
    RingLinkConfig, ScanConfig,
};
pub use error::{
    CommandError, ConfigError, ErrorCode, ErrorRecord, LinkError, LinkOperation,
    PairingError, RadioError, RingLinkError, StorageError,
};
pub use filter::{Advertisement, DeviceFilter, FilterVerdict, RejectReason, ScannedPeripheral};
pub use link::{LinkInfo, LinkManager};
pub use manager::{EventHub, RingLinkBuilder, RingLinkHandle, RingLinkManager, Snapshot};
pub use pairing::{PairingCallback, PairingEvent, PairingStart, PairingWorkflow};
pub use permissions::{Grant, GrantSet, Operation, PermissionGate, PlatformVersion};
pub use persistence::{
    DeviceRecordStore, JsonFileStore, KeyValueStore, MemoryStore, PersistenceRecord, StoredValue,
};
pub use radio::{BondState, LinkHandle, RadioEvent, RadioStack};
pub use reconnect::{ReconnectEngine, ReconnectStep};
pub use state::{ConnectionState, ConnectionStateMachine, StateChange, StateObserver};
pub use status::{StatusAction, StatusEvent, StatusNotification, StatusPresenter, StatusSurface};
pub use timer::{TimerFired, TimerKind, TimerSlot};
pub use types::{now_millis, DeviceAddress, Peripheral};

/// Result type used across the engine
pub type Result<T> = core::result::Result<T, RingLinkError>;
