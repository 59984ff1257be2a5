//! Connection State Machine
//!
//! Holds the single current [`ConnectionState`], the active [`ErrorRecord`] while
//! in ERROR, and the registered observers. Every attempted transition consults the
//! static transition table; a rejected transition changes nothing and notifies no one.
//!
//! The machine is deliberately synchronous and `&mut self`: it is owned by exactly
//! one task (see [`crate::manager`]), which serializes every mutation.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{ErrorCode, ErrorRecord};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state of the ring connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Pairing,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Every state, in declaration order
    pub const ALL: [ConnectionState; 8] = [
        ConnectionState::Idle,
        ConnectionState::Scanning,
        ConnectionState::Connecting,
        ConnectionState::Pairing,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
        ConnectionState::Reconnecting,
        ConnectionState::Error,
    ];

    /// Targets reachable from this state
    pub fn allowed_targets(self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Idle => &[Scanning, Connecting],
            Scanning => &[Idle, Connecting],
            Connecting => &[Pairing, Connected, Disconnected, Error],
            Pairing => &[Connected, Disconnected, Error],
            Connected => &[Disconnected, Reconnecting, Error],
            Disconnected => &[Idle, Connecting, Reconnecting],
            Reconnecting => &[Connecting, Connected, Disconnected, Error],
            Error => &[Idle, Disconnected],
        }
    }

    /// Whether the transition table allows `self -> target`
    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Upper-case name used in logs and status text
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Scanning => "SCANNING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Pairing => "PAIRING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An applied transition, as delivered to observers and the state stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

// ----------------------------------------------------------------------------
// Observers
// ----------------------------------------------------------------------------

/// Receives every applied transition, synchronously and in registration order
///
/// Implementations run on the engine task and must not block; hand long work to
/// a channel instead (the `broadcast::Sender` implementation does exactly that).
pub trait StateObserver: Send {
    fn on_state_changed(&mut self, old: ConnectionState, new: ConnectionState);
}

impl<F> StateObserver for F
where
    F: FnMut(ConnectionState, ConnectionState) + Send,
{
    fn on_state_changed(&mut self, old: ConnectionState, new: ConnectionState) {
        self(old, new)
    }
}

impl StateObserver for broadcast::Sender<StateChange> {
    fn on_state_changed(&mut self, old: ConnectionState, new: ConnectionState) {
        // No subscribers is not an error
        let _ = self.send(StateChange { old, new });
    }
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Table-driven state holder with observer notification
pub struct ConnectionStateMachine {
    state: ConnectionState,
    error: Option<ErrorRecord>,
    observers: Vec<Box<dyn StateObserver>>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in IDLE with no observers
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            error: None,
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The stored error; `Some` only while in ERROR
    pub fn error(&self) -> Option<&ErrorRecord> {
        self.error.as_ref()
    }

    /// Register an observer; observers are notified in registration order
    pub fn add_observer<O: StateObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    /// Attempt a transition; returns false and changes nothing when disallowed
    pub fn transition_to(&mut self, target: ConnectionState) -> bool {
        if target == ConnectionState::Error {
            // ERROR always carries a record
            return self.enter_error(ErrorRecord::from_code(
                ErrorCode::Internal,
                "entered error state without details",
            ));
        }
        self.apply(target)
    }

    /// Enter ERROR and store the record in one step
    pub fn transition_to_error(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.enter_error(ErrorRecord::new(code, message))
    }

    /// Enter ERROR with a prepared record
    pub fn enter_error(&mut self, record: ErrorRecord) -> bool {
        if !self.state.can_transition_to(ConnectionState::Error) {
            warn!(
                "Rejected transition {} -> ERROR ({})",
                self.state, record
            );
            return false;
        }
        self.error = Some(record);
        self.apply(ConnectionState::Error)
    }

    /// Clear the stored error and return to IDLE; false unless in ERROR
    pub fn acknowledge_error(&mut self) -> bool {
        if self.state != ConnectionState::Error {
            return false;
        }
        self.error = None;
        self.apply(ConnectionState::Idle)
    }

    fn apply(&mut self, target: ConnectionState) -> bool {
        let old = self.state;
        if !old.can_transition_to(target) {
            warn!("Rejected transition {} -> {}", old, target);
            return false;
        }

        self.state = target;
        if target != ConnectionState::Error {
            self.error = None;
        }
        info!("Connection state {} -> {}", old, target);

        for observer in self.observers.iter_mut() {
            observer.on_state_changed(old, target);
        }
        true
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("error", &self.error)
            .field("observers", &self.observers.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
