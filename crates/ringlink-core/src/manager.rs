//! Connection engine actor and application handle
//!
//! One task owns the [`ConnectionStateMachine`] and every component. Application
//! commands, radio events, timer firings and the outcomes of background pairing
//! and link setup all arrive on a single input queue, so every transition and
//! every error-store update happens in one place, one at a time.
//!
//! ```text
//!  RingLinkHandle ──┐
//!  TimerSlot ───────┤
//!  PairingReporter ─┼──► input queue ──► RingLinkManager ──► EventHub (states, sightings,
//!  link setup task ─┘                        ▲                        errors, status)
//!  RadioStack events ────────────────────────┘                 ──► watch<Snapshot>
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::commands::{CommandDispatcher, CommandExecutor, CommandKind, CommandOutcome, CommandReply, DeviceCommand};
use crate::config::RingLinkConfig;
use crate::error::{CommandError, ErrorCode, ErrorRecord, LinkError, LinkOperation, PairingError, RingLinkError};
use crate::filter::{DeviceFilter, FilterVerdict, ScannedPeripheral};
use crate::link::{LinkInfo, LinkManager};
use crate::pairing::{PairingCallback, PairingEvent, PairingStart, PairingWorkflow};
use crate::permissions::{Grant, GrantSet, Operation, PermissionGate, PlatformVersion};
use crate::persistence::{DeviceRecordStore, KeyValueStore, PersistenceRecord};
use crate::radio::{BondState, RadioEvent, RadioStack};
use crate::reconnect::{ReconnectEngine, ReconnectStep};
use crate::state::{ConnectionState, ConnectionStateMachine, StateChange};
use crate::status::StatusEvent;
use crate::timer::{TimerFired, TimerKind, TimerSlot};
use crate::types::{now_millis, DeviceAddress, Peripheral};
use crate::Result;

/// Capacity of each broadcast stream
const EVENT_CAPACITY: usize = 64;

/// Platform version assumed when the host does not say
const DEFAULT_PLATFORM: PlatformVersion = PlatformVersion(34);

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// Point-in-time view of the engine, readable without waiting on the actor
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub error: Option<ErrorRecord>,
    pub auto_reconnect_armed: bool,
    /// Failed attempts in the current reconnect cycle
    pub reconnect_attempt: u32,
    /// Ring being connected, connected, or targeted for reconnection
    pub device: Option<Peripheral>,
    pub mtu: Option<u16>,
    pub battery: Option<u8>,
    /// Whether the status surface may be shown
    pub status_allowed: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            error: None,
            auto_reconnect_armed: false,
            reconnect_attempt: 0,
            device: None,
            mtu: None,
            battery: None,
            status_allowed: false,
        }
    }
}

/// Broadcast streams exposed to the application
#[derive(Debug, Clone)]
pub struct EventHub {
    pub states: broadcast::Sender<StateChange>,
    pub sightings: broadcast::Sender<ScannedPeripheral>,
    pub errors: broadcast::Sender<ErrorRecord>,
    pub status: broadcast::Sender<StatusEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: broadcast::channel(capacity).0,
            sightings: broadcast::channel(capacity).0,
            errors: broadcast::channel(capacity).0,
            status: broadcast::channel(capacity).0,
        }
    }

    fn error(&self, record: ErrorRecord) {
        warn!("{}", record);
        let _ = self.errors.send(record);
    }

    fn status(&self, event: StatusEvent) {
        let _ = self.status.send(event);
    }
}

/// Why a connection is being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectIntent {
    /// Requested by the application
    User,
    /// Persisted ring after boot or radio re-enable
    Restore,
    /// Attempt scheduled by the reconnect engine
    Reconnect,
}

// ----------------------------------------------------------------------------
// Actor Messages
// ----------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T>>;

enum ManagerCommand {
    StartScan(Reply<()>),
    StopScan(Reply<()>),
    ResetScanResults,
    Connect(Peripheral, Reply<()>),
    Disconnect(Reply<()>),
    AcknowledgeError(oneshot::Sender<bool>),
    SendCommand(DeviceCommand, CommandReply),
    ReportBattery(Option<u8>),
    UpdateGrants(GrantSet),
    BootCompleted,
    RadioState(bool),
    Shutdown,
}

enum ManagerInput {
    Command(ManagerCommand),
    Timer(TimerFired),
    Pairing { op: u64, event: PairingEvent },
    LinkSetup { op: u64, result: std::result::Result<LinkInfo, LinkError> },
}

impl From<TimerFired> for ManagerInput {
    fn from(fired: TimerFired) -> Self {
        ManagerInput::Timer(fired)
    }
}

/// Forwards pairing progress of one connect operation to the actor
struct PairingReporter {
    op: u64,
    tx: mpsc::UnboundedSender<ManagerInput>,
}

impl PairingReporter {
    fn send(&self, event: PairingEvent) {
        let _ = self.tx.send(ManagerInput::Pairing { op: self.op, event });
    }
}

impl PairingCallback for PairingReporter {
    fn on_pairing_retry(&self, attempt: u32) {
        self.send(PairingEvent::Retry(attempt));
    }

    fn on_pairing_success(&self) {
        self.send(PairingEvent::Success);
    }

    fn on_pairing_failed(&self, reason: String) {
        self.send(PairingEvent::Failed(reason));
    }
}

#[derive(Debug, Clone)]
struct ConnectOp {
    id: u64,
    intent: ConnectIntent,
    peripheral: Peripheral,
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Assembles and spawns the engine
pub struct RingLinkBuilder {
    config: RingLinkConfig,
    radio: Option<Arc<dyn RadioStack>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    store: Option<Box<dyn KeyValueStore>>,
    grants: GrantSet,
    platform: PlatformVersion,
    reconnect: Option<ReconnectEngine>,
}

impl RingLinkBuilder {
    pub fn radio(mut self, radio: Arc<dyn RadioStack>) -> Self {
        self.radio = Some(radio);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Durable storage for the last-device record; without it persistence is disabled
    pub fn store(mut self, store: Box<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Access grants held at start-up
    pub fn grants(mut self, grants: GrantSet) -> Self {
        self.grants = grants;
        self
    }

    pub fn platform(mut self, platform: PlatformVersion) -> Self {
        self.platform = platform;
        self
    }

    /// Replace the reconnect engine, e.g. to seed its jitter
    pub fn reconnect_engine(mut self, engine: ReconnectEngine) -> Self {
        self.reconnect = Some(engine);
        self
    }

    /// Validate, spawn the engine task and return its handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<RingLinkHandle> {
        self.config.validate()?;
        let radio = self
            .radio
            .ok_or_else(|| RingLinkError::RadioUnavailable("no radio stack configured".into()))?;
        let executor = self.executor.ok_or_else(|| {
            RingLinkError::Config(crate::error::ConfigError::Validation(
                "no command executor configured".into(),
            ))
        })?;

        let config = self.config;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let hub = EventHub::new(EVENT_CAPACITY);
        let gate = PermissionGate::new(config.permissions.clone(), self.platform);
        let store = match self.store {
            Some(backend) => DeviceRecordStore::new(backend),
            None => DeviceRecordStore::unavailable(),
        };
        let reconnect = self.reconnect.unwrap_or_else(|| {
            ReconnectEngine::new(BackoffPolicy::new(config.reconnect.clone()))
        });

        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let snapshot_tx = Arc::new(snapshot_tx);

        let mut machine = ConnectionStateMachine::new();
        let eager = snapshot_tx.clone();
        machine.add_observer(move |_old: ConnectionState, new: ConnectionState| {
            eager.send_modify(|s| {
                s.state = new;
                if new != ConnectionState::Error {
                    s.error = None;
                }
            });
        });
        machine.add_observer(hub.states.clone());

        let radio_events = radio.subscribe();
        let mut manager = RingLinkManager {
            link: LinkManager::new(radio.clone(), config.link.clone()),
            pairing: PairingWorkflow::new(radio.clone(), config.pairing.clone()),
            filter: DeviceFilter::new(config.scan.clone()),
            dispatcher: CommandDispatcher::spawn(config.commands.clone(), executor),
            scan_timer: TimerSlot::new(TimerKind::ScanTimeout),
            machine,
            gate,
            grants: self.grants,
            radio,
            reconnect,
            store,
            hub: hub.clone(),
            snapshot: snapshot_tx,
            input_tx: input_tx.clone(),
            op: None,
            next_op_id: 0,
            setup_task: None,
            connected: None,
            battery: None,
            config: config.clone(),
        };
        manager.seed_from_store();
        manager.sync_snapshot();

        tokio::spawn(manager.run(input_rx, radio_events));

        Ok(RingLinkHandle {
            input_tx,
            snapshot: snapshot_rx,
            hub,
            config: Arc::new(config),
        })
    }
}

// ----------------------------------------------------------------------------
// Manager Actor
// ----------------------------------------------------------------------------

/// The engine task; reachable only through [`RingLinkHandle`]
pub struct RingLinkManager {
    config: RingLinkConfig,
    machine: ConnectionStateMachine,
    gate: PermissionGate,
    grants: GrantSet,
    radio: Arc<dyn RadioStack>,
    link: LinkManager,
    pairing: PairingWorkflow,
    reconnect: ReconnectEngine,
    store: DeviceRecordStore,
    filter: DeviceFilter,
    dispatcher: CommandDispatcher,
    scan_timer: TimerSlot,
    hub: EventHub,
    snapshot: Arc<watch::Sender<Snapshot>>,
    input_tx: mpsc::UnboundedSender<ManagerInput>,
    op: Option<ConnectOp>,
    next_op_id: u64,
    setup_task: Option<JoinHandle<()>>,
    connected: Option<LinkInfo>,
    battery: Option<u8>,
}

impl RingLinkManager {
    pub fn builder(config: RingLinkConfig) -> RingLinkBuilder {
        RingLinkBuilder {
            config,
            radio: None,
            executor: None,
            store: None,
            grants: GrantSet::none(),
            platform: DEFAULT_PLATFORM,
            reconnect: None,
        }
    }

    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<ManagerInput>,
        mut radio_rx: broadcast::Receiver<RadioEvent>,
    ) {
        info!("Connection engine started in {}", self.machine.state());
        let snapshot = self.snapshot.clone();
        let mut radio_open = true;

        loop {
            tokio::select! {
                input = input_rx.recv() => match input {
                    Some(ManagerInput::Command(ManagerCommand::Shutdown)) | None => break,
                    Some(input) => self.handle_input(input).await,
                },
                event = radio_rx.recv(), if radio_open => match event {
                    Ok(event) => self.on_radio_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Engine missed {} radio events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Radio event stream closed");
                        radio_open = false;
                    }
                },
                // Every handle is gone
                _ = snapshot.closed() => break,
            }
            self.sync_snapshot();
        }

        self.stop().await;
        info!("Connection engine stopped");
    }

    async fn handle_input(&mut self, input: ManagerInput) {
        match input {
            ManagerInput::Command(command) => self.handle_command(command).await,
            ManagerInput::Timer(fired) => match fired.kind {
                TimerKind::Reconnect => self.on_reconnect_timer(fired).await,
                TimerKind::ScanTimeout => {
                    if self.scan_timer.claim(fired) && self.machine.state() == ConnectionState::Scanning {
                        info!("Scan timed out");
                        self.stop_scanning().await;
                    }
                }
            },
            ManagerInput::Pairing { op, event } => self.on_pairing_event(op, event).await,
            ManagerInput::LinkSetup { op, result } => self.on_link_setup(op, result).await,
        }
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::StartScan(reply) => {
                let _ = reply.send(self.start_scan().await);
            }
            ManagerCommand::StopScan(reply) => {
                let result = match self.machine.state() {
                    ConnectionState::Scanning => {
                        self.stop_scanning().await;
                        Ok(())
                    }
                    from => Err(RingLinkError::InvalidTransition {
                        from,
                        to: ConnectionState::Idle,
                    }),
                };
                let _ = reply.send(result);
            }
            ManagerCommand::ResetScanResults => {
                debug!("Discarding {} tracked sightings", self.filter.len());
                self.filter.reset();
            }
            ManagerCommand::Connect(peripheral, reply) => {
                let _ = reply.send(self.connect(peripheral).await);
            }
            ManagerCommand::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            ManagerCommand::AcknowledgeError(reply) => {
                let _ = reply.send(self.machine.acknowledge_error());
            }
            ManagerCommand::SendCommand(command, reply) => self.send_command(command, reply),
            ManagerCommand::ReportBattery(level) => {
                if self.machine.state() == ConnectionState::Connected {
                    self.battery = level;
                    self.hub.status(StatusEvent::Battery(level));
                } else {
                    debug!("Ignoring battery report while {}", self.machine.state());
                }
            }
            ManagerCommand::UpdateGrants(grants) => self.update_grants(grants).await,
            ManagerCommand::BootCompleted => {
                info!("Boot completed");
                self.try_restore().await;
            }
            ManagerCommand::RadioState(enabled) => self.on_radio_state(enabled).await,
            ManagerCommand::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    async fn start_scan(&mut self) -> Result<()> {
        let from = self.machine.state();
        if !from.can_transition_to(ConnectionState::Scanning) {
            return Err(RingLinkError::InvalidTransition {
                from,
                to: ConnectionState::Scanning,
            });
        }
        self.gate.check(Operation::Scan, &self.grants)?;
        if !self.radio.is_enabled() {
            return Err(RingLinkError::RadioDisabled);
        }

        self.machine.transition_to(ConnectionState::Scanning);
        if let Err(e) = self.radio.start_scan().await {
            warn!("Failed to start scan: {}", e);
            self.machine.transition_to(ConnectionState::Idle);
            return Err(RingLinkError::RadioUnavailable(e.to_string()));
        }
        self.scan_timer
            .schedule(self.config.scan.scan_timeout, &self.input_tx);
        Ok(())
    }

    /// Stop the radio scan without changing state
    async fn halt_scan(&mut self) {
        self.scan_timer.cancel();
        if let Err(e) = self.radio.stop_scan().await {
            debug!("Stopping scan reported: {}", e);
        }
    }

    async fn stop_scanning(&mut self) {
        self.halt_scan().await;
        self.machine.transition_to(ConnectionState::Idle);
    }

    fn on_advertisement(&mut self, advertisement: crate::filter::Advertisement) {
        if self.machine.state() != ConnectionState::Scanning {
            return;
        }
        if let FilterVerdict::Emit(peripheral) = self.filter.observe(&advertisement, now_millis()) {
            let _ = self.hub.sightings.send(peripheral);
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    async fn connect(&mut self, peripheral: Peripheral) -> Result<()> {
        let from = self.machine.state();
        if !from.can_transition_to(ConnectionState::Connecting) {
            return Err(RingLinkError::InvalidTransition {
                from,
                to: ConnectionState::Connecting,
            });
        }
        self.gate.check(Operation::Connect, &self.grants)?;
        if !self.radio.is_enabled() {
            return Err(RingLinkError::RadioDisabled);
        }
        if self.pairing.is_in_progress() {
            return Err(PairingError::AlreadyInProgress.into());
        }

        if from == ConnectionState::Scanning {
            self.halt_scan().await;
        }
        info!("Connecting to {}", peripheral);
        self.begin_connect(peripheral, ConnectIntent::User).await;
        Ok(())
    }

    async fn begin_connect(&mut self, peripheral: Peripheral, intent: ConnectIntent) {
        if intent != ConnectIntent::Reconnect {
            self.machine.transition_to(ConnectionState::Connecting);
        }
        self.next_op_id += 1;
        let op = ConnectOp {
            id: self.next_op_id,
            intent,
            peripheral: peripheral.clone(),
        };
        self.op = Some(op.clone());

        if self.radio.bond_state(&peripheral.address).await == BondState::Bonded {
            self.start_link_setup(&op);
            return;
        }

        let reporter = Arc::new(PairingReporter {
            op: op.id,
            tx: self.input_tx.clone(),
        });
        match self.pairing.start_pairing(&peripheral, reporter).await {
            Ok(PairingStart::Started) => {
                if self.machine.state() == ConnectionState::Connecting {
                    self.machine.transition_to(ConnectionState::Pairing);
                }
            }
            // Success arrives through the reporter
            Ok(PairingStart::AlreadyBonded) => {}
            Err(e) => self.fail_op(op.id, e.into()).await,
        }
    }

    fn start_link_setup(&mut self, op: &ConnectOp) {
        let link = self.link.clone();
        let tx = self.input_tx.clone();
        let peripheral = op.peripheral.clone();
        let id = op.id;
        debug!("Starting link setup for {} (op {})", peripheral, id);
        self.setup_task = Some(tokio::spawn(async move {
            let result = link.connect(Some(&peripheral)).await;
            let _ = tx.send(ManagerInput::LinkSetup { op: id, result });
        }));
    }

    fn is_current_op(&self, id: u64) -> bool {
        self.op.as_ref().map(|op| op.id) == Some(id)
    }

    async fn on_pairing_event(&mut self, id: u64, event: PairingEvent) {
        if !self.is_current_op(id) {
            debug!("Ignoring pairing event {:?} for stale op {}", event, id);
            return;
        }
        match event {
            PairingEvent::Retry(attempt) => info!("Pairing retry, attempt {}", attempt),
            PairingEvent::Success => {
                if let Some(op) = self.op.clone() {
                    self.start_link_setup(&op);
                }
            }
            PairingEvent::Failed(reason) => {
                self.fail_op(id, PairingError::Failed { reason }.into()).await;
            }
        }
    }

    async fn on_link_setup(&mut self, id: u64, result: std::result::Result<LinkInfo, LinkError>) {
        if !self.is_current_op(id) {
            debug!("Ignoring link setup result for stale op {}", id);
            return;
        }
        self.setup_task = None;
        match result {
            Ok(info) => self.on_connected(info),
            Err(e) => self.fail_op(id, e.into()).await,
        }
    }

    fn on_connected(&mut self, info: LinkInfo) {
        let Some(op) = self.op.take() else {
            return;
        };
        if !self.machine.transition_to(ConnectionState::Connected) {
            warn!("Link ready but engine is {}", self.machine.state());
            return;
        }
        info!("Connected to {} (MTU {})", info.peripheral, info.mtu);

        let auto_reconnect = self.config.reconnect.enabled;
        let record = PersistenceRecord::new(&info.peripheral, now_millis(), auto_reconnect);
        self.store.save(&record);
        if auto_reconnect {
            self.reconnect.arm(info.peripheral.clone());
        }
        self.reconnect.on_success();
        self.battery = None;
        self.hub.status(StatusEvent::DeviceLinked {
            address: info.peripheral.address.clone(),
            name: info.peripheral.name.clone(),
        });
        if op.intent == ConnectIntent::Reconnect {
            info!("Reconnected to {}", info.peripheral);
        }
        self.connected = Some(info);
    }

    /// End the current connect operation with `error`
    async fn fail_op(&mut self, id: u64, error: RingLinkError) {
        if !self.is_current_op(id) {
            return;
        }
        let Some(op) = self.op.take() else {
            return;
        };
        if let Some(task) = self.setup_task.take() {
            task.abort();
        }
        self.pairing.cancel();
        self.link.teardown().await;

        match op.intent {
            ConnectIntent::User => {
                self.raise(error.to_record());
            }
            ConnectIntent::Restore => {
                self.hub.error(error.to_record());
                self.machine.transition_to(ConnectionState::Disconnected);
                if self.reconnect.is_armed() {
                    self.machine.transition_to(ConnectionState::Reconnecting);
                    let step = self.reconnect.begin(self.radio.is_enabled(), &self.input_tx);
                    self.publish_step(step);
                }
            }
            ConnectIntent::Reconnect => {
                let attempt = self.reconnect.attempt() + 1;
                self.hub.error(ErrorRecord::from_code(
                    ErrorCode::ReconnectFailed,
                    format!("reconnect attempt {} failed: {}", attempt, error),
                ));
                let step = self
                    .reconnect
                    .on_attempt_failed(self.radio.is_enabled(), &self.input_tx);
                self.publish_step(step);
            }
        }
    }

    fn publish_step(&self, step: ReconnectStep) {
        if let ReconnectStep::Scheduled { attempt, delay } = step {
            self.hub
                .status(StatusEvent::ReconnectScheduled { attempt, delay });
        }
    }

    /// Publish `record` and enter ERROR with it
    fn raise(&mut self, record: ErrorRecord) {
        self.hub.error(record.clone());
        self.snapshot.send_modify(|s| s.error = Some(record.clone()));
        if !self.machine.enter_error(record) {
            let current = self.machine.error().cloned();
            self.snapshot.send_modify(|s| s.error = current);
        }
    }

    // ------------------------------------------------------------------------
    // Disconnecting and Loss
    // ------------------------------------------------------------------------

    /// Cancel everything in flight and close the link
    async fn abandon_session(&mut self) {
        self.pairing.cancel();
        if let Some(task) = self.setup_task.take() {
            task.abort();
        }
        self.op = None;
        self.dispatcher.reject_pending();
        self.link.teardown().await;
        self.connected = None;
        self.battery = None;
    }

    async fn disconnect(&mut self) -> Result<()> {
        let from = self.machine.state();
        let allowed = matches!(
            from,
            ConnectionState::Connecting
                | ConnectionState::Pairing
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        );
        if !allowed {
            return Err(RingLinkError::InvalidTransition {
                from,
                to: ConnectionState::Disconnected,
            });
        }

        info!("Manual disconnect from {}", from);
        self.reconnect.disarm();
        self.abandon_session().await;
        self.store.clear();
        self.machine.transition_to(ConnectionState::Disconnected);
        Ok(())
    }

    fn current_address(&self) -> Option<&DeviceAddress> {
        self.connected
            .as_ref()
            .map(|info| &info.peripheral.address)
            .or_else(|| self.op.as_ref().map(|op| &op.peripheral.address))
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Advertisement(advertisement) => self.on_advertisement(advertisement),
            RadioEvent::LinkLost { address, status } => {
                if self.current_address() != Some(&address) {
                    return;
                }
                warn!("Link to {} lost (status {})", address, status);
                if self.machine.state() == ConnectionState::Connected {
                    self.on_unexpected_loss().await;
                } else if let Some(op) = self.op.as_ref() {
                    let id = op.id;
                    let error = LinkError::OperationFailed {
                        operation: LinkOperation::Connect,
                        status,
                    };
                    self.fail_op(id, error.into()).await;
                }
            }
            // Pairing watches bond state itself
            RadioEvent::BondStateChanged { .. } => {}
            RadioEvent::RadioStateChanged { enabled } => self.on_radio_state(enabled).await,
        }
    }

    async fn on_unexpected_loss(&mut self) {
        self.abandon_session().await;
        if self.reconnect.is_armed() {
            self.machine.transition_to(ConnectionState::Reconnecting);
            let step = self.reconnect.begin(self.radio.is_enabled(), &self.input_tx);
            self.publish_step(step);
        } else {
            self.machine.transition_to(ConnectionState::Disconnected);
        }
    }

    // ------------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------------

    async fn on_reconnect_timer(&mut self, fired: TimerFired) {
        if !self.reconnect.claim(fired) || self.machine.state() != ConnectionState::Reconnecting {
            return;
        }
        if !self.radio.is_enabled() {
            self.reconnect.pause();
            return;
        }
        self.attempt_reconnect().await;
    }

    async fn attempt_reconnect(&mut self) {
        let missing = self.gate.missing(Operation::Connect, &self.grants);
        if !missing.is_empty() {
            self.revoke(missing).await;
            return;
        }
        let Some(target) = self.reconnect.target().cloned() else {
            self.machine.transition_to(ConnectionState::Disconnected);
            return;
        };
        info!("Reconnect attempt {} to {}", self.reconnect.attempt() + 1, target);
        self.begin_connect(target, ConnectIntent::Reconnect).await;
    }

    async fn on_radio_state(&mut self, enabled: bool) {
        if enabled {
            info!("Radio enabled");
            if self.reconnect.resume() && self.machine.state() == ConnectionState::Reconnecting {
                self.attempt_reconnect().await;
            } else {
                self.try_restore().await;
            }
            return;
        }

        info!("Radio disabled");
        match self.machine.state() {
            ConnectionState::Scanning => {
                self.stop_scanning().await;
                self.hub.error(RingLinkError::RadioDisabled.to_record());
            }
            ConnectionState::Connected => self.on_unexpected_loss().await,
            ConnectionState::Reconnecting => {
                if self.op.is_some() {
                    // The attempt in flight is abandoned, not counted
                    self.abandon_session().await;
                }
                self.reconnect.pause();
            }
            ConnectionState::Connecting | ConnectionState::Pairing => {
                if let Some(id) = self.op.as_ref().map(|op| op.id) {
                    self.fail_op(id, RingLinkError::RadioDisabled).await;
                }
            }
            _ => {}
        }
    }

    /// Reconnect to the persisted ring, if there is one
    async fn try_restore(&mut self) {
        if !self.radio.is_enabled()
            || !matches!(
                self.machine.state(),
                ConnectionState::Idle | ConnectionState::Disconnected
            )
        {
            return;
        }
        let Some(record) = self.store.load() else {
            return;
        };
        let Some(peripheral) = record.peripheral() else {
            return;
        };
        if let Err(e) = self.gate.check(Operation::Connect, &self.grants) {
            self.hub.error(e.to_record());
            return;
        }
        info!("Restoring connection to {}", peripheral);
        self.reconnect.seed(&record);
        self.begin_connect(peripheral, ConnectIntent::Restore).await;
    }

    fn seed_from_store(&mut self) {
        if let Some(record) = self.store.load() {
            debug!("Loaded persisted ring {}", record.address);
            self.reconnect.seed(&record);
        }
    }

    // ------------------------------------------------------------------------
    // Grants and Commands
    // ------------------------------------------------------------------------

    async fn update_grants(&mut self, grants: GrantSet) {
        self.grants = grants;
        match self.machine.state() {
            ConnectionState::Connecting
            | ConnectionState::Pairing
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                let missing = self.gate.missing(Operation::Connect, &self.grants);
                if !missing.is_empty() {
                    self.revoke(missing).await;
                }
            }
            ConnectionState::Scanning => {
                let missing = self.gate.missing(Operation::Scan, &self.grants);
                if !missing.is_empty() {
                    self.stop_scanning().await;
                    self.hub.error(revoked_record(&missing));
                }
            }
            _ => {}
        }
    }

    /// Graceful teardown, then ERROR with PERMISSION_REVOKED
    async fn revoke(&mut self, missing: Vec<Grant>) {
        warn!("Connect grant revoked mid-session");
        self.reconnect.disarm();
        self.abandon_session().await;
        self.raise(revoked_record(&missing));
    }

    fn send_command(&mut self, command: DeviceCommand, reply: CommandReply) {
        match (&self.connected, self.machine.state()) {
            (Some(info), ConnectionState::Connected) => {
                self.dispatcher.submit(info.handle, command, reply);
            }
            _ => {
                let _ = reply.send(Err(CommandError::NotConnected));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot and Shutdown
    // ------------------------------------------------------------------------

    fn sync_snapshot(&self) {
        let device = self
            .connected
            .as_ref()
            .map(|info| info.peripheral.clone())
            .or_else(|| self.op.as_ref().map(|op| op.peripheral.clone()))
            .or_else(|| self.reconnect.target().cloned());
        let next = Snapshot {
            state: self.machine.state(),
            error: self.machine.error().cloned(),
            auto_reconnect_armed: self.reconnect.is_armed(),
            reconnect_attempt: self.reconnect.attempt(),
            device,
            mtu: self.connected.as_ref().map(|info| info.mtu),
            battery: self.battery,
            status_allowed: self.gate.missing(Operation::Notify, &self.grants).is_empty(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn stop(&mut self) {
        self.scan_timer.cancel();
        if self.machine.state() == ConnectionState::Scanning {
            self.halt_scan().await;
        }
        self.abandon_session().await;
    }
}

fn revoked_record(missing: &[Grant]) -> ErrorRecord {
    let denied = RingLinkError::PermissionDenied {
        missing: missing.to_vec(),
    };
    ErrorRecord::from_code(ErrorCode::PermissionRevoked, denied.to_string())
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable application handle to the engine
#[derive(Clone)]
pub struct RingLinkHandle {
    input_tx: mpsc::UnboundedSender<ManagerInput>,
    snapshot: watch::Receiver<Snapshot>,
    hub: EventHub,
    config: Arc<RingLinkConfig>,
}

impl RingLinkHandle {
    fn post(&self, command: ManagerCommand) -> Result<()> {
        self.input_tx
            .send(ManagerInput::Command(command))
            .map_err(|_| RingLinkError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ManagerCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| RingLinkError::EngineStopped)?
    }

    /// IDLE -> SCANNING; sightings arrive on [`subscribe_sightings`](Self::subscribe_sightings)
    pub async fn start_scan(&self) -> Result<()> {
        self.request(ManagerCommand::StartScan).await
    }

    /// SCANNING -> IDLE
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(ManagerCommand::StopScan).await
    }

    /// Forget every tracked sighting
    pub fn reset_scan_results(&self) -> Result<()> {
        self.post(ManagerCommand::ResetScanResults)
    }

    /// Start connecting; completion is observed on the state stream
    pub async fn connect(&self, peripheral: Peripheral) -> Result<()> {
        self.request(|reply| ManagerCommand::Connect(peripheral, reply))
            .await
    }

    /// Manual disconnect: disarms auto-reconnect and forgets the persisted ring
    pub async fn disconnect(&self) -> Result<()> {
        self.request(ManagerCommand::Disconnect).await
    }

    /// Clear the error and return to IDLE; false unless in ERROR
    pub async fn acknowledge_error(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.post(ManagerCommand::AcknowledgeError(tx))?;
        rx.await.map_err(|_| RingLinkError::EngineStopped)
    }

    /// Ask the ring to make itself noticeable
    pub async fn locate_device(&self) -> Result<CommandOutcome> {
        self.send_command(DeviceCommand::locate()).await
    }

    /// Resolve a command name against the configured command set
    pub fn parse_command(&self, name: &str) -> Result<CommandKind> {
        Ok(CommandKind::parse(name, &self.config.commands)?)
    }

    /// Send a device command; rejected at once unless CONNECTED
    pub async fn send_command(&self, command: DeviceCommand) -> Result<CommandOutcome> {
        if self.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected.into());
        }
        let (tx, rx) = oneshot::channel();
        self.post(ManagerCommand::SendCommand(command, tx))?;
        let outcome = rx.await.map_err(|_| RingLinkError::EngineStopped)?;
        Ok(outcome?)
    }

    /// Latest battery level; `None` when unknown
    pub fn report_battery(&self, level: Option<u8>) -> Result<()> {
        self.post(ManagerCommand::ReportBattery(level))
    }

    /// Replace the set of held access grants
    pub fn update_grants(&self, grants: GrantSet) -> Result<()> {
        self.post(ManagerCommand::UpdateGrants(grants))
    }

    /// Platform boot finished; reconnects to the persisted ring if any
    pub fn notify_boot_completed(&self) -> Result<()> {
        self.post(ManagerCommand::BootCompleted)
    }

    /// Radio switched on or off at the platform level
    pub fn notify_radio_state(&self, enabled: bool) -> Result<()> {
        self.post(ManagerCommand::RadioState(enabled))
    }

    /// Stop the engine; in-flight work is cancelled and the link closed
    pub fn shutdown(&self) -> Result<()> {
        self.post(ManagerCommand::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn current_error(&self) -> Option<ErrorRecord> {
        self.snapshot.borrow().error.clone()
    }

    pub fn is_auto_reconnect_armed(&self) -> bool {
        self.snapshot.borrow().auto_reconnect_armed
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.snapshot.borrow().reconnect_attempt
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the snapshot satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(&Snapshot) -> bool) -> Result<Snapshot> {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| RingLinkError::EngineStopped)?;
        }
    }

    /// Wait until the engine reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<Snapshot> {
        self.wait_for(|s| s.state == state).await
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.hub.states.subscribe()
    }

    pub fn subscribe_sightings(&self) -> broadcast::Receiver<ScannedPeripheral> {
        self.hub.sightings.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.hub.errors.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.hub.status.subscribe()
    }
}

impl std::fmt::Debug for RingLinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingLinkHandle")
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
