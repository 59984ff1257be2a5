//! Scriptable radio stack and command executor
//!
//! [`SimulatedRadio`] behaves like a cooperative platform stack: every call is
//! recorded, link stages succeed unless a fault was queued for them, and bonding
//! follows a script. Tests and the CLI demo mode drive it from the outside with
//! [`SimulatedRadio::emit_advertisement`], [`SimulatedRadio::drop_link`] and
//! [`SimulatedRadio::set_enabled`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::commands::{CommandExecutor, CommandOutcome, DeviceRequest};
use crate::error::{LinkOperation, RadioError};
use crate::filter::Advertisement;
use crate::radio::{BondState, LinkHandle, RadioEvent, RadioStack};
use crate::types::DeviceAddress;

/// Status reported when the radio is switched off
pub const STATUS_RADIO_OFF: i32 = -1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Simulated Radio
// ----------------------------------------------------------------------------

/// A call made against the simulated radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan,
    StopScan,
    Connect(DeviceAddress),
    DiscoverServices(LinkHandle),
    RequestMtu(LinkHandle, u16),
    Write(LinkHandle, Vec<u8>),
    Read(LinkHandle),
    Disconnect(LinkHandle),
    Close(LinkHandle),
    CreateBond(DeviceAddress),
}

/// How the next bonding request plays out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondScript {
    /// BONDING -> BONDED
    Succeed,
    /// BONDING -> NONE with the given reason
    Fail(String),
    /// Stays in BONDING forever
    Ignore,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Status(i32),
    Stall,
}

#[derive(Debug)]
struct RadioState {
    enabled: bool,
    scanning: bool,
    next_handle: u64,
    links: HashMap<LinkHandle, DeviceAddress>,
    faults: HashMap<LinkOperation, VecDeque<Fault>>,
    bonds: HashMap<DeviceAddress, BondState>,
    bond_scripts: VecDeque<BondScript>,
    bond_requests: usize,
    max_mtu: u16,
    calls: Vec<RadioCall>,
}

#[derive(Debug)]
struct RadioInner {
    state: Mutex<RadioState>,
    events: broadcast::Sender<RadioEvent>,
    bond_latency: Duration,
}

/// In-process stand-in for the platform radio
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    inner: Arc<RadioInner>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RadioInner {
                state: Mutex::new(RadioState {
                    enabled: true,
                    scanning: false,
                    next_handle: 0,
                    links: HashMap::new(),
                    faults: HashMap::new(),
                    bonds: HashMap::new(),
                    bond_scripts: VecDeque::new(),
                    bond_requests: 0,
                    max_mtu: 247,
                    calls: Vec::new(),
                }),
                events,
                bond_latency: Duration::from_millis(200),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RadioState> {
        lock(&self.inner.state)
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<RadioCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Make the next call of `operation` fail with `status`
    pub fn fail_next(&self, operation: LinkOperation, status: i32) {
        self.queue_fault(operation, Fault::Status(status));
    }

    /// Make the next call of `operation` never complete
    pub fn stall_next(&self, operation: LinkOperation) {
        self.queue_fault(operation, Fault::Stall);
    }

    fn queue_fault(&self, operation: LinkOperation, fault: Fault) {
        self.state()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Upper bound for MTU negotiation
    pub fn set_max_mtu(&self, mtu: u16) {
        self.state().max_mtu = mtu;
    }

    pub fn set_bond_state(&self, address: &DeviceAddress, bond: BondState) {
        self.state().bonds.insert(address.clone(), bond);
    }

    /// Queue outcomes for upcoming bonding requests; unscripted requests succeed
    pub fn script_bonds(&self, scripts: impl IntoIterator<Item = BondScript>) {
        self.state().bond_scripts.extend(scripts);
    }

    /// Number of bonding requests received
    pub fn bond_requests(&self) -> usize {
        self.state().bond_requests
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// Links opened and not yet closed
    pub fn open_links(&self) -> usize {
        self.state().links.len()
    }

    /// Publish an arbitrary radio event
    pub fn emit(&self, event: RadioEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Deliver an advertisement if a scan is running
    pub fn emit_advertisement(&self, advertisement: Advertisement) -> bool {
        if !self.is_scanning() {
            return false;
        }
        self.emit(RadioEvent::Advertisement(advertisement));
        true
    }

    /// Drop every link to `address` as if the ring walked out of range
    pub fn drop_link(&self, address: &DeviceAddress, status: i32) {
        self.state().links.retain(|_, a| a != address);
        debug!("Simulated link loss for {}", address);
        self.emit(RadioEvent::LinkLost {
            address: address.clone(),
            status,
        });
    }

    /// Switch the radio on or off at the platform level
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.state();
            state.enabled = enabled;
            if !enabled {
                state.scanning = false;
                state.links.clear();
            }
        }
        self.emit(RadioEvent::RadioStateChanged { enabled });
    }

    /// Record the call and return the queued fault for `operation`, if any
    fn enter(&self, call: RadioCall, operation: Option<LinkOperation>) -> Result<(), Option<Fault>> {
        let mut state = self.state();
        trace!("Simulated radio call {:?}", call);
        state.calls.push(call);
        if !state.enabled {
            return Err(Some(Fault::Status(STATUS_RADIO_OFF)));
        }
        match operation.and_then(|op| state.faults.get_mut(&op).and_then(VecDeque::pop_front)) {
            Some(fault) => Err(Some(fault)),
            None => Ok(()),
        }
    }

    async fn check(&self, call: RadioCall, operation: Option<LinkOperation>) -> Result<(), RadioError> {
        match self.enter(call, operation) {
            Ok(()) => Ok(()),
            Err(Some(Fault::Stall)) => std::future::pending().await,
            Err(Some(Fault::Status(STATUS_RADIO_OFF))) => {
                Err(RadioError::new(STATUS_RADIO_OFF, "bluetooth disabled"))
            }
            Err(Some(Fault::Status(status))) => Err(RadioError::new(status, "simulated failure")),
            Err(None) => Ok(()),
        }
    }

    fn require_link(&self, link: LinkHandle) -> Result<(), RadioError> {
        if self.state().links.contains_key(&link) {
            Ok(())
        } else {
            Err(RadioError::new(8, format!("{} is not connected", link)))
        }
    }
}

#[async_trait]
impl RadioStack for SimulatedRadio {
    fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.inner.events.subscribe()
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        self.check(RadioCall::StartScan, None).await?;
        self.state().scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.state().scanning = false;
        self.state().calls.push(RadioCall::StopScan);
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        _auto_connect: bool,
    ) -> Result<LinkHandle, RadioError> {
        self.check(RadioCall::Connect(address.clone()), Some(LinkOperation::Connect))
            .await?;
        let mut state = self.state();
        state.next_handle += 1;
        let handle = LinkHandle(state.next_handle);
        state.links.insert(handle, address.clone());
        Ok(handle)
    }

    async fn discover_services(&self, link: LinkHandle) -> Result<(), RadioError> {
        self.check(
            RadioCall::DiscoverServices(link),
            Some(LinkOperation::DiscoverServices),
        )
        .await?;
        self.require_link(link)
    }

    async fn request_mtu(&self, link: LinkHandle, mtu: u16) -> Result<u16, RadioError> {
        self.check(RadioCall::RequestMtu(link, mtu), Some(LinkOperation::RequestMtu))
            .await?;
        self.require_link(link)?;
        Ok(mtu.min(self.state().max_mtu))
    }

    async fn write(&self, link: LinkHandle, payload: &[u8]) -> Result<(), RadioError> {
        self.check(RadioCall::Write(link, payload.to_vec()), Some(LinkOperation::Write))
            .await?;
        self.require_link(link)
    }

    async fn read(&self, link: LinkHandle) -> Result<Vec<u8>, RadioError> {
        self.check(RadioCall::Read(link), Some(LinkOperation::Read))
            .await?;
        self.require_link(link)?;
        Ok(Vec::new())
    }

    async fn disconnect(&self, link: LinkHandle) -> Result<(), RadioError> {
        let mut state = self.state();
        state.calls.push(RadioCall::Disconnect(link));
        if state.links.remove(&link).is_some() {
            Ok(())
        } else {
            Err(RadioError::new(8, format!("{} is not connected", link)))
        }
    }

    async fn close(&self, link: LinkHandle) {
        let mut state = self.state();
        state.calls.push(RadioCall::Close(link));
        state.links.remove(&link);
    }

    async fn bond_state(&self, address: &DeviceAddress) -> BondState {
        self.state()
            .bonds
            .get(address)
            .copied()
            .unwrap_or(BondState::None)
    }

    async fn create_bond(&self, address: &DeviceAddress) -> Result<(), RadioError> {
        self.check(RadioCall::CreateBond(address.clone()), None).await?;
        let script = {
            let mut state = self.state();
            state.bond_requests += 1;
            state.bonds.insert(address.clone(), BondState::Bonding);
            state.bond_scripts.pop_front().unwrap_or(BondScript::Succeed)
        };
        self.emit(RadioEvent::BondStateChanged {
            address: address.clone(),
            previous: BondState::None,
            current: BondState::Bonding,
            reason: None,
        });

        if script == BondScript::Ignore {
            return Ok(());
        }
        let radio = self.clone();
        let address = address.clone();
        let latency = self.inner.bond_latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let (current, reason) = match script {
                BondScript::Fail(reason) => (BondState::None, Some(reason)),
                _ => (BondState::Bonded, None),
            };
            radio.set_bond_state(&address, current);
            radio.emit(RadioEvent::BondStateChanged {
                address,
                previous: BondState::Bonding,
                current,
                reason,
            });
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Simulated Executor
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ExecutorState {
    requests: Vec<DeviceRequest>,
    outcomes: VecDeque<CommandOutcome>,
    latency: Duration,
}

/// Records requests and answers from a script; unscripted requests succeed
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<DeviceRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn script_outcomes(&self, outcomes: impl IntoIterator<Item = CommandOutcome>) {
        lock(&self.state).outcomes.extend(outcomes);
    }

    /// Time each request takes before answering
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }
}

#[async_trait]
impl CommandExecutor for SimulatedExecutor {
    async fn execute(&self, request: DeviceRequest) -> CommandOutcome {
        let (latency, outcome) = {
            let mut state = lock(&self.state);
            state.requests.push(request);
            let outcome = state
                .outcomes
                .pop_front()
                .unwrap_or(CommandOutcome::Success(Vec::new()));
            (state.latency, outcome)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome
    }
}
