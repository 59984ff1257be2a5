//! Bonding workflow
//!
//! At most one pairing runs at a time. A pairing drives the platform bond state to
//! BONDED, watching bond-state events for its own address only. A failed attempt
//! (BONDING -> NONE, or the bond timeout) is retried once after a fixed delay;
//! the second failure is final.
//!
//! Outcomes are delivered through [`PairingCallback`] from the pairing task. The
//! callback sequence for one pairing is always one of:
//! - `[success]`
//! - `[retry(2), success]`
//! - `[failed(reason)]`, `[retry(2), failed(reason)]`

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::PairingConfig;
use crate::error::PairingError;
use crate::radio::{BondState, RadioEvent, RadioStack};
use crate::types::{DeviceAddress, Peripheral};

// ----------------------------------------------------------------------------
// Callbacks
// ----------------------------------------------------------------------------

/// Receives the progress of one pairing
pub trait PairingCallback: Send + Sync {
    /// A retry is about to start; `attempt` is 1-indexed
    fn on_pairing_retry(&self, _attempt: u32) {}

    fn on_pairing_success(&self);

    fn on_pairing_failed(&self, reason: String);
}

/// Pairing progress as a value, for channel-based consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    Retry(u32),
    Success,
    Failed(String),
}

impl PairingCallback for mpsc::UnboundedSender<PairingEvent> {
    fn on_pairing_retry(&self, attempt: u32) {
        let _ = self.send(PairingEvent::Retry(attempt));
    }

    fn on_pairing_success(&self) {
        let _ = self.send(PairingEvent::Success);
    }

    fn on_pairing_failed(&self, reason: String) {
        let _ = self.send(PairingEvent::Failed(reason));
    }
}

/// How a pairing request was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStart {
    /// Already bonded; success was reported without touching the radio
    AlreadyBonded,
    /// Bonding started in the background
    Started,
}

// ----------------------------------------------------------------------------
// Pairing Workflow
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct InFlight {
    address: DeviceAddress,
    id: u64,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct Slot {
    next_id: u64,
    current: Option<InFlight>,
}

enum AttemptOutcome {
    Bonded,
    Failed(String),
    Cancelled,
}

/// Serialized bonding driver; clones share the in-flight slot
#[derive(Clone)]
pub struct PairingWorkflow {
    radio: Arc<dyn RadioStack>,
    config: PairingConfig,
    slot: Arc<Mutex<Slot>>,
}

impl PairingWorkflow {
    pub fn new(radio: Arc<dyn RadioStack>, config: PairingConfig) -> Self {
        Self {
            radio,
            config,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a pairing is in flight
    pub fn is_in_progress(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Address of the in-flight pairing
    pub fn target(&self) -> Option<DeviceAddress> {
        self.lock().current.as_ref().map(|f| f.address.clone())
    }

    /// Begin pairing with `peripheral`
    ///
    /// Rejects with [`PairingError::AlreadyInProgress`] while another pairing runs.
    pub async fn start_pairing(
        &self,
        peripheral: &Peripheral,
        callback: Arc<dyn PairingCallback>,
    ) -> Result<PairingStart, PairingError> {
        let address = peripheral.address.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = {
            let mut slot = self.lock();
            if slot.current.is_some() {
                return Err(PairingError::AlreadyInProgress);
            }
            slot.next_id += 1;
            let id = slot.next_id;
            slot.current = Some(InFlight {
                address: address.clone(),
                id,
                cancel: Some(cancel_tx),
            });
            id
        };

        if self.radio.bond_state(&address).await == BondState::Bonded {
            debug!("{} already bonded", address);
            self.release(id);
            callback.on_pairing_success();
            return Ok(PairingStart::AlreadyBonded);
        }

        info!("Starting pairing with {}", peripheral);
        let task = PairingTask {
            workflow: self.clone(),
            address,
            id,
            callback,
        };
        tokio::spawn(task.run(cancel_rx));
        Ok(PairingStart::Started)
    }

    /// Cancel the in-flight pairing; it reports failure with reason "cancelled"
    pub fn cancel(&self) -> bool {
        let taken = self.lock().current.take();
        match taken {
            Some(mut in_flight) => {
                debug!("Cancelling pairing with {}", in_flight.address);
                if let Some(cancel) = in_flight.cancel.take() {
                    let _ = cancel.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Free the slot if it still belongs to pairing `id`
    fn release(&self, id: u64) {
        let mut slot = self.lock();
        if slot.current.as_ref().map(|f| f.id) == Some(id) {
            slot.current = None;
        }
    }
}

impl std::fmt::Debug for PairingWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingWorkflow")
            .field("config", &self.config)
            .field("target", &self.target())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Pairing Task
// ----------------------------------------------------------------------------

struct PairingTask {
    workflow: PairingWorkflow,
    address: DeviceAddress,
    id: u64,
    callback: Arc<dyn PairingCallback>,
}

impl PairingTask {
    async fn run(self, mut cancel_rx: oneshot::Receiver<()>) {
        // Subscribe before bonding starts so no state change is missed
        let mut events = self.workflow.radio.subscribe();
        let max_attempts = self.workflow.config.max_attempts.max(1);
        let mut reason = String::from("bonding failed");

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.callback.on_pairing_retry(attempt);
                tokio::select! {
                    _ = &mut cancel_rx => return self.finish_cancelled(),
                    _ = tokio::time::sleep(self.workflow.config.retry_delay) => {}
                }
            }

            match self.attempt(&mut events, &mut cancel_rx).await {
                AttemptOutcome::Bonded => {
                    info!("Bonded with {} on attempt {}", self.address, attempt);
                    self.workflow.release(self.id);
                    self.callback.on_pairing_success();
                    return;
                }
                AttemptOutcome::Failed(r) => {
                    warn!("Pairing attempt {} with {} failed: {}", attempt, self.address, r);
                    reason = r;
                }
                AttemptOutcome::Cancelled => return self.finish_cancelled(),
            }
        }

        self.workflow.release(self.id);
        self.callback.on_pairing_failed(reason);
    }

    async fn attempt(
        &self,
        events: &mut broadcast::Receiver<RadioEvent>,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> AttemptOutcome {
        if let Err(e) = self.workflow.radio.create_bond(&self.address).await {
            return AttemptOutcome::Failed(e.to_string());
        }

        let deadline = tokio::time::sleep(self.workflow.config.bond_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut *cancel_rx => return AttemptOutcome::Cancelled,
                _ = &mut deadline => {
                    return AttemptOutcome::Failed(format!(
                        "bonding timed out after {:?}",
                        self.workflow.config.bond_timeout
                    ));
                }
                event = events.recv() => match event {
                    Ok(RadioEvent::BondStateChanged { address, previous, current, reason })
                        if address == self.address =>
                    {
                        debug!("Bond state {:?} -> {:?} for {}", previous, current, address);
                        match (previous, current) {
                            (_, BondState::Bonded) => return AttemptOutcome::Bonded,
                            (BondState::Bonding, BondState::None) => {
                                return AttemptOutcome::Failed(
                                    reason.unwrap_or_else(|| "bond state returned to NONE".to_string()),
                                );
                            }
                            _ => {}
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Pairing missed {} radio events", skipped);
                        if self.workflow.radio.bond_state(&self.address).await == BondState::Bonded {
                            return AttemptOutcome::Bonded;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return AttemptOutcome::Failed("radio event stream closed".to_string());
                    }
                },
            }
        }
    }

    fn finish_cancelled(&self) {
        self.workflow.release(self.id);
        self.callback.on_pairing_failed("cancelled".to_string());
    }
}
