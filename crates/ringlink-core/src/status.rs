//! Persistent status surface
//!
//! The presenter keeps a view of (state, device name, battery, reconnect attempt)
//! and renders a [`StatusNotification`] only when an incoming event changes that
//! view. There is no periodic refresh. The surface itself is a trait so hosts can
//! map it to whatever persistent indicator they have.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::manager::RingLinkHandle;
use crate::state::{ConnectionState, StateChange};
use crate::types::DeviceAddress;

pub const STATUS_TITLE: &str = "RingLink";
pub const TEXT_DISCONNECTED: &str = "Ring disconnected";
pub const TEXT_ERROR: &str = "Ring connection error";

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

/// The one user action the surface offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusAction {
    Locate,
}

/// Rendered content of the status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub title: String,
    pub text: String,
    /// Not dismissable while true
    pub ongoing: bool,
    pub action: Option<StatusAction>,
}

/// Non-transition events the presenter reacts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    DeviceLinked {
        address: DeviceAddress,
        name: Option<String>,
    },
    Battery(Option<u8>),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
}

/// Host-provided persistent indicator
pub trait StatusSurface: Send {
    fn show(&mut self, notification: &StatusNotification);

    fn clear(&mut self);
}

// ----------------------------------------------------------------------------
// Presenter
// ----------------------------------------------------------------------------

/// Event-driven renderer for the status surface
#[derive(Debug, Clone)]
pub struct StatusPresenter {
    state: ConnectionState,
    device_name: Option<String>,
    battery: Option<u8>,
    attempt: u32,
    last: Option<StatusNotification>,
}

impl Default for StatusPresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPresenter {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            device_name: None,
            battery: None,
            attempt: 1,
            last: None,
        }
    }

    /// Apply a state transition; returns the new rendering if it changed
    pub fn on_state_change(&mut self, change: StateChange) -> Option<StatusNotification> {
        if change.new == ConnectionState::Reconnecting && change.old != ConnectionState::Reconnecting {
            self.attempt = 1;
        }
        if change.new != ConnectionState::Connected {
            // Battery readings are only meaningful for the live link
            self.battery = None;
        }
        self.state = change.new;
        self.refresh()
    }

    /// Apply a status event; returns the new rendering if it changed
    pub fn on_event(&mut self, event: StatusEvent) -> Option<StatusNotification> {
        match event {
            StatusEvent::DeviceLinked { address, name } => {
                self.device_name = Some(name.unwrap_or_else(|| address.to_string()));
            }
            StatusEvent::Battery(level) => self.battery = level.map(|l| l.min(100)),
            StatusEvent::ReconnectScheduled { attempt, .. } => self.attempt = attempt.max(1),
        }
        self.refresh()
    }

    /// Current rendering
    pub fn render(&self) -> StatusNotification {
        let text = match self.state {
            ConnectionState::Connected => {
                let name = self.device_name.as_deref().unwrap_or("Ring");
                match self.battery {
                    Some(level) => format!("{} connected · {}%", name, level),
                    None => format!("{} connected", name),
                }
            }
            ConnectionState::Reconnecting => format!("Reconnecting (attempt {})", self.attempt),
            ConnectionState::Error => TEXT_ERROR.to_string(),
            _ => TEXT_DISCONNECTED.to_string(),
        };
        let action = (self.state == ConnectionState::Connected).then_some(StatusAction::Locate);
        StatusNotification {
            title: STATUS_TITLE.to_string(),
            text,
            ongoing: self.state != ConnectionState::Idle,
            action,
        }
    }

    fn refresh(&mut self) -> Option<StatusNotification> {
        let next = self.render();
        if self.last.as_ref() == Some(&next) {
            return None;
        }
        self.last = Some(next.clone());
        Some(next)
    }

    /// Drive `surface` from the engine until it stops
    ///
    /// Actions arriving on `actions` are routed to [`RingLinkHandle::locate_device`].
    pub async fn run(
        mut self,
        handle: RingLinkHandle,
        mut surface: Box<dyn StatusSurface>,
        mut actions: mpsc::Receiver<StatusAction>,
    ) {
        let mut states = handle.subscribe_states();
        let mut events = handle.subscribe_status();
        self.sync(&handle);

        loop {
            let rendered = tokio::select! {
                change = states.recv() => match change {
                    Ok(change) => self.on_state_change(change),
                    Err(broadcast::error::RecvError::Lagged(_)) => self.sync(&handle),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => self.sync(&handle),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                action = actions.recv() => {
                    if let Some(StatusAction::Locate) = action {
                        if let Err(e) = handle.locate_device().await {
                            warn!("Locate from status surface failed: {}", e);
                        }
                    }
                    None
                }
            };

            if let Some(notification) = rendered {
                if handle.snapshot().status_allowed {
                    surface.show(&notification);
                } else {
                    debug!("Notification grant missing; status not shown");
                }
            }
        }
        surface.clear();
    }

    /// Rebuild the view from the engine snapshot
    fn sync(&mut self, handle: &RingLinkHandle) -> Option<StatusNotification> {
        let snapshot = handle.snapshot();
        self.state = snapshot.state;
        self.battery = snapshot.battery;
        self.attempt = snapshot.reconnect_attempt.saturating_add(1);
        if let Some(device) = snapshot.device {
            self.device_name = Some(device.display_name().to_string());
        }
        self.refresh()
    }
}
