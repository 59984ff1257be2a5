//! Radio stack seam
//!
//! The engine never talks to a Bluetooth stack directly. Everything it needs from
//! the platform is behind [`RadioStack`]; asynchronous platform callbacks arrive as
//! [`RadioEvent`]s on a broadcast subscription.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::RadioError;
use crate::filter::Advertisement;
use crate::types::DeviceAddress;

/// Opaque handle to an open link, issued by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Bond state as owned by the platform radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Asynchronous notifications from the radio stack
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// One advertisement seen while scanning
    Advertisement(Advertisement),
    /// A link dropped without being asked to
    LinkLost { address: DeviceAddress, status: i32 },
    /// Bond state change scoped to one address
    BondStateChanged {
        address: DeviceAddress,
        previous: BondState,
        current: BondState,
        /// Platform-provided failure reason, if any
        reason: Option<String>,
    },
    /// Radio switched on or off at the platform level
    RadioStateChanged { enabled: bool },
}

/// Platform radio operations used by the engine
#[async_trait]
pub trait RadioStack: Send + Sync {
    /// Whether the radio is present and switched on
    fn is_enabled(&self) -> bool;

    /// New subscription to radio events
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    async fn start_scan(&self) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Open a link; resolves once the link is confirmed
    async fn connect(
        &self,
        address: &DeviceAddress,
        auto_connect: bool,
    ) -> Result<LinkHandle, RadioError>;

    async fn discover_services(&self, link: LinkHandle) -> Result<(), RadioError>;

    /// Negotiate the transfer size; returns the agreed MTU
    async fn request_mtu(&self, link: LinkHandle, mtu: u16) -> Result<u16, RadioError>;

    async fn write(&self, link: LinkHandle, payload: &[u8]) -> Result<(), RadioError>;

    async fn read(&self, link: LinkHandle) -> Result<Vec<u8>, RadioError>;

    /// Request link disconnect
    async fn disconnect(&self, link: LinkHandle) -> Result<(), RadioError>;

    /// Release link resources; must tolerate a handle that is already gone
    async fn close(&self, link: LinkHandle);

    async fn bond_state(&self, address: &DeviceAddress) -> BondState;

    /// Start bonding; progress is reported through [`RadioEvent::BondStateChanged`]
    async fn create_bond(&self, address: &DeviceAddress) -> Result<(), RadioError>;
}
