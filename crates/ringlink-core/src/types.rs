//! Core identifiers shared by every component

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::RingLinkError;

// ----------------------------------------------------------------------------
// Device Address
// ----------------------------------------------------------------------------

/// Radio address of a peripheral, normalized to upper case
///
/// The address is the unique key for a ring: scan results, bond-state events
/// and the persisted record are all matched on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse an address, rejecting blank input
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_ascii_uppercase()))
    }

    /// Address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

/// The ring the engine is asked to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

impl Peripheral {
    pub fn new(address: DeviceAddress, name: Option<String>) -> Self {
        let name = name.filter(|n| !n.trim().is_empty());
        Self { address, name }
    }

    /// Build a peripheral from raw strings
    pub fn parse(address: &str, name: Option<&str>) -> Result<Self, RingLinkError> {
        let address = DeviceAddress::parse(address).ok_or(RingLinkError::InvalidAddress)?;
        Ok(Self::new(address, name.map(str::to_string)))
    }

    /// Name for display, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.address.as_str())
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
