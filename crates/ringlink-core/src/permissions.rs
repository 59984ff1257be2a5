//! Access-grant preconditions per operation and platform version
//!
//! The gate never requests anything itself. It answers "which grants are missing
//! for this operation on this platform" so that no radio call is attempted while a
//! grant is absent, and each missing grant carries its own remediation text.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PermissionConfig;
use crate::error::RingLinkError;

// ----------------------------------------------------------------------------
// Grants and Operations
// ----------------------------------------------------------------------------

/// Operation that may need access grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Scan,
    Connect,
    /// Showing the persistent status surface
    Notify,
}

/// A runtime access grant held by the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grant {
    /// Discover nearby radio devices (newer platforms)
    RadioScan,
    /// Connect to paired radio devices (newer platforms)
    RadioConnect,
    /// Precise location, required for scanning on older platforms
    Location,
    /// Post notifications, required for the status surface on the newest platforms
    Notifications,
}

impl Grant {
    /// Human-readable remediation for this specific grant
    pub fn remediation(&self) -> &'static str {
        match self {
            Grant::RadioScan => {
                "Nearby devices permission is required to scan for your ring. Allow \"Nearby devices\" in app settings."
            }
            Grant::RadioConnect => {
                "Bluetooth connect permission is required to connect to your ring. Allow \"Nearby devices\" connections in app settings."
            }
            Grant::Location => {
                "Location permission is required to scan for Bluetooth devices on this OS version. Allow precise location in app settings."
            }
            Grant::Notifications => {
                "Notification permission is required to show the ring status. Allow notifications in app settings."
            }
        }
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Grant::RadioScan => "radio-scan",
            Grant::RadioConnect => "radio-connect",
            Grant::Location => "location",
            Grant::Notifications => "notifications",
        };
        f.write_str(name)
    }
}

/// Grants currently held by the application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSet(BTreeSet<Grant>);

impl GrantSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        [
            Grant::RadioScan,
            Grant::RadioConnect,
            Grant::Location,
            Grant::Notifications,
        ]
        .into_iter()
        .collect()
    }

    pub fn contains(&self, grant: Grant) -> bool {
        self.0.contains(&grant)
    }

    pub fn insert(&mut self, grant: Grant) {
        self.0.insert(grant);
    }

    pub fn remove(&mut self, grant: Grant) {
        self.0.remove(&grant);
    }

    pub fn without(mut self, grant: Grant) -> Self {
        self.remove(grant);
        self
    }
}

impl FromIterator<Grant> for GrantSet {
    fn from_iter<I: IntoIterator<Item = Grant>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Host platform API level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatformVersion(pub u32);

// ----------------------------------------------------------------------------
// Permission Gate
// ----------------------------------------------------------------------------

/// Computes missing grants for an operation on the current platform
#[derive(Debug, Clone)]
pub struct PermissionGate {
    config: PermissionConfig,
    platform: PlatformVersion,
}

impl PermissionGate {
    pub fn new(config: PermissionConfig, platform: PlatformVersion) -> Self {
        Self { config, platform }
    }

    pub fn platform(&self) -> PlatformVersion {
        self.platform
    }

    /// Grants the operation needs on this platform
    pub fn required(&self, operation: Operation) -> Vec<Grant> {
        let split_radio = self.platform.0 >= self.config.split_radio_grants_since;
        match operation {
            Operation::Scan if split_radio => vec![Grant::RadioScan],
            Operation::Scan => vec![Grant::Location],
            Operation::Connect if split_radio => vec![Grant::RadioConnect],
            // Install-time permissions cover connecting on older platforms
            Operation::Connect => Vec::new(),
            Operation::Notify if self.platform.0 >= self.config.notification_grant_since => {
                vec![Grant::Notifications]
            }
            Operation::Notify => Vec::new(),
        }
    }

    /// Required grants not present in `granted`
    pub fn missing(&self, operation: Operation, granted: &GrantSet) -> Vec<Grant> {
        self.required(operation)
            .into_iter()
            .filter(|g| !granted.contains(*g))
            .collect()
    }

    /// Precondition check before any radio call
    pub fn check(&self, operation: Operation, granted: &GrantSet) -> Result<(), RingLinkError> {
        let missing = self.missing(operation, granted);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RingLinkError::PermissionDenied { missing })
        }
    }
}
