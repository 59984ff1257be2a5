//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the connection engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingLinkConfig {
    pub scan: ScanConfig,
    pub link: LinkConfig,
    pub pairing: PairingConfig,
    pub reconnect: ReconnectConfig,
    pub commands: CommandConfig,
    pub permissions: PermissionConfig,
}

/// Scanning and advertisement filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan stops automatically after this long
    pub scan_timeout: Duration,
    /// Advertisements weaker than this are dropped
    pub min_rssi_dbm: i16,
    /// Re-emit a known ring only when RSSI moved at least this much
    pub rssi_emit_delta_dbm: i16,
    /// Accepted name prefixes; unnamed advertisements are always accepted
    pub name_prefixes: Vec<String>,
    /// Attach raw advertisement bytes to emitted sightings
    pub debug_raw_advertisements: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(30),
            min_rssi_dbm: -100,
            rssi_emit_delta_dbm: 5,
            name_prefixes: ["Q_Ring", "QRing", "R02", "R06", "R09"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            debug_raw_advertisements: false,
        }
    }
}

/// Link setup parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Per-stage timeout for connect, discovery and MTU negotiation
    pub connect_timeout: Duration,
    /// MTU requested after discovery
    pub preferred_mtu: u16,
    /// Let the radio stack connect opportunistically when the ring shows up
    pub auto_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            preferred_mtu: 247,
            auto_connect: true,
        }
    }
}

/// Bonding workflow parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub bond_timeout: Duration,
    pub retry_delay: Duration,
    /// Total bonding attempts, including the first
    pub max_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            bond_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            max_attempts: 2,
        }
    }
}

/// Auto-reconnect backoff schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Arm auto-reconnect after a successful connection
    pub enabled: bool,
    /// Base delay for attempts 1..=5
    pub short_base: Duration,
    /// Base delay for attempts 6..=10
    pub medium_base: Duration,
    /// Starting base for attempts 11 and up, doubled per attempt
    pub long_base: Duration,
    /// Cap on the base delay
    pub max_base: Duration,
    /// Symmetric jitter as a fraction of the base
    pub jitter_ratio: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            short_base: Duration::from_secs(10),
            medium_base: Duration::from_secs(30),
            long_base: Duration::from_secs(60),
            max_base: Duration::from_secs(300),
            jitter_ratio: 0.2,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(360),
        }
    }
}

/// Device command dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Coalescing window for non-urgent commands
    pub batch_window: Duration,
    pub max_batch_size: usize,
    /// Link counts as busy when a command went out within this interval
    pub idle_threshold: Duration,
    /// Command kinds that always skip batching
    pub bypass_batching: Vec<String>,
    /// Custom command names accepted besides `locate`
    pub custom_commands: Vec<String>,
    /// Upper bound on a single executor call
    pub command_timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(500),
            max_batch_size: 5,
            idle_threshold: Duration::from_secs(2),
            bypass_batching: vec!["locate".to_string()],
            custom_commands: Vec::new(),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Platform version thresholds for the permission gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// First version with separate scan and connect radio grants
    pub split_radio_grants_since: u32,
    /// First version that needs a grant to post notifications
    pub notification_grant_since: u32,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            split_radio_grants_since: 31,
            notification_grant_since: 33,
        }
    }
}

// ----------------------------------------------------------------------------
// Builders and Validation
// ----------------------------------------------------------------------------

impl RingLinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan.scan_timeout = timeout;
        self
    }

    /// Set accepted device name prefixes
    pub fn with_name_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.scan.name_prefixes = prefixes;
        self
    }

    /// Attach raw advertisement bytes to sightings
    pub fn with_debug_advertisements(mut self, enabled: bool) -> Self {
        self.scan.debug_raw_advertisements = enabled;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    /// Set bonding timeout
    pub fn with_bond_timeout(mut self, timeout: Duration) -> Self {
        self.pairing.bond_timeout = timeout;
        self
    }

    /// Set per-stage link timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.link.connect_timeout = timeout;
        self
    }

    /// Register additional command names
    pub fn with_custom_commands(mut self, names: Vec<String>) -> Self {
        self.commands.custom_commands = names;
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.name_prefixes.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "at least one device name prefix must be configured".to_string(),
            ));
        }
        if self.scan.rssi_emit_delta_dbm <= 0 {
            return Err(ConfigError::Validation(
                "RSSI emit delta must be positive".to_string(),
            ));
        }
        if self.scan.scan_timeout.is_zero()
            || self.link.connect_timeout.is_zero()
            || self.pairing.bond_timeout.is_zero()
            || self.commands.command_timeout.is_zero()
        {
            return Err(ConfigError::Validation(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.pairing.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "pairing needs at least one attempt".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(ConfigError::Validation(format!(
                "jitter ratio {} must be within [0, 1)",
                self.reconnect.jitter_ratio
            )));
        }
        if self.reconnect.min_delay > self.reconnect.max_delay {
            return Err(ConfigError::Validation(
                "reconnect min delay exceeds max delay".to_string(),
            ));
        }
        if self.commands.max_batch_size == 0 {
            return Err(ConfigError::Validation(
                "max batch size must be greater than 0".to_string(),
            ));
        }
        if self.link.preferred_mtu < 23 {
            return Err(ConfigError::Validation(format!(
                "preferred MTU {} is below the protocol minimum of 23",
                self.link.preferred_mtu
            )));
        }
        Ok(())
    }
}
