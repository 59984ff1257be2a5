//! Advertisement validation and deduplication
//!
//! Every advertisement passes the acceptance predicate first:
//! - no address: rejected
//! - RSSI below the configured floor: rejected
//! - empty or missing name: accepted (the name is a secondary criterion)
//! - otherwise the name must start with one of the compatibility prefixes
//!
//! Accepted advertisements update a table keyed by address. The consumer sees an
//! entry only on first sighting or after its RSSI moved by the emit delta since the
//! last emission; last-seen is refreshed on every sighting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ScanConfig;
use crate::types::DeviceAddress;

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

/// A single advertisement as reported by the radio stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: Option<String>,
    pub name: Option<String>,
    pub rssi: i16,
    pub raw: Vec<u8>,
}

/// A validated ring sighting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedPeripheral {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub last_seen_ms: u64,
    /// Raw advertisement bytes, debug mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_advertisement: Option<Vec<u8>>,
    /// Hex form of the raw bytes for transport, debug mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hex: Option<String>,
}

/// Why an advertisement was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingAddress,
    WeakSignal,
    IncompatibleName,
}

/// Outcome of feeding one advertisement through the filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Rejected(RejectReason),
    /// Known ring, entry refreshed, nothing to emit
    Refreshed,
    /// First sighting or significant RSSI change
    Emit(ScannedPeripheral),
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    peripheral: ScannedPeripheral,
    last_emitted_rssi: i16,
}

// ----------------------------------------------------------------------------
// Device Filter
// ----------------------------------------------------------------------------

/// Stateful scan-result filter
#[derive(Debug)]
pub struct DeviceFilter {
    config: ScanConfig,
    entries: HashMap<DeviceAddress, TrackedEntry>,
}

impl DeviceFilter {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Acceptance predicate, independent of the table
    pub fn accept(&self, adv: &Advertisement) -> Result<DeviceAddress, RejectReason> {
        let address = adv
            .address
            .as_deref()
            .and_then(DeviceAddress::parse)
            .ok_or(RejectReason::MissingAddress)?;

        if adv.rssi < self.config.min_rssi_dbm {
            return Err(RejectReason::WeakSignal);
        }

        match adv.name.as_deref().map(str::trim) {
            None | Some("") => Ok(address),
            Some(name) if self.matches_prefix(name) => Ok(address),
            Some(_) => Err(RejectReason::IncompatibleName),
        }
    }

    fn matches_prefix(&self, name: &str) -> bool {
        self.config
            .name_prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .any(|p| name.starts_with(p.as_str()))
    }

    /// Validate, record and decide whether to emit
    pub fn observe(&mut self, adv: &Advertisement, now_ms: u64) -> FilterVerdict {
        let address = match self.accept(adv) {
            Ok(address) => address,
            Err(reason) => {
                trace!("Dropped advertisement {:?}: {:?}", adv.address, reason);
                return FilterVerdict::Rejected(reason);
            }
        };

        let name = adv
            .name
            .as_ref()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let (raw_advertisement, raw_hex) = if self.config.debug_raw_advertisements {
            (Some(adv.raw.clone()), Some(hex::encode_upper(&adv.raw)))
        } else {
            (None, None)
        };

        match self.entries.get_mut(&address) {
            Some(entry) => {
                let peripheral = &mut entry.peripheral;
                // Keep a previously seen name when this packet omits it
                if name.is_some() {
                    peripheral.name = name;
                }
                peripheral.rssi = adv.rssi;
                peripheral.last_seen_ms = now_ms;
                peripheral.raw_advertisement = raw_advertisement;
                peripheral.raw_hex = raw_hex;

                let delta = (i32::from(adv.rssi) - i32::from(entry.last_emitted_rssi)).abs();
                if delta >= i32::from(self.config.rssi_emit_delta_dbm) {
                    entry.last_emitted_rssi = adv.rssi;
                    trace!("Re-emitting {} after RSSI change of {} dBm", address, delta);
                    FilterVerdict::Emit(peripheral.clone())
                } else {
                    FilterVerdict::Refreshed
                }
            }
            None => {
                let peripheral = ScannedPeripheral {
                    address: address.clone(),
                    name,
                    rssi: adv.rssi,
                    last_seen_ms: now_ms,
                    raw_advertisement,
                    raw_hex,
                };
                debug!("Discovered ring {} ({:?}, {} dBm)", address, peripheral.name, adv.rssi);
                self.entries.insert(
                    address,
                    TrackedEntry {
                        peripheral: peripheral.clone(),
                        last_emitted_rssi: adv.rssi,
                    },
                );
                FilterVerdict::Emit(peripheral)
            }
        }
    }

    /// Discard every tracked entry
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&ScannedPeripheral> {
        self.entries.get(address).map(|e| &e.peripheral)
    }

    /// Tracked rings, strongest signal first
    pub fn peripherals(&self) -> Vec<ScannedPeripheral> {
        let mut all: Vec<_> = self.entries.values().map(|e| e.peripheral.clone()).collect();
        all.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        all
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
