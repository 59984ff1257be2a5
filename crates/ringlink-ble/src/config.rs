//! BLE radio configuration

use std::time::Duration;

use uuid::Uuid;

use crate::protocol::{
    RING_NOTIFY_CHARACTERISTIC_UUID, RING_SERVICE_UUID, RING_WRITE_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the btleplug radio stack
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleRadioConfig {
    /// Index into the host's adapter list
    pub adapter_index: usize,
    /// Vendor service carrying the command characteristics
    pub service_uuid: Uuid,
    /// Characteristic commands are written to
    pub write_characteristic: Uuid,
    /// Characteristic responses are notified on
    pub notify_characteristic: Uuid,
    /// Only report advertisements that list the vendor service
    pub filter_by_service: bool,
    /// Transfer size reported after setup; the host stack negotiates the real one
    pub assumed_mtu: u16,
    /// How long a command waits for its response frame
    pub response_timeout: Duration,
}

impl Default for BleRadioConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            service_uuid: RING_SERVICE_UUID,
            write_characteristic: RING_WRITE_CHARACTERISTIC_UUID,
            notify_characteristic: RING_NOTIFY_CHARACTERISTIC_UUID,
            filter_by_service: false,
            assumed_mtu: 247,
            response_timeout: Duration::from_secs(3),
        }
    }
}

impl BleRadioConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Restrict scans to rings advertising the vendor service
    pub fn with_service_filter(mut self, enabled: bool) -> Self {
        self.filter_by_service = enabled;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}
