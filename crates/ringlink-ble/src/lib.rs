//! Bluetooth Low Energy radio stack for RingLink
//!
//! This crate backs the engine's [`RadioStack`](ringlink_core::RadioStack) and
//! [`CommandExecutor`](ringlink_core::CommandExecutor) seams with the host
//! Bluetooth adapter through `btleplug`.
//!
//! ## Architecture
//!
//! - [`config`] - Adapter selection, GATT layout and response timeout
//! - [`error`] - Error types and their mapping to engine status codes
//! - [`protocol`] - Ring UUIDs, status codes and 16-byte command framing
//! - [`radio`] - Scanning, links and adapter event translation
//! - [`executor`] - Request/response command exchanges over an open link
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringlink_ble::{BleRadioConfig, BtleplugExecutor, BtleplugRadio};
//! use ringlink_core::{GrantSet, MemoryStore, RingLinkConfig, RingLinkManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = Arc::new(BtleplugRadio::new(BleRadioConfig::new()).await?);
//! let handle = RingLinkManager::builder(RingLinkConfig::default())
//!     .radio(radio.clone())
//!     .executor(Arc::new(BtleplugExecutor::new(radio)))
//!     .store(Box::new(MemoryStore::new()))
//!     .grants(GrantSet::all())
//!     .spawn()?;
//!
//! handle.start_scan().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod radio;

pub use config::BleRadioConfig;
pub use error::BleRadioError;
pub use executor::BtleplugExecutor;
pub use protocol::{
    RING_NOTIFY_CHARACTERISTIC_UUID, RING_SERVICE_UUID, RING_WRITE_CHARACTERISTIC_UUID,
};
pub use radio::BtleplugRadio;
