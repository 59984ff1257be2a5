//! Error types for the btleplug radio stack

use ringlink_core::RadioError;
use thiserror::Error;

use crate::protocol::{
    STATUS_BAD_FRAME, STATUS_GATT_ERROR, STATUS_NOT_CONNECTED, STATUS_NOT_FOUND,
    STATUS_NO_CHARACTERISTIC, STATUS_PERMISSION_DENIED, STATUS_REJECTED, STATUS_TIMEOUT,
};

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the btleplug radio stack
#[derive(Error, Debug)]
pub enum BleRadioError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Ring not found: {address}")]
    DeviceNotFound { address: String },

    #[error("{link} is not open")]
    UnknownLink { link: String },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("Command {name} has no opcode")]
    EmptyCommand { name: String },

    #[error("Ring rejected opcode {opcode:#04x}")]
    Rejected { opcode: u8 },

    #[error("Notification stream ended")]
    NotificationStreamEnded,

    #[error("Timed out waiting for response")]
    ResponseTimeout,

    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),
}

impl BleRadioError {
    /// Status code surfaced to the engine
    pub fn status(&self) -> i32 {
        match self {
            BleRadioError::AdapterNotAvailable => STATUS_NOT_FOUND,
            BleRadioError::DeviceNotFound { .. } => STATUS_NOT_FOUND,
            BleRadioError::UnknownLink { .. } => STATUS_NOT_CONNECTED,
            BleRadioError::CharacteristicNotFound { .. } => STATUS_NO_CHARACTERISTIC,
            BleRadioError::PayloadTooLarge { .. } | BleRadioError::EmptyCommand { .. } => {
                STATUS_BAD_FRAME
            }
            BleRadioError::Rejected { .. } => STATUS_REJECTED,
            BleRadioError::NotificationStreamEnded => STATUS_NOT_CONNECTED,
            BleRadioError::ResponseTimeout => STATUS_TIMEOUT,
            BleRadioError::Btleplug(e) => match e {
                btleplug::Error::PermissionDenied => STATUS_PERMISSION_DENIED,
                btleplug::Error::DeviceNotFound => STATUS_NOT_FOUND,
                btleplug::Error::NotConnected => STATUS_NOT_CONNECTED,
                btleplug::Error::TimedOut(_) => STATUS_TIMEOUT,
                btleplug::Error::NoSuchCharacteristic => STATUS_NO_CHARACTERISTIC,
                _ => STATUS_GATT_ERROR,
            },
        }
    }
}

impl From<BleRadioError> for RadioError {
    fn from(err: BleRadioError) -> Self {
        RadioError::new(err.status(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_error_keeps_status() {
        let err: RadioError = BleRadioError::DeviceNotFound {
            address: "AA:BB:CC:DD:EE:01".into(),
        }
        .into();
        assert_eq!(err.status, STATUS_NOT_FOUND);
        assert!(err.message.contains("AA:BB:CC:DD:EE:01"));

        let err: RadioError = BleRadioError::Btleplug(btleplug::Error::NotConnected).into();
        assert_eq!(err.status, STATUS_NOT_CONNECTED);
    }
}
