//! Error handling for the RingLink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Engine error: {0}")]
    Engine(#[from] ringlink_core::RingLinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device store error: {0}")]
    Storage(#[from] ringlink_core::StorageError),

    #[error("Radio initialization failed: {0}")]
    RadioInit(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("No remembered ring; connect to one first")]
    NoRememberedRing,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<ringlink_core::ConfigError> for CliError {
    fn from(err: ringlink_core::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}

#[cfg(feature = "ble")]
impl From<ringlink_ble::BleRadioError> for CliError {
    fn from(err: ringlink_ble::BleRadioError) -> Self {
        CliError::RadioInit(err.to_string())
    }
}
