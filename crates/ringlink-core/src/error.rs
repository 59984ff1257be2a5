//! Error types for the connection engine
//!
//! Failures that are a consequence of an operation (pairing, link setup, a grant
//! revoked mid-session) surface as an [`ErrorRecord`] on the error stream and,
//! where the transition table allows it, as the ERROR state. Invalid requests are
//! rejected synchronously with a [`RingLinkError`] and leave state untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permissions::Grant;
use crate::state::ConnectionState;

// ----------------------------------------------------------------------------
// Error Codes
// ----------------------------------------------------------------------------

/// Stable error codes carried by [`ErrorRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    PermissionDenied,
    PermissionRevoked,
    BluetoothDisabled,
    BluetoothUnavailable,
    PairingFailed,
    GattError,
    ReconnectFailed,
    NotConnected,
    AlreadyInProgress,
    UnknownCommand,
    CommandTimeout,
    CommandFailed,
    InvalidTransition,
    InvalidAddress,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::PermissionRevoked => "PERMISSION_REVOKED",
            ErrorCode::BluetoothDisabled => "BLUETOOTH_DISABLED",
            ErrorCode::BluetoothUnavailable => "BLUETOOTH_UNAVAILABLE",
            ErrorCode::PairingFailed => "PAIRING_FAILED",
            ErrorCode::GattError => "GATT_ERROR",
            ErrorCode::ReconnectFailed => "RECONNECT_FAILED",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::CommandTimeout => "COMMAND_TIMEOUT",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::InvalidAddress => "INVALID_ADDRESS",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Error Record
// ----------------------------------------------------------------------------

/// Structured error held while the engine is in ERROR and published on the error stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.as_str(), message)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ----------------------------------------------------------------------------
// Component Errors
// ----------------------------------------------------------------------------

/// Failure reported by the platform radio stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status {status})")]
pub struct RadioError {
    /// Platform status code, e.g. 133 for a generic link failure
    pub status: i32,
    pub message: String,
}

impl RadioError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Link setup stage, named the way the radio stack names the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkOperation {
    Connect,
    DiscoverServices,
    RequestMtu,
    Write,
    Read,
}

impl fmt::Display for LinkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkOperation::Connect => "connect",
            LinkOperation::DiscoverServices => "discoverServices",
            LinkOperation::RequestMtu => "requestMtu",
            LinkOperation::Write => "write",
            LinkOperation::Read => "read",
        };
        f.write_str(name)
    }
}

/// Errors from [`crate::link::LinkManager`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("{operation} failed: no peripheral given")]
    NoPeripheral { operation: LinkOperation },

    #[error("{operation} failed: status {status}")]
    OperationFailed { operation: LinkOperation, status: i32 },

    #[error("{operation} timed out")]
    Timeout { operation: LinkOperation },

    #[error("link not ready: service discovery has not completed")]
    NotReady,

    #[error("payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },
}

impl LinkError {
    /// The stage that failed
    pub fn operation(&self) -> Option<LinkOperation> {
        match self {
            LinkError::NoPeripheral { operation }
            | LinkError::OperationFailed { operation, .. }
            | LinkError::Timeout { operation } => Some(*operation),
            _ => None,
        }
    }
}

/// Errors from [`crate::pairing::PairingWorkflow`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("pairing already in progress")]
    AlreadyInProgress,

    #[error("pairing failed: {reason}")]
    Failed { reason: String },
}

/// Rejections for device commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("not connected")]
    NotConnected,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command engine stopped")]
    EngineStopped,
}

/// Errors from a key-value storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage not available")]
    Unavailable,

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Top-level Error
// ----------------------------------------------------------------------------

/// Errors returned to callers of the engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RingLinkError {
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("{}", describe_missing(.missing))]
    PermissionDenied { missing: Vec<Grant> },

    #[error("Bluetooth is turned off")]
    RadioDisabled,

    #[error("Bluetooth is not available: {0}")]
    RadioUnavailable(String),

    #[error("invalid device address")]
    InvalidAddress,

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection engine has stopped")]
    EngineStopped,
}

impl RingLinkError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RingLinkError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            RingLinkError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            RingLinkError::RadioDisabled => ErrorCode::BluetoothDisabled,
            RingLinkError::RadioUnavailable(_) => ErrorCode::BluetoothUnavailable,
            RingLinkError::InvalidAddress => ErrorCode::InvalidAddress,
            RingLinkError::Pairing(PairingError::AlreadyInProgress) => ErrorCode::AlreadyInProgress,
            RingLinkError::Pairing(PairingError::Failed { .. }) => ErrorCode::PairingFailed,
            RingLinkError::Link(_) => ErrorCode::GattError,
            RingLinkError::Command(CommandError::NotConnected) => ErrorCode::NotConnected,
            RingLinkError::Command(CommandError::UnknownCommand(_)) => ErrorCode::UnknownCommand,
            RingLinkError::Command(CommandError::EngineStopped) | RingLinkError::EngineStopped => {
                ErrorCode::Internal
            }
            RingLinkError::Config(_) => ErrorCode::Internal,
        }
    }

    /// Structured form for the error stream
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord::from_code(self.code(), self.to_string())
    }
}

fn describe_missing(missing: &[Grant]) -> String {
    missing
        .iter()
        .map(|g| g.remediation())
        .collect::<Vec<_>>()
        .join("; ")
}
