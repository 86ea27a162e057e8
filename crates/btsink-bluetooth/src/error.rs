//! Error types for the BlueZ bridge.

use btsink_core::RegistryError;
use thiserror::Error;

/// Bluetooth-specific error types.
#[derive(Error, Debug)]
pub enum BluetoothError {
    /// Bluetooth adapter not found.
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Device not found.
    #[error("Bluetooth device not found: {0}")]
    DeviceNotFound(String),

    /// Address could not be parsed as a hardware address.
    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    /// BlueZ refused the pairing agent.
    #[error("Agent registration failed: {0}")]
    AgentRegistration(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// BlueZ D-Bus error.
    #[error("BlueZ error: {0}")]
    BlueZ(String),

    /// Registry update failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Convenience Result type for Bluetooth operations.
pub type Result<T> = std::result::Result<T, BluetoothError>;
