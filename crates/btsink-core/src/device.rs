//! Bluetooth device identity and state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bluetooth device address.
///
/// Addresses are opaque strings; they are trimmed and upper-cased so that
/// `aa:bb:cc:dd:ee:ff` and `AA:BB:CC:DD:EE:FF` name the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Create from a MAC address string (e.g., "00:11:22:33:44:55").
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self(addr.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Address {
    fn from(addr: String) -> Self {
        Self::new(addr)
    }
}

impl From<&str> for Address {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// A remote device known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Unique key.
    pub address: Address,
    /// Display name reported by the device (may be empty until resolved).
    pub name: String,
    /// Whether the device may reconnect without re-confirmation.
    pub trusted: bool,
    /// Whether the device completed pairing at least once.
    pub paired: bool,
    /// Live connection state, never persisted.
    pub connected: bool,
    /// Last time any event touched this device.
    pub last_seen: DateTime<Utc>,
    /// Consecutive automatic reconnect attempts since the last connection.
    pub reconnect_attempts: u32,
}

impl Device {
    /// Create a fresh, untrusted, disconnected record.
    pub fn new(address: Address, now: DateTime<Utc>) -> Self {
        Self {
            address,
            name: String::new(),
            trusted: false,
            paired: false,
            connected: false,
            last_seen: now,
            reconnect_attempts: 0,
        }
    }

    /// Get display name (name if known, otherwise the address).
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.address.as_str()
        } else {
            &self.name
        }
    }
}
