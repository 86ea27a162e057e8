//! Bluetooth adapter management.
//!
//! Provides the adapter setup a receiver needs: power, alias, and the
//! discoverable/pairable window.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{Adapter, Device, Session};
use btsink_core::Address;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{BluetoothError, Result};
use crate::manage::LinkControl;
use crate::reconnect::ReconnectTarget;

/// Timeout for outgoing connection attempts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Parse a registry address into a BlueZ address.
pub fn to_bluer_address(address: &Address) -> Result<bluer::Address> {
    address
        .as_str()
        .parse()
        .map_err(|_| BluetoothError::InvalidAddress(address.to_string()))
}

pub fn from_bluer_address(address: bluer::Address) -> Address {
    Address::new(address.to_string())
}

/// Wrapper around the Bluetooth adapter for simplified management.
#[derive(Clone)]
pub struct BluetoothAdapter {
    session: Session,
    adapter: Adapter,
}

impl BluetoothAdapter {
    /// Open a BlueZ session and select `name`, or the default adapter.
    pub async fn new(name: Option<&str>) -> Result<Self> {
        let session = Session::new().await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to create BlueZ session: {}", e))
        })?;

        let adapter = match name {
            Some(name) => session
                .adapter(name)
                .map_err(|_| BluetoothError::AdapterNotFound)?,
            None => session.default_adapter().await.map_err(|e| {
                if e.to_string().contains("No default adapter") {
                    BluetoothError::AdapterNotFound
                } else {
                    BluetoothError::BlueZ(format!("Failed to get adapter: {}", e))
                }
            })?,
        };

        info!("Using Bluetooth adapter: {}", adapter.name());
        Ok(Self { session, adapter })
    }

    /// Get the adapter name (e.g., "hci0").
    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    /// Get the adapter's Bluetooth address.
    pub async fn address(&self) -> Result<String> {
        let addr = self.adapter.address().await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to get adapter address: {}", e))
        })?;
        Ok(addr.to_string())
    }

    /// Power on, advertise `alias`, and accept pairing with no time limit.
    pub async fn prepare(&self, alias: &str) -> Result<()> {
        let powered = self.adapter.is_powered().await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to get power state: {}", e))
        })?;
        if !powered {
            self.adapter.set_powered(true).await.map_err(|e| {
                BluetoothError::BlueZ(format!("Failed to set power state: {}", e))
            })?;
            info!("Bluetooth adapter powered on");
        }

        self.adapter.set_alias(alias.to_string()).await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to set adapter alias: {}", e))
        })?;

        self.adapter.set_discoverable_timeout(0).await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to set discoverable timeout: {}", e))
        })?;
        self.set_discoverable(true).await?;

        self.adapter.set_pairable_timeout(0).await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to set pairable timeout: {}", e))
        })?;
        self.set_pairable(true).await?;

        info!("Adapter {} is discoverable as \"{}\"", self.name(), alias);
        Ok(())
    }

    /// Stop advertising. The adapter stays powered for connected devices.
    pub async fn release(&self) -> Result<()> {
        self.set_discoverable(false).await?;
        self.set_pairable(false).await?;
        info!("Adapter {} is no longer discoverable", self.name());
        Ok(())
    }

    /// Set whether the adapter is discoverable by other devices.
    pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        self.adapter.set_discoverable(discoverable).await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to set discoverable state: {}", e))
        })?;
        debug!("Discoverable: {}", discoverable);
        Ok(())
    }

    /// Set whether the adapter accepts pairing requests.
    pub async fn set_pairable(&self, pairable: bool) -> Result<()> {
        self.adapter.set_pairable(pairable).await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to set pairable state: {}", e))
        })?;
        debug!("Pairable: {}", pairable);
        Ok(())
    }

    /// Get a bluer Device from an address.
    pub fn device(&self, address: &Address) -> Result<Device> {
        self.adapter
            .device(to_bluer_address(address)?)
            .map_err(|e| BluetoothError::DeviceNotFound(format!("{}: {}", address, e)))
    }

    /// Get a reference to the underlying bluer session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get a reference to the underlying bluer adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

#[async_trait]
impl ReconnectTarget for BluetoothAdapter {
    async fn connect(&self, address: &Address) -> Result<()> {
        let device = self.device(address)?;
        if device.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        match timeout(CONNECT_TIMEOUT, device.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BluetoothError::ConnectionFailed(e.to_string())),
            Err(_) => Err(BluetoothError::ConnectionFailed("timed out".to_string())),
        }
    }
}

#[async_trait]
impl LinkControl for BluetoothAdapter {
    async fn disconnect(&self, address: &Address) -> Result<()> {
        let device = self.device(address)?;
        if !device.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        match timeout(CONNECT_TIMEOUT, device.disconnect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BluetoothError::BlueZ(format!(
                "Failed to disconnect {}: {}",
                address, e
            ))),
            Err(_) => Err(BluetoothError::ConnectionFailed(
                "disconnect timed out".to_string(),
            )),
        }
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        match self.adapter.remove_device(to_bluer_address(address)?).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind, bluer::ErrorKind::DoesNotExist) => {
                debug!("{} was not known to BlueZ", address);
                Ok(())
            }
            Err(e) => Err(BluetoothError::BlueZ(format!(
                "Failed to remove {}: {}",
                address, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    // Note: hardware tests require a real adapter and a running bluetoothd.

    use super::*;

    #[test]
    fn address_conversion() {
        let parsed = to_bluer_address(&Address::new("aa:bb:cc:dd:ee:ff")).unwrap();
        assert_eq!(from_bluer_address(parsed), Address::new("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn invalid_address_is_rejected() {
        let err = to_bluer_address(&Address::new("not-an-address")).unwrap_err();
        assert!(matches!(err, BluetoothError::InvalidAddress(_)));
    }

    #[tokio::test]
    #[ignore = "requires real Bluetooth hardware"]
    async fn adapter_creation() {
        let adapter = BluetoothAdapter::new(None).await;
        assert!(adapter.is_ok() || matches!(adapter.err(), Some(BluetoothError::AdapterNotFound)));
    }
}
