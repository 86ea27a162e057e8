//! Disconnecting and unpairing devices on the user's behalf.

use std::sync::Arc;

use async_trait::async_trait;
use btsink_core::{Address, Device};
use tracing::info;

use crate::error::{BluetoothError, Result};
use crate::reconnect::Reconnector;
use crate::registry::DeviceRegistry;

/// Link operations the stack performs for us.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait LinkControl: Send + Sync {
    /// Drop the connection to `address`. Not being connected is fine.
    async fn disconnect(&self, address: &Address) -> Result<()>;

    /// Remove the bond for `address`. An unknown device is fine.
    async fn remove(&self, address: &Address) -> Result<()>;
}

/// Applies user requests to the stack and the registry together.
pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
    reconnector: Arc<Reconnector>,
    control: Arc<dyn LinkControl>,
}

impl DeviceManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        reconnector: Arc<Reconnector>,
        control: Arc<dyn LinkControl>,
    ) -> Self {
        Self {
            registry,
            reconnector,
            control,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Disconnect a known device without triggering an automatic reconnect.
    pub async fn disconnect(&self, address: &Address) -> Result<()> {
        if !self.registry.mark_user_disconnect(address).await {
            return Err(BluetoothError::DeviceNotFound(address.to_string()));
        }
        self.reconnector.cancel(address).await;

        if let Err(e) = self.control.disconnect(address).await {
            self.registry.clear_user_disconnect(address).await;
            return Err(e);
        }
        info!("Disconnected {} on request", address);
        Ok(())
    }

    /// Unpair `address` and drop its record.
    ///
    /// The record is kept when the stack refuses, so trust and the bond
    /// never disagree.
    pub async fn remove(&self, address: &Address) -> Result<Option<Device>> {
        self.reconnector.cancel(address).await;
        self.control.remove(address).await?;
        let removed = self.registry.forget(address).await?;
        info!("Removed {}", address);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::MockReconnectTarget;
    use crate::registry::{ReconnectDecision, ReconnectPolicy};
    use crate::store::MemoryStore;

    fn addr() -> Address {
        Address::new("AA:BB:CC:DD:EE:FF")
    }

    fn manager(control: MockLinkControl) -> (Arc<MemoryStore>, Arc<Reconnector>, DeviceManager) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            ReconnectPolicy::from_secs(&[3600]),
        ));
        let mut target = MockReconnectTarget::new();
        target.expect_connect().never();
        let reconnector = Arc::new(Reconnector::new(registry.clone(), Arc::new(target)));
        let manager = DeviceManager::new(registry, reconnector.clone(), Arc::new(control));
        (store, reconnector, manager)
    }

    mod disconnect {
        use super::*;

        #[tokio::test]
        async fn suppresses_the_following_reconnect() {
            let mut control = MockLinkControl::new();
            control
                .expect_disconnect()
                .times(1)
                .returning(|_| Box::pin(async { Ok(()) }));
            let (_, _, manager) = manager(control);
            let registry = manager.registry().clone();
            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), true).await.unwrap();

            manager.disconnect(&addr()).await.unwrap();
            registry.set_connected(&addr(), false).await.unwrap();

            assert_eq!(
                registry.record_disconnect_for_reconnect(&addr()).await,
                ReconnectDecision::NotEligible
            );
        }

        #[tokio::test]
        async fn stops_running_reconnect() {
            let mut control = MockLinkControl::new();
            control
                .expect_disconnect()
                .returning(|_| Box::pin(async { Ok(()) }));
            let (_, reconnector, manager) = manager(control);
            let registry = manager.registry().clone();
            registry.mark_trusted(&addr(), true).await.unwrap();
            reconnector.on_disconnect(&addr()).await;
            assert_eq!(reconnector.active().await, 1);

            manager.disconnect(&addr()).await.unwrap();
            assert_eq!(reconnector.active().await, 0);
        }

        #[tokio::test]
        async fn unknown_device_is_not_found() {
            let mut control = MockLinkControl::new();
            control.expect_disconnect().never();
            let (_, _, manager) = manager(control);

            let err = manager.disconnect(&addr()).await.unwrap_err();
            assert!(matches!(err, BluetoothError::DeviceNotFound(_)));
        }

        #[tokio::test]
        async fn failure_keeps_reconnect_eligibility() {
            let mut control = MockLinkControl::new();
            control.expect_disconnect().returning(|_| {
                Box::pin(async { Err(BluetoothError::BlueZ("NotReady".to_string())) })
            });
            let (_, _, manager) = manager(control);
            let registry = manager.registry().clone();
            registry.mark_trusted(&addr(), true).await.unwrap();

            assert!(manager.disconnect(&addr()).await.is_err());
            assert!(matches!(
                registry.record_disconnect_for_reconnect(&addr()).await,
                ReconnectDecision::Retry { attempt: 1, .. }
            ));
        }
    }

    mod remove {
        use super::*;

        #[tokio::test]
        async fn unpairs_and_forgets() {
            let mut control = MockLinkControl::new();
            control
                .expect_remove()
                .times(1)
                .returning(|_| Box::pin(async { Ok(()) }));
            let (store, _, manager) = manager(control);
            manager.registry().mark_trusted(&addr(), true).await.unwrap();

            let removed = manager.remove(&addr()).await.unwrap().unwrap();
            assert!(removed.trusted);
            assert!(manager.registry().lookup(&addr()).await.is_none());
            assert!(store.snapshot().await.is_empty());
        }

        #[tokio::test]
        async fn refused_removal_keeps_record() {
            let mut control = MockLinkControl::new();
            control.expect_remove().returning(|_| {
                Box::pin(async { Err(BluetoothError::BlueZ("Failed".to_string())) })
            });
            let (_, _, manager) = manager(control);
            manager.registry().mark_trusted(&addr(), true).await.unwrap();

            assert!(manager.remove(&addr()).await.is_err());
            assert!(manager.registry().lookup(&addr()).await.unwrap().trusted);
        }
    }
}
