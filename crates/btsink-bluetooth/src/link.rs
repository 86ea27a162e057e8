//! Applies device link events to the registry and reconnect driver.

use std::sync::Arc;

use btsink_core::Address;
use tracing::{debug, warn};

use crate::agent::PairingAgent;
use crate::reconnect::Reconnector;
use crate::registry::DeviceRegistry;

/// A change reported by BlueZ for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Device appeared on the bus, with its name if known.
    Discovered(Option<String>),
    Connected(bool),
    Paired(bool),
    Name(String),
    /// BlueZ no longer knows the device, so its bond is gone.
    Removed,
}

/// Routes link events to the single writer of device state.
#[derive(Clone)]
pub struct LinkTracker {
    registry: Arc<DeviceRegistry>,
    reconnector: Arc<Reconnector>,
    agent: Option<PairingAgent>,
}

impl LinkTracker {
    pub fn new(registry: Arc<DeviceRegistry>, reconnector: Arc<Reconnector>) -> Self {
        Self {
            registry,
            reconnector,
            agent: None,
        }
    }

    /// Also release the agent's displayed codes once a device is paired.
    pub fn with_agent(mut self, agent: PairingAgent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub async fn handle(&self, address: &Address, event: LinkEvent) {
        debug!("{}: {:?}", address, event);
        let result = match event {
            LinkEvent::Discovered(name) => self
                .registry
                .observe(address, name.as_deref())
                .await
                .map(drop),
            LinkEvent::Name(name) => self.registry.observe(address, Some(&name)).await.map(drop),
            LinkEvent::Paired(true) => {
                if let Some(agent) = &self.agent {
                    agent.pairing_completed(address).await;
                }
                self.registry.note_paired(address).await.map(drop)
            }
            LinkEvent::Paired(false) => return,
            LinkEvent::Connected(true) => {
                self.reconnector.on_connect(address).await;
                self.registry.set_connected(address, true).await.map(drop)
            }
            LinkEvent::Connected(false) => {
                let was_connected = self
                    .registry
                    .lookup(address)
                    .await
                    .map_or(false, |d| d.connected);
                let result = self.registry.set_connected(address, false).await;
                if was_connected {
                    self.reconnector.on_disconnect(address).await;
                }
                result.map(drop)
            }
            LinkEvent::Removed => {
                self.reconnector.cancel(address).await;
                if let Some(agent) = &self.agent {
                    agent.cancel(address).await;
                }
                self.registry.forget(address).await.map(drop)
            }
        };

        if let Err(e) = result {
            warn!("Failed to record state of {}: {}", address, e);
        }
    }
}
