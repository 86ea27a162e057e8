//! Watches BlueZ for device changes and feeds them to a [`LinkTracker`].

use std::pin::Pin;

use bluer::{AdapterEvent, DeviceEvent, DeviceProperty};
use btsink_core::Address;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_stream::StreamMap;
use tracing::{debug, info, warn};

use crate::adapter::{from_bluer_address, BluetoothAdapter};
use crate::error::{BluetoothError, Result};
use crate::link::{LinkEvent, LinkTracker};

type DeviceEvents = Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>;

/// Background task following adapter and device property streams.
pub struct ConnectionMonitor {
    task: JoinHandle<()>,
}

impl ConnectionMonitor {
    /// Seed the tracker with devices BlueZ already knows, then follow changes.
    pub async fn start(adapter: BluetoothAdapter, tracker: LinkTracker) -> Result<Self> {
        let adapter_events = adapter.adapter().events().await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to monitor adapter: {}", e))
        })?;

        let mut devices: StreamMap<Address, DeviceEvents> = StreamMap::new();
        let known = adapter.adapter().device_addresses().await.map_err(|e| {
            BluetoothError::BlueZ(format!("Failed to list devices: {}", e))
        })?;
        for addr in known {
            let address = from_bluer_address(addr);
            if let Some(events) = device_events(&adapter, &address).await {
                devices.insert(address.clone(), events);
            }
            seed(&adapter, &tracker, &address).await;
        }
        info!("Monitoring {} known devices", devices.len());

        let task = tokio::spawn(run(adapter, tracker, Box::pin(adapter_events), devices));
        Ok(Self { task })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    adapter: BluetoothAdapter,
    tracker: LinkTracker,
    mut adapter_events: Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>,
    mut devices: StreamMap<Address, DeviceEvents>,
) {
    loop {
        tokio::select! {
            event = adapter_events.next() => match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    let address = from_bluer_address(addr);
                    if !devices.contains_key(&address) {
                        if let Some(events) = device_events(&adapter, &address).await {
                            devices.insert(address.clone(), events);
                        }
                    }
                    let name = match adapter.device(&address) {
                        Ok(device) => device.name().await.ok().flatten(),
                        Err(_) => None,
                    };
                    tracker.handle(&address, LinkEvent::Discovered(name)).await;
                }
                Some(AdapterEvent::DeviceRemoved(addr)) => {
                    let address = from_bluer_address(addr);
                    debug!("BlueZ dropped device {}", address);
                    devices.remove(&address);
                    tracker.handle(&address, LinkEvent::Removed).await;
                }
                Some(_) => {}
                None => {
                    warn!("Adapter event stream ended");
                    return;
                }
            },
            Some((address, event)) = devices.next(), if !devices.is_empty() => {
                if let DeviceEvent::PropertyChanged(property) = event {
                    if let Some(link) = link_event(property) {
                        tracker.handle(&address, link).await;
                    }
                }
            }
        }
    }
}

fn link_event(property: DeviceProperty) -> Option<LinkEvent> {
    match property {
        DeviceProperty::Connected(connected) => Some(LinkEvent::Connected(connected)),
        DeviceProperty::Paired(paired) => Some(LinkEvent::Paired(paired)),
        DeviceProperty::Name(name) => Some(LinkEvent::Name(name)),
        _ => None,
    }
}

async fn device_events(adapter: &BluetoothAdapter, address: &Address) -> Option<DeviceEvents> {
    let device = adapter.device(address).ok()?;
    match device.events().await {
        Ok(events) => Some(Box::pin(events)),
        Err(e) => {
            warn!("Failed to watch {}: {}", address, e);
            None
        }
    }
}

/// Report the current state of a device BlueZ already knows.
async fn seed(adapter: &BluetoothAdapter, tracker: &LinkTracker, address: &Address) {
    let Ok(device) = adapter.device(address) else {
        return;
    };
    let paired = device.is_paired().await.unwrap_or(false);
    if !paired {
        return;
    }
    let name = device.name().await.ok().flatten();
    tracker.handle(address, LinkEvent::Discovered(name)).await;
    if device.is_connected().await.unwrap_or(false) {
        tracker.handle(address, LinkEvent::Connected(true)).await;
    }
}
