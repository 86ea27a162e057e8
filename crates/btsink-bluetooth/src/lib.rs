//! # btsink-bluetooth
//!
//! Pairing and device bookkeeping for a Bluetooth audio receiver.
//!
//! ## Features
//!
//! - [`PairingAgent`]: answers BlueZ pairing callbacks, auto-accepting
//!   trusted devices and surfacing everything else as pending requests
//! - [`DeviceRegistry`]: trust, pairing and live connection state, persisted
//!   through a [`RegistryStore`]
//! - [`Reconnector`]: backoff-driven reconnects for trusted devices
//! - [`DeviceManager`]: user-requested disconnect and unpairing
//! - BlueZ bridge (Linux only): adapter setup, agent registration and a
//!   connection monitor built on `bluer`
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use btsink_bluetooth::{
//!     register_agent, AgentConfig, BluetoothAdapter, DeviceRegistry, JsonFileStore,
//!     PairingAgent, PairingEvent, ReconnectPolicy,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(JsonFileStore::new("/var/lib/btsink/devices.json"));
//!     let registry = Arc::new(DeviceRegistry::load(store, ReconnectPolicy::default()).await?);
//!
//!     let adapter = BluetoothAdapter::new(None).await?;
//!     adapter.prepare("Living Room").await?;
//!
//!     let agent = PairingAgent::new(AgentConfig::default(), registry);
//!     let mut events = agent.subscribe();
//!     let _registration = register_agent(adapter.session(), agent).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let PairingEvent::Requested(request, handle) = event {
//!             println!("{} wants to pair ({:?})", request.device_name, request.value);
//!             handle.accept().await;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod error;
pub mod link;
pub mod manage;
pub mod reconnect;
pub mod registry;
pub mod store;

#[cfg(target_os = "linux")]
pub mod adapter;
#[cfg(target_os = "linux")]
pub mod bridge;
#[cfg(target_os = "linux")]
pub mod monitor;

pub use agent::{
    format_passkey, AgentConfig, Capability, Decision, PairingAgent, PairingEvent,
    PairingOutcome, PendingPairingRequest, RequestKind, ResolveHandle,
};
pub use error::{BluetoothError, Result};
pub use link::{LinkEvent, LinkTracker};
pub use manage::{DeviceManager, LinkControl};
pub use reconnect::{ReconnectTarget, Reconnector};
pub use registry::{DeviceRegistry, ReconnectDecision, ReconnectPolicy, DEFAULT_BACKOFF_SECS};
pub use store::{JsonFileStore, MemoryStore, RegistryStore, StoredDevice, STORE_VERSION};

#[cfg(target_os = "linux")]
pub use adapter::BluetoothAdapter;
#[cfg(target_os = "linux")]
pub use bridge::{register_agent, AgentRegistration};
#[cfg(target_os = "linux")]
pub use monitor::ConnectionMonitor;
