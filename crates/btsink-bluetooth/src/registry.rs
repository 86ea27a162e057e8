//! Device trust and reconnect registry.
//!
//! [`DeviceRegistry`] is the only writer of [`Device`] records. Every
//! mutation goes through one async mutex, so updates for an address are
//! totally ordered, and the persisted view is written while that lock is
//! held. A change becomes visible only after the store accepted it.
//!
//! Only devices that are trusted or paired are persisted. Strangers seen
//! during discovery live in memory until they pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use btsink_core::{Address, Device, RegistryError};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::store::{RegistryStore, StoredDevice};

/// Default reconnect backoff in seconds.
pub const DEFAULT_BACKOFF_SECS: [u64; 5] = [2, 5, 10, 30, 60];

/// Fixed backoff sequence for automatic reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    backoff: Vec<Duration>,
}

impl ReconnectPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay before the given attempt (1-based), if the sequence allows it.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let index = attempt.checked_sub(1)? as usize;
        self.backoff.get(index).copied()
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.len() as u32
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_BACKOFF_SECS)
    }
}

/// What to do after a device dropped its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `after`.
    Retry { attempt: u32, after: Duration },
    /// Backoff sequence used up. The device stays trusted.
    Exhausted,
    /// Unknown, untrusted, or disconnected on purpose.
    NotEligible,
}

#[derive(Clone)]
struct Entry {
    device: Device,
    /// Tie-breaker for equal `last_seen` values; higher is more recent.
    seq: u64,
    user_disconnect: bool,
}

#[derive(Default)]
struct State {
    devices: HashMap<Address, Entry>,
    next_seq: u64,
}

impl Entry {
    fn new(address: &Address, seq: u64) -> Self {
        Self {
            device: Device::new(address.clone(), Utc::now()),
            seq,
            user_disconnect: false,
        }
    }

    fn persists(&self) -> bool {
        self.device.trusted || self.device.paired
    }

    /// The fields whose change requires a write. `last_seen` rides along
    /// with the next write instead.
    fn durable(&self) -> Option<(String, bool, bool)> {
        self.persists().then(|| {
            (
                self.device.name.clone(),
                self.device.trusted,
                self.device.paired,
            )
        })
    }
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Persisted view with `address` replaced by `replacement` (or dropped
    /// when `None`).
    fn stored_with(&self, address: &Address, replacement: Option<&Entry>) -> Vec<StoredDevice> {
        let mut stored: Vec<_> = self
            .devices
            .iter()
            .filter(|(key, _)| *key != address)
            .map(|(_, entry)| entry)
            .chain(replacement)
            .filter(|entry| entry.persists())
            .map(|entry| StoredDevice::from(&entry.device))
            .collect();
        stored.sort_by(|a, b| a.address.cmp(&b.address));
        stored
    }
}

/// Single source of truth for device identity, trust and live state.
pub struct DeviceRegistry {
    state: Mutex<State>,
    store: Arc<dyn RegistryStore>,
    policy: ReconnectPolicy,
}

impl DeviceRegistry {
    /// Create an empty registry. Nothing is read from `store`.
    pub fn new(store: Arc<dyn RegistryStore>, policy: ReconnectPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            store,
            policy,
        }
    }

    /// Build the registry from persisted records.
    ///
    /// Every loaded device starts disconnected with no reconnect attempts.
    pub async fn load(
        store: Arc<dyn RegistryStore>,
        policy: ReconnectPolicy,
    ) -> Result<Self, RegistryError> {
        let records = store.load().await?;
        let mut state = State::default();
        for record in records {
            let seq = state.bump();
            let device = Device::from(record);
            state.devices.insert(
                device.address.clone(),
                Entry {
                    device,
                    seq,
                    user_disconnect: false,
                },
            );
        }
        info!("Loaded {} known devices", state.devices.len());

        Ok(Self {
            state: Mutex::new(state),
            store,
            policy,
        })
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub async fn lookup(&self, address: &Address) -> Option<Device> {
        let state = self.state.lock().await;
        state.devices.get(address).map(|entry| entry.device.clone())
    }

    /// All devices, most recently seen first.
    pub async fn list_devices(&self) -> Vec<Device> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.devices.values().collect();
        entries.sort_by(|a, b| {
            b.device
                .last_seen
                .cmp(&a.device.last_seen)
                .then(b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|entry| entry.device.clone()).collect()
    }

    /// Apply `update` to a copy of the record for `address` (created if
    /// absent), persist it if the durable view changed, then commit.
    ///
    /// On a store error nothing changes, so a retry writes again.
    async fn update<F>(&self, address: &Address, update: F) -> Result<Device, RegistryError>
    where
        F: FnOnce(&mut Entry),
    {
        let mut state = self.state.lock().await;
        let seq = state.bump();
        let current = state.devices.get(address);
        let before = current.and_then(Entry::durable);
        let mut candidate = current
            .cloned()
            .unwrap_or_else(|| Entry::new(address, seq));

        update(&mut candidate);

        if candidate.durable() != before {
            self.store
                .save(state.stored_with(address, Some(&candidate)))
                .await?;
        }
        let device = candidate.device.clone();
        state.devices.insert(address.clone(), candidate);
        Ok(device)
    }

    /// Set the trust flag. Idempotent; creates the record if absent.
    pub async fn mark_trusted(&self, address: &Address, trusted: bool) -> Result<Device, RegistryError> {
        let device = self
            .update(address, |entry| entry.device.trusted = trusted)
            .await?;
        debug!("Device {} trusted: {}", address, trusted);
        Ok(device)
    }

    /// Record that `address` completed pairing.
    pub async fn note_paired(&self, address: &Address) -> Result<Device, RegistryError> {
        self.update(address, |entry| {
            entry.device.paired = true;
            entry.device.last_seen = Utc::now();
        })
        .await
    }

    /// Create or refresh a record from a discovery event.
    pub async fn observe(&self, address: &Address, name: Option<&str>) -> Result<Device, RegistryError> {
        let seq = self.state.lock().await.bump();
        self.update(address, |entry| {
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                entry.device.name = name.to_string();
            }
            entry.device.last_seen = Utc::now();
            entry.seq = seq;
        })
        .await
    }

    /// Update live connection state.
    ///
    /// A transition to connected resets the reconnect counter and marks the
    /// device paired, since BlueZ only reports audio links for bonded devices.
    pub async fn set_connected(&self, address: &Address, connected: bool) -> Result<Device, RegistryError> {
        let seq = self.state.lock().await.bump();
        let device = self
            .update(address, |entry| {
                if connected && !entry.device.connected {
                    entry.device.reconnect_attempts = 0;
                    entry.device.paired = true;
                    entry.user_disconnect = false;
                }
                entry.device.connected = connected;
                entry.device.last_seen = Utc::now();
                entry.seq = seq;
            })
            .await?;

        if connected {
            info!("Device connected: {}", device.display_name());
        } else {
            info!("Device disconnected: {}", device.display_name());
        }
        Ok(device)
    }

    /// The next disconnect of `address` was asked for by the user.
    ///
    /// Returns false for unknown devices.
    pub async fn mark_user_disconnect(&self, address: &Address) -> bool {
        let mut state = self.state.lock().await;
        match state.devices.get_mut(address) {
            Some(entry) => {
                entry.user_disconnect = true;
                true
            }
            None => false,
        }
    }

    /// Undo [`mark_user_disconnect`](Self::mark_user_disconnect) when the
    /// disconnect did not happen.
    pub async fn clear_user_disconnect(&self, address: &Address) {
        if let Some(entry) = self.state.lock().await.devices.get_mut(address) {
            entry.user_disconnect = false;
        }
    }

    /// Decide whether a dropped device should be reconnected.
    ///
    /// Each `Retry` consumes one step of the backoff sequence.
    pub async fn record_disconnect_for_reconnect(&self, address: &Address) -> ReconnectDecision {
        let mut state = self.state.lock().await;
        let Some(entry) = state.devices.get_mut(address) else {
            return ReconnectDecision::NotEligible;
        };

        if entry.user_disconnect {
            entry.user_disconnect = false;
            debug!("{} disconnected by user, not reconnecting", address);
            return ReconnectDecision::NotEligible;
        }
        if !entry.device.trusted {
            return ReconnectDecision::NotEligible;
        }

        let attempt = entry.device.reconnect_attempts + 1;
        match self.policy.delay_for(attempt) {
            Some(after) => {
                entry.device.reconnect_attempts = attempt;
                ReconnectDecision::Retry { attempt, after }
            }
            None => ReconnectDecision::Exhausted,
        }
    }

    /// Remove a device entirely.
    ///
    /// The record stays in memory if the store rejects the removal.
    pub async fn forget(&self, address: &Address) -> Result<Option<Device>, RegistryError> {
        let mut state = self.state.lock().await;
        let persisted = match state.devices.get(address) {
            Some(entry) => entry.persists(),
            None => return Ok(None),
        };
        if persisted {
            self.store.save(state.stored_with(address, None)).await?;
        }
        let removed = state.devices.remove(address).map(|entry| entry.device);
        info!("Forgot device {}", address);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::store::{MemoryStore, MockRegistryStore};

    fn addr() -> Address {
        Address::new("AA:BB:CC:DD:EE:FF")
    }

    /// Memory store whose next `save` fails once when armed.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_next: AtomicBool,
    }

    impl FlakyStore {
        fn fail_next_save(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RegistryStore for FlakyStore {
        async fn load(&self) -> Result<Vec<StoredDevice>, RegistryError> {
            self.inner.load().await
        }

        async fn save(&self, devices: Vec<StoredDevice>) -> Result<(), RegistryError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RegistryError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(devices).await
        }
    }

    fn memory_registry() -> (Arc<MemoryStore>, DeviceRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = DeviceRegistry::new(store.clone(), ReconnectPolicy::default());
        (store, registry)
    }

    mod trust {
        use super::*;

        #[tokio::test]
        async fn mark_trusted_is_idempotent() {
            let mut store = MockRegistryStore::new();
            store
                .expect_save()
                .times(1)
                .returning(|_| Box::pin(async { Ok(()) }));
            let registry = DeviceRegistry::new(Arc::new(store), ReconnectPolicy::default());

            let first = registry.mark_trusted(&addr(), true).await.unwrap();
            let second = registry.mark_trusted(&addr(), true).await.unwrap();

            assert_eq!(first, second);
            assert!(second.trusted);
            assert_eq!(registry.list_devices().await.len(), 1);
        }

        #[tokio::test]
        async fn persistence_failure_is_surfaced() {
            let mut store = MockRegistryStore::new();
            store.expect_save().returning(|_| {
                Box::pin(async { Err(RegistryError::Io(std::io::Error::other("disk full"))) })
            });
            let registry = DeviceRegistry::new(Arc::new(store), ReconnectPolicy::default());

            let err = registry.mark_trusted(&addr(), true).await.unwrap_err();
            assert!(matches!(err, RegistryError::Io(_)));
        }

        #[tokio::test]
        async fn failed_save_leaves_record_unchanged() {
            let store = Arc::new(FlakyStore::default());
            let registry = DeviceRegistry::new(store.clone(), ReconnectPolicy::default());

            store.fail_next_save();
            assert!(registry.mark_trusted(&addr(), true).await.is_err());
            assert!(registry.lookup(&addr()).await.is_none());

            // The retry has to write again rather than trust the memory copy.
            assert!(registry.mark_trusted(&addr(), true).await.unwrap().trusted);
            let reloaded = DeviceRegistry::load(store, ReconnectPolicy::default()).await.unwrap();
            assert!(reloaded.lookup(&addr()).await.unwrap().trusted);
        }

        #[tokio::test]
        async fn failed_forget_keeps_device() {
            let store = Arc::new(FlakyStore::default());
            let registry = DeviceRegistry::new(store.clone(), ReconnectPolicy::default());
            registry.mark_trusted(&addr(), true).await.unwrap();

            store.fail_next_save();
            assert!(registry.forget(&addr()).await.is_err());
            assert!(registry.lookup(&addr()).await.unwrap().trusted);
        }

        #[tokio::test]
        async fn unknown_address_is_not_an_error() {
            let (_, registry) = memory_registry();
            assert!(registry.lookup(&addr()).await.is_none());
            assert!(!registry.mark_user_disconnect(&addr()).await);
            assert!(registry.forget(&addr()).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn lookup_normalizes_address() {
            let (_, registry) = memory_registry();
            registry.mark_trusted(&Address::new("aa:bb:cc:dd:ee:ff"), true).await.unwrap();

            assert!(registry.lookup(&addr()).await.unwrap().trusted);
        }
    }

    mod connection {
        use super::*;

        #[tokio::test]
        async fn connect_marks_paired_and_resets_attempts() {
            let (_, registry) = memory_registry();
            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.record_disconnect_for_reconnect(&addr()).await;
            assert_eq!(registry.lookup(&addr()).await.unwrap().reconnect_attempts, 1);

            let device = registry.set_connected(&addr(), true).await.unwrap();
            assert!(device.connected);
            assert!(device.paired);
            assert_eq!(device.reconnect_attempts, 0);
        }

        #[tokio::test]
        async fn list_is_most_recent_first() {
            let (_, registry) = memory_registry();
            let a = Address::new("11:11:11:11:11:11");
            let b = Address::new("22:22:22:22:22:22");
            registry.observe(&a, Some("A")).await.unwrap();
            registry.observe(&b, Some("B")).await.unwrap();

            let names: Vec<_> = registry.list_devices().await.into_iter().map(|d| d.name).collect();
            assert_eq!(names, ["B", "A"]);

            registry.set_connected(&a, true).await.unwrap();
            let names: Vec<_> = registry.list_devices().await.into_iter().map(|d| d.name).collect();
            assert_eq!(names, ["A", "B"]);
        }

        #[tokio::test]
        async fn observe_keeps_known_name() {
            let (_, registry) = memory_registry();
            registry.observe(&addr(), Some("Pixel")).await.unwrap();
            let device = registry.observe(&addr(), None).await.unwrap();

            assert_eq!(device.name, "Pixel");
            assert!(!device.trusted);
        }

        #[tokio::test]
        async fn forget_removes_from_store() {
            let (store, registry) = memory_registry();
            registry.mark_trusted(&addr(), true).await.unwrap();

            let removed = registry.forget(&addr()).await.unwrap().unwrap();
            assert_eq!(removed.address, addr());
            assert!(registry.lookup(&addr()).await.is_none());
            assert!(store.snapshot().await.is_empty());
        }
    }

    mod reconnect {
        use super::*;

        #[tokio::test]
        async fn backoff_increases_then_exhausts() {
            let (_, registry) = memory_registry();
            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), false).await.unwrap();

            let mut delays = Vec::new();
            loop {
                match registry.record_disconnect_for_reconnect(&addr()).await {
                    ReconnectDecision::Retry { attempt, after } => {
                        assert_eq!(attempt as usize, delays.len() + 1);
                        delays.push(after.as_secs());
                    }
                    ReconnectDecision::Exhausted => break,
                    ReconnectDecision::NotEligible => panic!("trusted device should be eligible"),
                }
            }

            assert_eq!(delays, DEFAULT_BACKOFF_SECS);
            assert!(registry.lookup(&addr()).await.unwrap().trusted);
        }

        #[tokio::test]
        async fn untrusted_and_unknown_are_not_eligible() {
            let (_, registry) = memory_registry();
            assert_eq!(
                registry.record_disconnect_for_reconnect(&addr()).await,
                ReconnectDecision::NotEligible
            );

            registry.set_connected(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), false).await.unwrap();
            assert_eq!(
                registry.record_disconnect_for_reconnect(&addr()).await,
                ReconnectDecision::NotEligible
            );
        }

        #[tokio::test]
        async fn user_disconnect_skips_one_reconnect() {
            let (_, registry) = memory_registry();
            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), true).await.unwrap();

            assert!(registry.mark_user_disconnect(&addr()).await);
            registry.set_connected(&addr(), false).await.unwrap();
            assert_eq!(
                registry.record_disconnect_for_reconnect(&addr()).await,
                ReconnectDecision::NotEligible
            );

            assert!(matches!(
                registry.record_disconnect_for_reconnect(&addr()).await,
                ReconnectDecision::Retry { attempt: 1, .. }
            ));
        }

        #[test]
        fn policy_delays() {
            let policy = ReconnectPolicy::from_secs(&[1, 3]);
            assert_eq!(policy.delay_for(0), None);
            assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
            assert_eq!(policy.delay_for(2), Some(Duration::from_secs(3)));
            assert_eq!(policy.delay_for(3), None);
            assert_eq!(policy.max_attempts(), 2);
        }
    }

    mod persistence {
        use super::*;

        #[tokio::test]
        async fn reload_keeps_trust_and_drops_live_state() {
            let (store, registry) = memory_registry();
            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), true).await.unwrap();

            let reloaded = DeviceRegistry::load(store, ReconnectPolicy::default()).await.unwrap();
            let device = reloaded.lookup(&addr()).await.unwrap();
            assert!(device.trusted);
            assert!(device.paired);
            assert!(!device.connected);
            assert_eq!(device.reconnect_attempts, 0);
        }

        #[tokio::test]
        async fn strangers_are_not_persisted() {
            let (store, registry) = memory_registry();
            registry.observe(&addr(), Some("Stranger")).await.unwrap();
            registry.set_connected(&Address::new("11:22:33:44:55:66"), false).await.unwrap();

            assert_eq!(registry.list_devices().await.len(), 2);
            assert!(store.snapshot().await.is_empty());
        }

        #[tokio::test]
        async fn sightings_of_known_devices_do_not_rewrite_the_store() {
            let mut store = MockRegistryStore::new();
            // One write for trust, one for the connection marking it paired.
            store
                .expect_save()
                .times(2)
                .returning(|_| Box::pin(async { Ok(()) }));
            let registry = DeviceRegistry::new(Arc::new(store), ReconnectPolicy::default());

            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.set_connected(&addr(), true).await.unwrap();
            registry.observe(&addr(), None).await.unwrap();
            registry.set_connected(&addr(), false).await.unwrap();
            registry.set_connected(&addr(), true).await.unwrap();
        }

        #[tokio::test]
        async fn reconnect_counter_is_not_persisted() {
            let mut store = MockRegistryStore::new();
            store
                .expect_save()
                .times(1)
                .returning(|_| Box::pin(async { Ok(()) }));
            let registry = DeviceRegistry::new(Arc::new(store), ReconnectPolicy::default());

            registry.mark_trusted(&addr(), true).await.unwrap();
            registry.record_disconnect_for_reconnect(&addr()).await;
            registry.record_disconnect_for_reconnect(&addr()).await;
        }
    }
}
