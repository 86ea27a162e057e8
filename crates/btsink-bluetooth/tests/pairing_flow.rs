//! End-to-end pairing flows against a file-backed registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btsink_bluetooth::{
    AgentConfig, Decision, DeviceRegistry, JsonFileStore, PairingAgent, PairingEvent,
    PairingOutcome, ReconnectPolicy, RegistryStore, RequestKind, StoredDevice,
};
use btsink_core::{Address, PairingError, RegistryError};
use tempfile::TempDir;

const PHONE: &str = "AA:BB:CC:DD:EE:FF";

async fn open_registry(dir: &TempDir) -> Arc<DeviceRegistry> {
    let store = Arc::new(JsonFileStore::new(dir.path().join("devices.json")));
    Arc::new(
        DeviceRegistry::load(store, ReconnectPolicy::default())
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn unknown_device_confirms_and_is_trusted_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::new(PHONE);

    let registry = open_registry(&dir).await;
    assert!(registry.lookup(&address).await.is_none());

    let agent = PairingAgent::new(AgentConfig::default(), registry.clone());
    let mut events = agent.subscribe();

    let callback = {
        let agent = agent.clone();
        let address = address.clone();
        tokio::spawn(async move { agent.on_confirm_request(&address, 123456).await })
    };

    let (request, handle) = match events.recv().await.unwrap() {
        PairingEvent::Requested(request, handle) => (request, handle),
        other => panic!("expected a pairing request, got {:?}", other),
    };
    assert_eq!(request.address, address);
    assert_eq!(request.kind, RequestKind::PasskeyConfirm);
    assert_eq!(request.value.as_deref(), Some("123456"));
    assert!(request.deadline > request.created_at);

    assert!(handle.resolve(Decision::Accept).await);
    assert_eq!(callback.await.unwrap(), Ok(()));

    match events.recv().await.unwrap() {
        PairingEvent::Resolved { address: resolved, outcome } => {
            assert_eq!(resolved, address);
            assert_eq!(outcome, PairingOutcome::Accepted);
        }
        other => panic!("expected a resolution, got {:?}", other),
    }

    let device = registry.lookup(&address).await.unwrap();
    assert!(device.trusted);
    assert!(agent.pending_requests().await.is_empty());

    // Simulated restart: a new registry over the same file.
    registry.set_connected(&address, true).await.unwrap();
    drop(agent);
    drop(registry);

    let registry = open_registry(&dir).await;
    let device = registry.lookup(&address).await.unwrap();
    assert!(device.trusted);
    assert!(device.paired);
    assert!(!device.connected);

    // Standing trust now skips the pending request entirely.
    let agent = PairingAgent::new(AgentConfig::default(), registry);
    assert_eq!(agent.on_confirm_request(&address, 654321).await, Ok(()));
    assert!(agent.pending(&address).await.is_none());
}

#[tokio::test]
async fn second_confirm_leaves_exactly_one_pending() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::new(PHONE);
    let agent = PairingAgent::new(AgentConfig::default(), open_registry(&dir).await);
    let mut events = agent.subscribe();

    let first = {
        let (agent, address) = (agent.clone(), address.clone());
        tokio::spawn(async move { agent.on_confirm_request(&address, 111111).await })
    };
    assert!(matches!(events.recv().await.unwrap(), PairingEvent::Requested(..)));

    let second = {
        let (agent, address) = (agent.clone(), address.clone());
        tokio::spawn(async move { agent.on_confirm_request(&address, 222222).await })
    };
    assert_eq!(first.await.unwrap(), Err(PairingError::Superseded));

    let pending = agent.pending_requests().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].value.as_deref(), Some("222222"));

    assert!(agent.resolve(&address, Decision::Reject).await);
    assert_eq!(second.await.unwrap(), Err(PairingError::Rejected));
    assert!(agent.pending_requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_confirm_times_out_then_cancel_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::new(PHONE);
    let config = AgentConfig {
        pairing_timeout_secs: 30,
        ..Default::default()
    };
    let agent = PairingAgent::new(config, open_registry(&dir).await);
    let started = tokio::time::Instant::now();

    let result = agent.on_confirm_request(&address, 123456).await;

    assert_eq!(result, Err(PairingError::Timeout));
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert!(!agent.cancel(&address).await);
    assert!(agent.registry().lookup(&address).await.is_none());
}

#[tokio::test]
async fn pin_entry_is_accepted_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::new(PHONE);
    let config = AgentConfig {
        pin_code: Some("4321".to_string()),
        ..Default::default()
    };
    let agent = PairingAgent::new(config, open_registry(&dir).await);
    let mut events = agent.subscribe();

    let callback = {
        let (agent, address) = (agent.clone(), address.clone());
        tokio::spawn(async move { agent.on_pin_request(&address).await })
    };

    let request = match events.recv().await.unwrap() {
        PairingEvent::Requested(request, _) => request,
        other => panic!("expected a pairing request, got {:?}", other),
    };
    assert_eq!(request.kind, RequestKind::PinEntry);
    assert_eq!(request.value.as_deref(), Some("4321"));

    assert!(agent.resolve(&address, Decision::Accept).await);
    assert_eq!(callback.await.unwrap(), Ok("4321".to_string()));
    drop(agent);

    let registry = open_registry(&dir).await;
    assert!(registry.lookup(&address).await.unwrap().trusted);
}

/// A disk that refuses every write.
struct ReadOnlyStore;

#[async_trait]
impl RegistryStore for ReadOnlyStore {
    async fn load(&self) -> Result<Vec<StoredDevice>, RegistryError> {
        Ok(Vec::new())
    }

    async fn save(&self, _devices: Vec<StoredDevice>) -> Result<(), RegistryError> {
        Err(RegistryError::Io(std::io::Error::other("read-only file system")))
    }
}

#[tokio::test]
async fn accepted_pairing_completes_when_store_is_read_only() {
    let address = Address::new(PHONE);
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(ReadOnlyStore),
        ReconnectPolicy::default(),
    ));
    let agent = PairingAgent::new(AgentConfig::default(), registry.clone());

    let callback = {
        let (agent, address) = (agent.clone(), address.clone());
        tokio::spawn(async move { agent.on_authorization_request(&address).await })
    };
    while agent.pending(&address).await.is_none() {
        tokio::task::yield_now().await;
    }

    assert!(agent.resolve(&address, Decision::Accept).await);
    assert_eq!(callback.await.unwrap(), Ok(()));
    assert!(agent.pending_requests().await.is_empty());
    // Trust was never stored, so it is not claimed either.
    assert!(registry.lookup(&address).await.is_none());
}
