//! Automatic reconnection of trusted devices.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btsink_core::Address;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{DeviceRegistry, ReconnectDecision};

/// Something that can open a connection to a known device.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ReconnectTarget: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<()>;
}

/// Schedules reconnect attempts after unexpected disconnects.
///
/// At most one attempt loop runs per device. A new disconnect or a
/// connection replaces it.
pub struct Reconnector {
    registry: Arc<DeviceRegistry>,
    target: Arc<dyn ReconnectTarget>,
    tasks: Mutex<HashMap<Address, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Reconnector {
    pub fn new(registry: Arc<DeviceRegistry>, target: Arc<dyn ReconnectTarget>) -> Self {
        Self {
            registry,
            target,
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Consult the registry and, if eligible, start reconnecting.
    pub async fn on_disconnect(&self, address: &Address) -> ReconnectDecision {
        let decision = self.registry.record_disconnect_for_reconnect(address).await;
        if !matches!(decision, ReconnectDecision::Retry { .. }) {
            debug!("Not reconnecting {}: {:?}", address, decision);
            return decision;
        }

        let task = tokio::spawn(reconnect_loop(
            self.registry.clone(),
            self.target.clone(),
            address.clone(),
            decision,
            self.shutdown.child_token(),
        ));
        if let Some(previous) = self.tasks.lock().await.insert(address.clone(), task) {
            previous.abort();
        }
        decision
    }

    /// The device is back; stop any pending attempts.
    pub async fn on_connect(&self, address: &Address) {
        self.cancel(address).await;
    }

    /// Stop reconnecting to `address`. Returns false if nothing was running.
    pub async fn cancel(&self, address: &Address) -> bool {
        match self.tasks.lock().await.remove(address) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of devices with an active attempt loop.
    pub async fn active(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, task) in self.tasks.lock().await.drain() {
            task.abort();
        }
    }
}

async fn reconnect_loop(
    registry: Arc<DeviceRegistry>,
    target: Arc<dyn ReconnectTarget>,
    address: Address,
    mut decision: ReconnectDecision,
    shutdown: CancellationToken,
) {
    loop {
        let (attempt, after) = match decision {
            ReconnectDecision::Retry { attempt, after } => (attempt, after),
            ReconnectDecision::Exhausted => {
                warn!("Giving up reconnecting to {}", address);
                return;
            }
            ReconnectDecision::NotEligible => return,
        };

        info!("Reconnecting to {} in {:?} (attempt {})", address, after, attempt);
        tokio::select! {
            _ = tokio::time::sleep(after) => {}
            _ = shutdown.cancelled() => return,
        }

        if registry.lookup(&address).await.map_or(false, |d| d.connected) {
            debug!("{} reconnected on its own", address);
            return;
        }

        match target.connect(&address).await {
            Ok(()) => {
                info!("Reconnected to {}", address);
                if let Err(e) = registry.set_connected(&address, true).await {
                    warn!("Failed to record reconnection of {}: {}", address, e);
                }
                return;
            }
            Err(e) => {
                warn!("Reconnect attempt {} to {} failed: {}", attempt, address, e);
                decision = registry.record_disconnect_for_reconnect(&address).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::error::BluetoothError;
    use crate::registry::ReconnectPolicy;
    use crate::store::MemoryStore;

    fn addr() -> Address {
        Address::new("AA:BB:CC:DD:EE:FF")
    }

    async fn trusted_registry(backoff: &[u64]) -> Arc<DeviceRegistry> {
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(MemoryStore::new()),
            ReconnectPolicy::from_secs(backoff),
        ));
        registry.mark_trusted(&addr(), true).await.unwrap();
        registry.set_connected(&addr(), true).await.unwrap();
        registry.set_connected(&addr(), false).await.unwrap();
        registry
    }

    async fn settle(reconnector: &Reconnector) {
        while reconnector.active().await > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_backoff() {
        let registry = trusted_registry(&[2, 5]).await;
        let mut target = MockReconnectTarget::new();
        target
            .expect_connect()
            .times(1)
            .returning(|_| Box::pin(async { Ok(()) }));
        let reconnector = Reconnector::new(registry.clone(), Arc::new(target));
        let started = Instant::now();

        let decision = reconnector.on_disconnect(&addr()).await;
        assert_eq!(
            decision,
            ReconnectDecision::Retry {
                attempt: 1,
                after: Duration::from_secs(2)
            }
        );

        settle(&reconnector).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(registry.lookup(&addr()).await.unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_backoff_is_used() {
        let registry = trusted_registry(&[2, 5, 10]).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let mut target = MockReconnectTarget::new();
        let counter = attempts.clone();
        target.expect_connect().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(BluetoothError::ConnectionFailed("page timeout".into())) })
        });
        let reconnector = Reconnector::new(registry.clone(), Arc::new(target));
        let started = Instant::now();

        reconnector.on_disconnect(&addr()).await;
        settle(&reconnector).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(17));
        let device = registry.lookup(&addr()).await.unwrap();
        assert!(device.trusted);
        assert!(!device.connected);
    }

    #[tokio::test]
    async fn untrusted_device_is_left_alone() {
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(MemoryStore::new()),
            ReconnectPolicy::default(),
        ));
        let mut target = MockReconnectTarget::new();
        target.expect_connect().never();
        let reconnector = Reconnector::new(registry, Arc::new(target));

        assert_eq!(
            reconnector.on_disconnect(&addr()).await,
            ReconnectDecision::NotEligible
        );
        assert_eq!(reconnector.active().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_cancels_pending_attempt() {
        let registry = trusted_registry(&[30]).await;
        let mut target = MockReconnectTarget::new();
        target.expect_connect().never();
        let reconnector = Reconnector::new(registry, Arc::new(target));

        reconnector.on_disconnect(&addr()).await;
        assert_eq!(reconnector.active().await, 1);
        reconnector.on_connect(&addr()).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnector.active().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_attempts() {
        let registry = trusted_registry(&[30]).await;
        let mut target = MockReconnectTarget::new();
        target.expect_connect().never();
        let reconnector = Reconnector::new(registry, Arc::new(target));

        reconnector.on_disconnect(&addr()).await;
        reconnector.shutdown().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnector.active().await, 0);
    }
}
