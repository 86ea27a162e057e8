//! Pairing protocol state machine.
//!
//! [`PairingAgent`] answers the pairing callbacks BlueZ issues. Devices with
//! standing trust are accepted straight away. Everything else becomes a
//! [`PendingPairingRequest`] that is published on an event channel together
//! with a [`ResolveHandle`], and the callback suspends until a decision, the
//! deadline, or shutdown.
//!
//! There is at most one pending request per address. A newer callback for
//! the same address supersedes the older one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use btsink_core::{Address, PairingError};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;

/// Default time a callback waits for a decision.
pub const DEFAULT_PAIRING_TIMEOUT_SECS: u64 = 60;

/// Longest wait a callback accepts; larger configured values are capped.
pub const MAX_PAIRING_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// PIN handed out when none is configured.
pub const DEFAULT_PIN_CODE: &str = "0000";

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// I/O capability advertised to BlueZ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    #[default]
    DisplayYesNo,
    DisplayOnly,
    KeyboardDisplay,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::DisplayYesNo => "display-yes-no",
            Capability::DisplayOnly => "display-only",
            Capability::KeyboardDisplay => "keyboard-display",
        };
        f.write_str(s)
    }
}

/// Pairing agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds each callback waits for a decision.
    pub pairing_timeout_secs: u64,
    pub capability: Capability,
    /// PIN returned for legacy PIN requests. `None` generates one per request.
    pub pin_code: Option<String>,
    /// Accept passkey requests without waiting for a decision.
    pub auto_confirm_passkey: bool,
    /// Mark devices trusted once pairing is accepted.
    pub auto_trust: bool,
    /// Addresses that are always rejected.
    pub denied_addresses: Vec<Address>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pairing_timeout_secs: DEFAULT_PAIRING_TIMEOUT_SECS,
            capability: Capability::default(),
            pin_code: Some(DEFAULT_PIN_CODE.to_string()),
            auto_confirm_passkey: true,
            auto_trust: true,
            denied_addresses: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Configured wait, capped at [`MAX_PAIRING_TIMEOUT_SECS`].
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs.min(MAX_PAIRING_TIMEOUT_SECS))
    }

    /// Check values that cannot be used as given.
    pub fn validate(&self) -> Result<(), String> {
        if self.pairing_timeout_secs == 0 {
            return Err("pairing timeout must be at least one second".to_string());
        }
        if self.pairing_timeout_secs > MAX_PAIRING_TIMEOUT_SECS {
            return Err(format!(
                "pairing timeout of {}s exceeds the maximum of {}s",
                self.pairing_timeout_secs, MAX_PAIRING_TIMEOUT_SECS
            ));
        }
        Ok(())
    }

    fn is_denied(&self, address: &Address) -> bool {
        self.denied_addresses.contains(address)
    }
}

/// What a pending request asks of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Legacy PIN entry.
    PinEntry,
    /// Show a passkey the remote side types in.
    PasskeyDisplay,
    /// Confirm the passkey matches the one shown on the remote device.
    PasskeyConfirm,
    /// Yes/no without any code.
    SimpleConfirm,
    /// Show a legacy PIN the remote side types in.
    PinDisplay,
}

impl RequestKind {
    pub fn is_display(&self) -> bool {
        matches!(self, RequestKind::PasskeyDisplay | RequestKind::PinDisplay)
    }
}

/// Snapshot of an unanswered pairing callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPairingRequest {
    pub id: u64,
    pub address: Address,
    pub device_name: String,
    pub kind: RequestKind,
    /// PIN or passkey to show or confirm.
    pub value: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// A decision taken outside the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// How a pending request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Accepted,
    Rejected,
    TimedOut,
    Cancelled,
    Superseded,
}

impl From<Decision> for PairingOutcome {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Accept => PairingOutcome::Accepted,
            Decision::Reject => PairingOutcome::Rejected,
        }
    }
}

impl PairingOutcome {
    fn into_result(self) -> Result<(), PairingError> {
        match self {
            PairingOutcome::Accepted => Ok(()),
            PairingOutcome::Rejected => Err(PairingError::Rejected),
            PairingOutcome::TimedOut => Err(PairingError::Timeout),
            PairingOutcome::Cancelled => Err(PairingError::Cancelled),
            PairingOutcome::Superseded => Err(PairingError::Superseded),
        }
    }
}

/// Events published to whoever takes pairing decisions.
#[derive(Debug, Clone)]
pub enum PairingEvent {
    Requested(PendingPairingRequest, ResolveHandle),
    Resolved {
        address: Address,
        outcome: PairingOutcome,
    },
}

/// Completes one specific pending request.
///
/// Once that request is gone (resolved, timed out, superseded) the handle
/// does nothing.
#[derive(Clone)]
pub struct ResolveHandle {
    shared: Weak<Shared>,
    address: Address,
    id: u64,
}

impl fmt::Debug for ResolveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveHandle")
            .field("address", &self.address)
            .field("id", &self.id)
            .finish()
    }
}

impl ResolveHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns false if the request is no longer pending.
    pub async fn resolve(&self, decision: Decision) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared
                    .release(&self.address, Some(self.id), decision.into())
                    .await
            }
            None => false,
        }
    }

    pub async fn accept(&self) -> bool {
        self.resolve(Decision::Accept).await
    }

    pub async fn reject(&self) -> bool {
        self.resolve(Decision::Reject).await
    }
}

struct Slot {
    request: PendingPairingRequest,
    expires: Instant,
    reply: Option<oneshot::Sender<PairingOutcome>>,
}

struct Shared {
    config: AgentConfig,
    registry: Arc<DeviceRegistry>,
    slots: Mutex<HashMap<Address, Slot>>,
    next_id: AtomicU64,
    events: broadcast::Sender<PairingEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    fn emit(&self, event: PairingEvent) {
        // No subscribers is fine; requests then simply time out.
        let _ = self.events.send(event);
    }

    /// Remove the slot for `address` (only if it is request `id`, when given)
    /// and complete it with `outcome`.
    async fn release(&self, address: &Address, id: Option<u64>, outcome: PairingOutcome) -> bool {
        let slot = {
            let mut slots = self.slots.lock().await;
            let current = slots
                .get(address)
                .map_or(false, |slot| id.map_or(true, |id| slot.request.id == id));
            if current {
                slots.remove(address)
            } else {
                None
            }
        };
        match slot {
            Some(slot) => {
                self.complete(slot, outcome);
                true
            }
            None => false,
        }
    }

    fn complete(&self, slot: Slot, outcome: PairingOutcome) {
        let address = slot.request.address;
        debug!("Pairing request {} for {} ended: {:?}", slot.request.id, address, outcome);
        if let Some(reply) = slot.reply {
            let _ = reply.send(outcome);
        }
        self.emit(PairingEvent::Resolved { address, outcome });
    }

    /// Release display-only slots whose deadline passed.
    async fn purge_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Slot> = {
            let mut slots = self.slots.lock().await;
            let addresses: Vec<Address> = slots
                .iter()
                .filter(|(_, slot)| slot.reply.is_none() && slot.expires <= now)
                .map(|(address, _)| address.clone())
                .collect();
            addresses
                .iter()
                .filter_map(|address| slots.remove(address))
                .collect()
        };
        for slot in expired {
            self.complete(slot, PairingOutcome::TimedOut);
        }
    }
}

/// A published request the callback is waiting on.
///
/// Dropping it before [`PairingAgent::wait`] finishes releases the request.
struct Waiter {
    id: u64,
    expires: Instant,
    reply: oneshot::Receiver<PairingOutcome>,
    guard: AbandonGuard,
}

/// Releases an abandoned request if its callback future is dropped early.
struct AbandonGuard {
    shared: Arc<Shared>,
    address: Address,
    id: u64,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let shared = self.shared.clone();
        let address = self.address.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                shared.release(&address, Some(id), PairingOutcome::Cancelled).await;
            });
        }
    }
}

/// Answers BlueZ pairing callbacks.
///
/// Cheap to clone; clones share pending requests and the event channel.
#[derive(Clone)]
pub struct PairingAgent {
    shared: Arc<Shared>,
}

impl PairingAgent {
    pub fn new(config: AgentConfig, registry: Arc<DeviceRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Receive pairing events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.shared.events.subscribe()
    }

    /// Legacy PIN request. Returns the PIN to hand to BlueZ.
    pub async fn on_pin_request(&self, address: &Address) -> Result<String, PairingError> {
        self.admit(address)?;
        let pin = self
            .shared
            .config
            .pin_code
            .clone()
            .unwrap_or_else(random_pin);

        if self.is_trusted(address).await {
            info!("Auto-accepting PIN request from trusted device {}", address);
            self.on_accepted(address).await;
            return Ok(pin);
        }

        let waiter = self.publish(address, RequestKind::PinEntry, Some(pin.clone())).await;
        self.wait(address, waiter).await?;
        Ok(pin)
    }

    /// Passkey request. Returns a fresh passkey in [0, 999999].
    pub async fn on_passkey_request(&self, address: &Address) -> Result<u32, PairingError> {
        self.admit(address)?;
        let passkey = random_passkey();
        let waiter = self
            .publish(address, RequestKind::PasskeyDisplay, Some(format_passkey(passkey)))
            .await;

        if self.shared.config.auto_confirm_passkey || self.is_trusted(address).await {
            debug!("Auto-confirming passkey for {}", address);
            let Waiter { id, mut guard, .. } = waiter;
            guard.armed = false;
            self.shared
                .release(address, Some(id), PairingOutcome::Accepted)
                .await;
            self.on_accepted(address).await;
            return Ok(passkey);
        }

        self.wait(address, waiter).await?;
        Ok(passkey)
    }

    /// BlueZ wants `passkey` shown. Returns immediately.
    pub async fn on_passkey_display(
        &self,
        address: &Address,
        passkey: u32,
        entered: u16,
    ) -> Result<(), PairingError> {
        self.admit(address)?;
        debug!("Displaying passkey for {} ({} digits entered)", address, entered);
        self.publish_display(address, RequestKind::PasskeyDisplay, format_passkey(passkey))
            .await;
        Ok(())
    }

    /// BlueZ wants a legacy `pin` shown. Returns immediately.
    pub async fn on_pin_display(&self, address: &Address, pin: &str) -> Result<(), PairingError> {
        self.admit(address)?;
        self.publish_display(address, RequestKind::PinDisplay, pin.to_string())
            .await;
        Ok(())
    }

    /// Numeric comparison: accept if `passkey` matches on both sides.
    pub async fn on_confirm_request(&self, address: &Address, passkey: u32) -> Result<(), PairingError> {
        self.admit(address)?;
        if self.is_trusted(address).await {
            info!("Auto-confirming trusted device {}", address);
            self.on_accepted(address).await;
            return Ok(());
        }

        let waiter = self
            .publish(address, RequestKind::PasskeyConfirm, Some(format_passkey(passkey)))
            .await;
        self.wait(address, waiter).await
    }

    /// Incoming pairing without any code.
    pub async fn on_authorization_request(&self, address: &Address) -> Result<(), PairingError> {
        self.admit(address)?;
        if self.is_trusted(address).await {
            info!("Auto-authorizing trusted device {}", address);
            self.on_accepted(address).await;
            return Ok(());
        }

        let waiter = self.publish(address, RequestKind::SimpleConfirm, None).await;
        self.wait(address, waiter).await
    }

    /// Service-level authorization. Only trusted devices pass; there is no
    /// manual decision.
    pub async fn on_authorize_service(&self, address: &Address, service: &str) -> Result<(), PairingError> {
        self.admit(address)?;
        if self.is_trusted(address).await {
            debug!("Authorized service {} for {}", service, address);
            Ok(())
        } else {
            info!("Denied service {} for untrusted device {}", service, address);
            Err(PairingError::Unauthorized {
                address: address.to_string(),
                service: service.to_string(),
            })
        }
    }

    /// Cancel whatever is pending for `address`. Idempotent.
    pub async fn cancel(&self, address: &Address) -> bool {
        let cancelled = self
            .shared
            .release(address, None, PairingOutcome::Cancelled)
            .await;
        if cancelled {
            info!("Pairing request for {} cancelled", address);
        }
        cancelled
    }

    /// Cancel every pending request.
    pub async fn cancel_all(&self) {
        let slots: Vec<Slot> = self.shared.slots.lock().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            self.shared.complete(slot, PairingOutcome::Cancelled);
        }
    }

    /// BlueZ reports `address` paired: drop any code still on display.
    pub async fn pairing_completed(&self, address: &Address) -> bool {
        let slot = {
            let mut slots = self.shared.slots.lock().await;
            let displayed = slots
                .get(address)
                .map_or(false, |slot| slot.reply.is_none());
            if displayed {
                slots.remove(address)
            } else {
                None
            }
        };
        match slot {
            Some(slot) => {
                self.shared.complete(slot, PairingOutcome::Accepted);
                true
            }
            None => false,
        }
    }

    /// Decide the pending request for `address`. Returns false if none.
    pub async fn resolve(&self, address: &Address, decision: Decision) -> bool {
        self.shared.release(address, None, decision.into()).await
    }

    pub async fn pending(&self, address: &Address) -> Option<PendingPairingRequest> {
        self.shared.purge_expired().await;
        let slots = self.shared.slots.lock().await;
        slots.get(address).map(|slot| slot.request.clone())
    }

    /// All pending requests, oldest first.
    pub async fn pending_requests(&self) -> Vec<PendingPairingRequest> {
        self.shared.purge_expired().await;
        let slots = self.shared.slots.lock().await;
        let mut requests: Vec<_> = slots.values().map(|slot| slot.request.clone()).collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requests
    }

    /// Wake every waiter as cancelled and reject later callbacks.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("Pairing agent shutting down");
            self.shared.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    fn admit(&self, address: &Address) -> Result<(), PairingError> {
        if self.is_shut_down() {
            return Err(PairingError::Cancelled);
        }
        if self.shared.config.is_denied(address) {
            info!("Rejecting pairing from denied device {}", address);
            return Err(PairingError::Denied(address.to_string()));
        }
        Ok(())
    }

    async fn is_trusted(&self, address: &Address) -> bool {
        self.shared
            .registry
            .lookup(address)
            .await
            .map_or(false, |device| device.trusted)
    }

    /// Record a successful pairing. Registry failures never fail the reply.
    async fn on_accepted(&self, address: &Address) {
        let registry = &self.shared.registry;
        if self.shared.config.auto_trust {
            if let Err(e) = registry.mark_trusted(address, true).await {
                warn!("Failed to persist trust for {}: {}", address, e);
            }
        }
        if let Err(e) = registry.note_paired(address).await {
            warn!("Failed to record pairing for {}: {}", address, e);
        }
    }

    /// Insert a request for `address`, superseding any older one, and
    /// publish it.
    async fn insert(
        &self,
        address: &Address,
        kind: RequestKind,
        value: Option<String>,
        reply: Option<oneshot::Sender<PairingOutcome>>,
    ) -> (u64, Instant) {
        self.shared.purge_expired().await;

        let device_name = match self.shared.registry.lookup(address).await {
            Some(device) => device.display_name().to_string(),
            None => address.to_string(),
        };
        let timeout = self.shared.config.pairing_timeout();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let created_at = Utc::now();
        let request = PendingPairingRequest {
            id,
            address: address.clone(),
            device_name,
            kind,
            value,
            created_at,
            deadline: chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|timeout| created_at.checked_add_signed(timeout))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let now = Instant::now();
        let expires = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(MAX_PAIRING_TIMEOUT_SECS));

        let previous = {
            let mut slots = self.shared.slots.lock().await;
            slots.insert(
                address.clone(),
                Slot {
                    request: request.clone(),
                    expires,
                    reply,
                },
            )
        };
        if let Some(previous) = previous {
            warn!(
                "New {:?} request from {} supersedes pending {:?} request",
                kind, address, previous.request.kind
            );
            self.shared.complete(previous, PairingOutcome::Superseded);
        }

        info!("Pairing request from {}: {:?}", request.device_name, kind);
        let handle = ResolveHandle {
            shared: Arc::downgrade(&self.shared),
            address: address.clone(),
            id,
        };
        self.shared.emit(PairingEvent::Requested(request, handle));

        (id, expires)
    }

    async fn publish(&self, address: &Address, kind: RequestKind, value: Option<String>) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let (id, expires) = self.insert(address, kind, value, Some(tx)).await;
        Waiter {
            id,
            expires,
            reply: rx,
            guard: AbandonGuard {
                shared: self.shared.clone(),
                address: address.clone(),
                id,
                armed: true,
            },
        }
    }

    async fn publish_display(&self, address: &Address, kind: RequestKind, value: String) {
        self.insert(address, kind, Some(value), None).await;
    }

    /// Suspend until the request is decided, expires, or the agent shuts down.
    async fn wait(&self, address: &Address, waiter: Waiter) -> Result<(), PairingError> {
        let Waiter {
            id,
            expires,
            mut reply,
            mut guard,
        } = waiter;

        let outcome = tokio::select! {
            result = &mut reply => result.unwrap_or(PairingOutcome::Cancelled),
            _ = tokio::time::sleep_until(expires) => PairingOutcome::TimedOut,
            _ = self.shared.shutdown.cancelled() => PairingOutcome::Cancelled,
        };
        guard.armed = false;

        let outcome = match outcome {
            // Our own slot may still be there. If a decision raced us, use it.
            PairingOutcome::TimedOut | PairingOutcome::Cancelled => {
                if self.shared.release(address, Some(id), outcome).await {
                    outcome
                } else {
                    reply.try_recv().unwrap_or(outcome)
                }
            }
            other => other,
        };

        match outcome {
            PairingOutcome::Accepted => {
                info!("Pairing with {} accepted", address);
                self.on_accepted(address).await;
            }
            PairingOutcome::TimedOut => info!("Pairing request from {} timed out", address),
            other => debug!("Pairing request from {} not accepted: {:?}", address, other),
        }
        outcome.into_result()
    }
}

/// Render a passkey as six zero-padded digits.
pub fn format_passkey(passkey: u32) -> String {
    format!("{:06}", passkey)
}

fn random_passkey() -> u32 {
    rand::thread_rng().gen_range(0..=999_999)
}

fn random_pin() -> String {
    format_passkey(random_passkey())
}
