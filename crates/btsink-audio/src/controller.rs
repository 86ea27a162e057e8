//! Task-dispatched, per-sink serialized access to the active backend.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use btsink_core::{AudioError, AudioSink, VolumeRequest, NATIVE_MAX_PERCENT};
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{AudioBackend, MuteChange};
use crate::cards::{AudioCard, BluetoothAudioStatus, CardControl};
use crate::detect::{detect_backend, BackendKind};
use crate::runner::{CommandRunner, DEFAULT_COMMAND_TIMEOUT};

/// Audio control settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Allow volumes above 100% when the backend can boost.
    pub allow_boost: bool,
    /// Detect the control plane again after it disappears.
    ///
    /// Off by default: a missing backend keeps failing until restart.
    pub redetect: bool,
    /// Seconds a `pactl`/`wpctl` call may take before it is killed.
    pub command_timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            allow_boost: true,
            redetect: false,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

impl AudioConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

struct Inner {
    runner: Arc<dyn CommandRunner>,
    config: AudioConfig,
    backend: RwLock<Option<AudioBackend>>,
    sink_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Inner {
    /// Lock `id`. Locks nobody holds or waits on are dropped on the way.
    async fn lock_sink(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.sink_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn active_backend(&self) -> Result<AudioBackend, AudioError> {
        if let Some(backend) = self.backend.read().await.as_ref() {
            return Ok(backend.clone());
        }
        if !self.config.redetect {
            return Err(AudioError::Unavailable);
        }

        let mut slot = self.backend.write().await;
        if slot.is_none() {
            debug!("Re-probing audio control plane");
            *slot = detect_backend(self.runner.as_ref())
                .map(|kind| AudioBackend::new(kind, self.runner.clone()));
        }
        slot.clone().ok_or(AudioError::Unavailable)
    }

    async fn backend_lost(&self) {
        if self.config.redetect {
            let mut slot = self.backend.write().await;
            if let Some(backend) = slot.take() {
                warn!("{} control plane disappeared, will detect it again", backend.kind());
            }
        }
    }
}

/// Normalized audio control surface.
///
/// Cheap to clone; all clones share the selected backend.
#[derive(Clone)]
pub struct AudioController {
    inner: Arc<Inner>,
}

impl AudioController {
    /// Detect the control plane once and build the controller.
    ///
    /// Never fails: without a control plane every operation returns
    /// [`AudioError::Unavailable`] and the rest of the process keeps running.
    pub fn start(runner: Arc<dyn CommandRunner>, config: AudioConfig) -> Self {
        let backend =
            detect_backend(runner.as_ref()).map(|kind| AudioBackend::new(kind, runner.clone()));
        Self::with_backend(runner, config, backend)
    }

    /// Build a controller around an already selected backend.
    pub fn with_backend(
        runner: Arc<dyn CommandRunner>,
        config: AudioConfig,
        backend: Option<AudioBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                backend: RwLock::new(backend),
                sink_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn backend_kind(&self) -> Option<BackendKind> {
        self.inner.backend.read().await.as_ref().map(AudioBackend::kind)
    }

    pub fn config(&self) -> &AudioConfig {
        &self.inner.config
    }

    /// Run `fut` on its own task, holding the lock for `key` if given.
    async fn run_locked<T, Fut>(&self, key: Option<String>, fut: Fut) -> Result<T, AudioError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, AudioError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _guard = match &key {
                Some(key) => Some(inner.lock_sink(key).await),
                None => None,
            };
            fut.await
        });

        task.await
            .map_err(|e| AudioError::backend("audio task", e.to_string()))?
    }

    /// Run `op` against the backend on its own task.
    ///
    /// Operations naming a sink hold that sink's lock for their whole
    /// duration; operations on different sinks run concurrently.
    async fn dispatch<T, F, Fut>(&self, sink: Option<&str>, op: F) -> Result<T, AudioError>
    where
        T: Send + 'static,
        F: FnOnce(AudioBackend, bool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, AudioError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.run_locked(sink.map(str::to_string), async move {
            let backend = inner.active_backend().await?;
            let boost = inner.config.allow_boost && backend.supports_boost();

            let result = op(backend, boost).await;
            if matches!(result, Err(AudioError::Unavailable)) {
                inner.backend_lost().await;
            }
            result
        })
        .await
    }

    fn cards(&self) -> CardControl {
        CardControl::new(self.inner.runner.clone())
    }

    /// Query all sinks from the live backend.
    pub async fn list_sinks(&self) -> Result<Vec<AudioSink>, AudioError> {
        self.dispatch(None, |backend, _| async move { backend.list_sinks().await })
            .await
    }

    /// The current default sink, if the backend reports one.
    pub async fn default_sink(&self) -> Result<Option<AudioSink>, AudioError> {
        Ok(self.list_sinks().await?.into_iter().find(|s| s.is_default))
    }

    /// Sinks backed by Bluetooth devices.
    pub async fn bluetooth_sinks(&self) -> Result<Vec<AudioSink>, AudioError> {
        Ok(self
            .list_sinks()
            .await?
            .into_iter()
            .filter(AudioSink::is_bluetooth)
            .collect())
    }

    pub async fn set_default_sink(&self, id: &str) -> Result<(), AudioError> {
        let owned = id.to_string();
        self.dispatch(Some(id), move |backend, _| async move {
            backend.set_default_sink(&owned).await
        })
        .await?;
        info!("Default sink set to: {}", id);
        Ok(())
    }

    /// Set a sink's volume, returning the percent actually applied.
    ///
    /// `percent` is clamped to [0, 150]. Values above 100 need boost support
    /// and otherwise degrade to 100.
    pub async fn set_volume(&self, id: &str, percent: i32) -> Result<u32, AudioError> {
        let owned = id.to_string();
        let applied = self
            .dispatch(Some(id), move |backend, boost| async move {
                let request = VolumeRequest::new(percent, boost);
                if percent > NATIVE_MAX_PERCENT as i32 && !request.is_boosted() {
                    debug!("Volume boost unavailable, capping {}% at {}%", percent, request.applied_percent);
                }
                backend.set_volume(&owned, request).await?;
                Ok(request.applied_percent)
            })
            .await?;
        info!("Volume set to {}% for {}", applied, id);
        Ok(applied)
    }

    pub async fn set_mute(&self, id: &str, muted: bool) -> Result<(), AudioError> {
        self.mute(id, MuteChange::Set(muted)).await?;
        info!("Sink {} mute: {}", id, muted);
        Ok(())
    }

    pub async fn toggle_mute(&self, id: &str) -> Result<(), AudioError> {
        self.mute(id, MuteChange::Toggle).await
    }

    /// All sound cards with their profiles.
    pub async fn list_cards(&self) -> Result<Vec<AudioCard>, AudioError> {
        let cards = self.cards();
        self.run_locked(None, async move { cards.list_cards().await })
            .await
    }

    pub async fn bluetooth_audio_status(&self) -> Result<BluetoothAudioStatus, AudioError> {
        let cards = self.cards();
        self.run_locked(None, async move { cards.bluetooth_audio_status().await })
            .await
    }

    /// Switch a card's profile, e.g. between A2DP and headset mode.
    pub async fn set_card_profile(&self, card: &str, profile: &str) -> Result<(), AudioError> {
        let cards = self.cards();
        let (card, profile) = (card.to_string(), profile.to_string());
        self.run_locked(Some(format!("card:{}", card)), async move {
            cards.set_card_profile(&card, &profile).await
        })
        .await
    }

    async fn mute(&self, id: &str, change: MuteChange) -> Result<(), AudioError> {
        let owned = id.to_string();
        self.dispatch(Some(id), move |backend, _| async move {
            backend.set_mute(&owned, change).await
        })
        .await
    }
}
