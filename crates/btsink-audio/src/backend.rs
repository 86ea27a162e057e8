//! One interface over the supported control planes.

use std::sync::Arc;

use btsink_core::{AudioError, AudioSink, VolumeRequest};

use crate::detect::BackendKind;
use crate::pipewire::PipeWireBackend;
use crate::pulseaudio::PulseAudioBackend;
use crate::runner::CommandRunner;

/// Requested mute change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteChange {
    Set(bool),
    Toggle,
}

impl MuteChange {
    /// Argument understood by both `wpctl set-mute` and `pactl set-sink-mute`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            MuteChange::Set(true) => "1",
            MuteChange::Set(false) => "0",
            MuteChange::Toggle => "toggle",
        }
    }
}

/// The control plane selected at startup.
#[derive(Clone)]
pub enum AudioBackend {
    PipeWire(PipeWireBackend),
    PulseAudio(PulseAudioBackend),
}

impl AudioBackend {
    /// Build the backend for a detected control plane.
    pub fn new(kind: BackendKind, runner: Arc<dyn CommandRunner>) -> Self {
        match kind {
            BackendKind::PipeWire => AudioBackend::PipeWire(PipeWireBackend::new(runner)),
            BackendKind::PulseAudio => AudioBackend::PulseAudio(PulseAudioBackend::new(runner)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            AudioBackend::PipeWire(_) => BackendKind::PipeWire,
            AudioBackend::PulseAudio(_) => BackendKind::PulseAudio,
        }
    }

    /// Whether volumes above 100% can be applied as software gain.
    ///
    /// Both `wpctl` and `pactl` accept boosted volumes.
    pub fn supports_boost(&self) -> bool {
        match self {
            AudioBackend::PipeWire(_) | AudioBackend::PulseAudio(_) => true,
        }
    }

    pub async fn list_sinks(&self) -> Result<Vec<AudioSink>, AudioError> {
        match self {
            AudioBackend::PipeWire(b) => b.list_sinks().await,
            AudioBackend::PulseAudio(b) => b.list_sinks().await,
        }
    }

    pub async fn set_default_sink(&self, id: &str) -> Result<(), AudioError> {
        match self {
            AudioBackend::PipeWire(b) => b.set_default_sink(id).await,
            AudioBackend::PulseAudio(b) => b.set_default_sink(id).await,
        }
    }

    pub async fn set_volume(&self, id: &str, request: VolumeRequest) -> Result<(), AudioError> {
        match self {
            AudioBackend::PipeWire(b) => b.set_volume(id, request).await,
            AudioBackend::PulseAudio(b) => b.set_volume(id, request).await,
        }
    }

    pub async fn set_mute(&self, id: &str, change: MuteChange) -> Result<(), AudioError> {
        match self {
            AudioBackend::PipeWire(b) => b.set_mute(id, change).await,
            AudioBackend::PulseAudio(b) => b.set_mute(id, change).await,
        }
    }
}
