//! Control plane detection.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::runner::CommandRunner;

/// Audio control plane in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    PipeWire,
    PulseAudio,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::PipeWire => f.write_str("PipeWire"),
            BackendKind::PulseAudio => f.write_str("PulseAudio"),
        }
    }
}

/// Tools required by the native PipeWire backend.
pub const PIPEWIRE_TOOLS: [&str; 2] = ["pw-dump", "wpctl"];

/// Tool required by the PulseAudio backend.
pub const PULSEAUDIO_TOOL: &str = "pactl";

/// Probe for a supported control plane.
///
/// PipeWire is preferred as the newer standard. Returns `None` when neither
/// plane is present; callers fail closed on every audio operation.
pub fn detect_backend(runner: &dyn CommandRunner) -> Option<BackendKind> {
    if PIPEWIRE_TOOLS.iter().all(|tool| runner.is_available(tool)) {
        info!("Detected PipeWire audio backend");
        Some(BackendKind::PipeWire)
    } else if runner.is_available(PULSEAUDIO_TOOL) {
        info!("Detected PulseAudio backend");
        Some(BackendKind::PulseAudio)
    } else {
        warn!("No supported audio backend found");
        None
    }
}
