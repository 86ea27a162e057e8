//! Audio output sink representation and volume mapping.

use serde::Serialize;

/// Highest volume accepted, including software boost.
pub const MAX_VOLUME_PERCENT: u32 = 150;

/// Top of the control plane's native (unboosted) range.
pub const NATIVE_MAX_PERCENT: u32 = 100;

/// Sink state as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkState {
    Running,
    Idle,
    Suspended,
    Unknown,
}

impl SinkState {
    /// Parse a state string from `pactl` (e.g. "RUNNING", "idle").
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => SinkState::Running,
            "idle" => SinkState::Idle,
            "suspended" => SinkState::Suspended,
            _ => SinkState::Unknown,
        }
    }
}

/// An addressable audio output endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioSink {
    /// Backend-assigned id (PipeWire node id, PulseAudio sink name).
    pub id: String,
    /// Backend node name (e.g. "bluez_output.AA_BB_CC_DD_EE_FF.1").
    pub name: String,
    /// Human-readable description.
    pub description: String,
    pub is_default: bool,
    /// Volume in percent, within [0, 150].
    pub volume_percent: u32,
    pub muted: bool,
    pub state: SinkState,
}

impl AudioSink {
    /// Get a user-friendly display name.
    pub fn display_name(&self) -> &str {
        if self.description.is_empty() {
            &self.name
        } else {
            &self.description
        }
    }

    /// Whether this sink is backed by a Bluetooth device.
    pub fn is_bluetooth(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        name.contains("bluez") || name.contains("bluetooth")
    }
}

/// A volume change mapped onto a control plane's native range.
///
/// The requested percent is clamped to [0, 150]. The native part never
/// exceeds 100; anything above is expressed as a linear gain on top of it.
/// When the backend cannot boost, the request degrades to 100%.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRequest {
    /// Percent that will actually be applied.
    pub applied_percent: u32,
    /// Native volume, within [0, 100].
    pub native_percent: u32,
    /// Linear gain layered on the native volume (1.0 when not boosting).
    pub boost_gain: f64,
}

impl VolumeRequest {
    pub fn new(percent: i32, supports_boost: bool) -> Self {
        let clamped = percent.clamp(0, MAX_VOLUME_PERCENT as i32) as u32;
        let native_percent = clamped.min(NATIVE_MAX_PERCENT);

        if supports_boost && clamped > NATIVE_MAX_PERCENT {
            Self {
                applied_percent: clamped,
                native_percent,
                boost_gain: clamped as f64 / NATIVE_MAX_PERCENT as f64,
            }
        } else {
            Self {
                applied_percent: native_percent,
                native_percent,
                boost_gain: 1.0,
            }
        }
    }

    /// Applied volume as a linear factor (1.0 == 100%).
    pub fn linear(&self) -> f64 {
        self.native_percent as f64 / NATIVE_MAX_PERCENT as f64 * self.boost_gain
    }

    pub fn is_boosted(&self) -> bool {
        self.boost_gain > 1.0
    }
}
