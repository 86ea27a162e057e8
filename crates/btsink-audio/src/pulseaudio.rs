//! PulseAudio backend (`pactl`).
//!
//! Also works against PipeWire through pipewire-pulse, but is only selected
//! when the native PipeWire tools are missing.

use std::sync::Arc;

use btsink_core::{AudioError, AudioSink, SinkState, VolumeRequest, MAX_VOLUME_PERCENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::backend::MuteChange;
use crate::runner::{run_checked, CommandRunner};

#[derive(Debug, Deserialize)]
struct PactlSink {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    mute: bool,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    volume: Option<serde_json::Map<String, Value>>,
}

/// Parse a `"65%"` style percentage.
fn parse_percent(s: &str) -> Option<f64> {
    s.trim().strip_suffix('%')?.trim().parse().ok()
}

fn clamp_percent(value: f64) -> u32 {
    value.round().clamp(0.0, MAX_VOLUME_PERCENT as f64) as u32
}

/// Average of the per-channel `value_percent` entries.
fn average_volume(channels: &serde_json::Map<String, Value>) -> Option<u32> {
    let values: Vec<f64> = channels
        .values()
        .filter_map(|ch| ch.get("value_percent").and_then(Value::as_str))
        .filter_map(parse_percent)
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(clamp_percent(values.iter().sum::<f64>() / values.len() as f64))
}

/// Parse `pactl -f json list sinks`.
pub(crate) fn parse_pactl_json(json: &str, default_sink: Option<&str>) -> Result<Vec<AudioSink>, AudioError> {
    let raw: Vec<PactlSink> = serde_json::from_str(json)
        .map_err(|e| AudioError::backend("pactl -f json list sinks", format!("invalid JSON: {}", e)))?;

    Ok(raw
        .into_iter()
        .map(|sink| {
            let name = if sink.name.is_empty() {
                sink.index.to_string()
            } else {
                sink.name
            };
            AudioSink {
                id: name.clone(),
                is_default: default_sink == Some(name.as_str()),
                volume_percent: sink.volume.as_ref().and_then(average_volume).unwrap_or(100),
                muted: sink.mute,
                state: sink.state.as_deref().map(SinkState::parse).unwrap_or(SinkState::Unknown),
                description: sink.description,
                name,
            }
        })
        .collect())
}

/// Parse the human-readable `pactl list sinks` output.
pub(crate) fn parse_pactl_text(output: &str, default_sink: Option<&str>) -> Vec<AudioSink> {
    fn finish(sink: Option<AudioSink>, default_sink: Option<&str>, sinks: &mut Vec<AudioSink>) {
        if let Some(mut sink) = sink {
            sink.id = sink.name.clone();
            sink.is_default = default_sink == Some(sink.name.as_str());
            sinks.push(sink);
        }
    }

    let mut sinks = Vec::new();
    let mut current: Option<AudioSink> = None;

    for line in output.lines() {
        let line = line.trim();

        if let Some(index) = line.strip_prefix("Sink #") {
            finish(current.take(), default_sink, &mut sinks);
            current = Some(AudioSink {
                id: String::new(),
                name: index.trim().to_string(),
                description: String::new(),
                is_default: false,
                volume_percent: 100,
                muted: false,
                state: SinkState::Unknown,
            });
            continue;
        }

        let Some(sink) = current.as_mut() else { continue };

        if let Some(name) = line.strip_prefix("Name:") {
            sink.name = name.trim().to_string();
        } else if let Some(description) = line.strip_prefix("Description:") {
            sink.description = description.trim().to_string();
        } else if let Some(state) = line.strip_prefix("State:") {
            sink.state = SinkState::parse(state);
        } else if let Some(mute) = line.strip_prefix("Mute:") {
            sink.muted = mute.trim().eq_ignore_ascii_case("yes");
        } else if let Some(volume) = line.strip_prefix("Volume:") {
            // "front-left: 65536 / 100% / 0.00 dB, ..." - take the first percentage.
            if let Some(percent) = volume
                .split('/')
                .map(str::trim)
                .find(|part| part.ends_with('%'))
                .and_then(parse_percent)
            {
                sink.volume_percent = clamp_percent(percent);
            }
        }
    }
    finish(current, default_sink, &mut sinks);

    sinks
}

/// Sink names from `pactl list short sinks` (`index\tname\tdriver\t...`).
pub(crate) fn parse_short_sink_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// PulseAudio control through `pactl`.
#[derive(Clone)]
pub struct PulseAudioBackend {
    runner: Arc<dyn CommandRunner>,
}

impl PulseAudioBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn pactl(&self, args: &[&str]) -> Result<String, AudioError> {
        run_checked(self.runner.as_ref(), "pactl", args).await
    }

    async fn default_sink_name(&self) -> Option<String> {
        match self.pactl(&["get-default-sink"]).await {
            Ok(out) => Some(out.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                debug!("pactl get-default-sink failed: {}", e);
                None
            }
        }
    }

    async fn require(&self, id: &str) -> Result<(), AudioError> {
        let out = self.pactl(&["list", "short", "sinks"]).await?;
        if parse_short_sink_names(&out).iter().any(|name| name == id) {
            Ok(())
        } else {
            Err(AudioError::NotFound(id.to_string()))
        }
    }

    /// List all sinks, preferring JSON output when this pactl supports it.
    pub async fn list_sinks(&self) -> Result<Vec<AudioSink>, AudioError> {
        let default_sink = self.default_sink_name().await;

        let json = self.pactl(&["-f", "json", "list", "sinks"]).await;
        match json.and_then(|out| parse_pactl_json(&out, default_sink.as_deref())) {
            Ok(sinks) => Ok(sinks),
            Err(AudioError::Unavailable) => Err(AudioError::Unavailable),
            Err(e) => {
                debug!("Falling back to text sink listing: {}", e);
                let out = self.pactl(&["list", "sinks"]).await?;
                Ok(parse_pactl_text(&out, default_sink.as_deref()))
            }
        }
    }

    pub async fn set_default_sink(&self, id: &str) -> Result<(), AudioError> {
        self.require(id).await?;
        self.pactl(&["set-default-sink", id]).await?;
        Ok(())
    }

    pub async fn set_volume(&self, id: &str, request: VolumeRequest) -> Result<(), AudioError> {
        self.require(id).await?;
        // pactl percentages above 100 are applied as software gain.
        let percent = format!("{}%", request.applied_percent);
        self.pactl(&["set-sink-volume", id, &percent]).await?;
        Ok(())
    }

    pub async fn set_mute(&self, id: &str, change: MuteChange) -> Result<(), AudioError> {
        self.require(id).await?;
        self.pactl(&["set-sink-mute", id, change.as_arg()]).await?;
        Ok(())
    }
}
