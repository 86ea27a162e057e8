//! Native PipeWire backend (`pw-dump` + `wpctl`).

use std::sync::Arc;

use btsink_core::{AudioError, AudioSink, SinkState, VolumeRequest, MAX_VOLUME_PERCENT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::MuteChange;
use crate::runner::{run_checked, CommandRunner};

const SINK_MEDIA_CLASS: &str = "Audio/Sink";
const METADATA_TYPE: &str = "PipeWire:Interface:Metadata";
const DEFAULT_SINK_KEY: &str = "default.audio.sink";

/// A sink node from `pw-dump`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PwNode {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub state: SinkState,
}

/// The parts of a `pw-dump` snapshot we care about.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PwDump {
    pub sinks: Vec<PwNode>,
    pub default_sink_name: Option<String>,
}

impl PwDump {
    pub fn default_sink_id(&self) -> Option<u64> {
        let name = self.default_sink_name.as_deref()?;
        self.sinks.iter().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sinks.iter().any(|n| n.id.to_string() == id)
    }
}

/// Node properties live under `info.props` for nodes and `props` for some
/// other object types.
fn props(obj: &Value) -> Option<&Value> {
    obj.get("info")
        .and_then(|info| info.get("props"))
        .or_else(|| obj.get("props"))
}

fn str_prop<'a>(props: &'a Value, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Extract the sink name from a `default.audio.sink` metadata value.
///
/// Newer PipeWire emits `{"name": "..."}`, older versions a JSON string that
/// itself contains that object.
fn metadata_sink_name(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(inner @ Value::Object(_)) => metadata_sink_name(&inner),
            _ => Some(s.clone()),
        },
        _ => None,
    }
}

/// Parse `pw-dump` JSON output.
pub(crate) fn parse_pw_dump(json: &str) -> Result<PwDump, AudioError> {
    let objects: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| AudioError::backend("pw-dump", format!("invalid JSON: {}", e)))?;

    let mut dump = PwDump::default();

    for obj in &objects {
        if obj.get("type").and_then(Value::as_str) == Some(METADATA_TYPE) {
            let entries = obj
                .get("metadata")
                .or_else(|| obj.get("info").and_then(|i| i.get("metadata")))
                .and_then(Value::as_array);
            for entry in entries.into_iter().flatten() {
                if entry.get("key").and_then(Value::as_str) == Some(DEFAULT_SINK_KEY) {
                    if let Some(name) = entry.get("value").and_then(metadata_sink_name) {
                        dump.default_sink_name = Some(name);
                    }
                }
            }
            continue;
        }

        let Some(props) = props(obj) else { continue };
        if str_prop(props, "media.class") != Some(SINK_MEDIA_CLASS) {
            continue;
        }
        let Some(id) = obj.get("id").and_then(Value::as_u64) else {
            continue;
        };

        let name = str_prop(props, "node.name").unwrap_or_default().to_string();
        let description = str_prop(props, "node.description")
            .or_else(|| str_prop(props, "node.nick"))
            .unwrap_or(name.as_str())
            .to_string();
        let state = obj
            .get("info")
            .and_then(|i| i.get("state"))
            .and_then(Value::as_str)
            .map(SinkState::parse)
            .unwrap_or(SinkState::Unknown);

        dump.sinks.push(PwNode {
            id,
            name,
            description,
            state,
        });
    }

    Ok(dump)
}

/// Parse `wpctl get-volume` output (`Volume: 0.40` or `Volume: 0.40 [MUTED]`).
pub(crate) fn parse_wpctl_volume(output: &str) -> Option<(u32, bool)> {
    let rest = output.trim().strip_prefix("Volume:")?;
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    let percent = (value * 100.0).round().clamp(0.0, MAX_VOLUME_PERCENT as f64) as u32;
    Some((percent, rest.contains("[MUTED]")))
}

/// Find the default sink id in `wpctl status` output.
///
/// The default sink is the entry marked with `*` in the `Sinks:` list of the
/// `Audio` section, e.g. ` │  *   68. Built-in Audio Stereo [vol: 0.40]`.
pub(crate) fn parse_wpctl_status_default(output: &str) -> Option<String> {
    let mut in_audio = false;
    let mut in_sinks = false;

    for line in output.lines() {
        if line.starts_with("Audio") {
            in_audio = true;
            continue;
        }
        if line.starts_with("Video") || line.starts_with("Settings") {
            in_audio = false;
            in_sinks = false;
            continue;
        }
        if !in_audio {
            continue;
        }
        if line.contains("Sinks:") {
            in_sinks = true;
            continue;
        }
        if ["Sources:", "Filters:", "Streams:", "Devices:"]
            .iter()
            .any(|section| line.contains(section))
        {
            in_sinks = false;
            continue;
        }

        if in_sinks {
            if let Some((_, after)) = line.split_once('*') {
                let after = after.trim_start();
                let digits: String = after.chars().take_while(char::is_ascii_digit).collect();
                if !digits.is_empty() && after[digits.len()..].starts_with('.') {
                    return Some(digits);
                }
            }
        }
    }

    None
}

/// PipeWire control through its native tools.
#[derive(Clone)]
pub struct PipeWireBackend {
    runner: Arc<dyn CommandRunner>,
}

impl PipeWireBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn dump(&self) -> Result<PwDump, AudioError> {
        let json = run_checked(self.runner.as_ref(), "pw-dump", &[]).await?;
        parse_pw_dump(&json)
    }

    async fn status_default(&self) -> Option<String> {
        match run_checked(self.runner.as_ref(), "wpctl", &["status"]).await {
            Ok(out) => parse_wpctl_status_default(&out),
            Err(e) => {
                debug!("wpctl status failed: {}", e);
                None
            }
        }
    }

    async fn volume(&self, id: &str) -> Option<(u32, bool)> {
        match run_checked(self.runner.as_ref(), "wpctl", &["get-volume", id]).await {
            Ok(out) => parse_wpctl_volume(&out),
            Err(e) => {
                warn!("Failed to read volume for sink {}: {}", id, e);
                None
            }
        }
    }

    async fn require(&self, id: &str) -> Result<(), AudioError> {
        if self.dump().await?.contains(id) {
            Ok(())
        } else {
            Err(AudioError::NotFound(id.to_string()))
        }
    }

    /// List all `Audio/Sink` nodes.
    pub async fn list_sinks(&self) -> Result<Vec<AudioSink>, AudioError> {
        let dump = self.dump().await?;

        let default_id = match dump.default_sink_id() {
            Some(id) => Some(id.to_string()),
            None => self.status_default().await,
        };

        let mut sinks = Vec::with_capacity(dump.sinks.len());
        for node in dump.sinks {
            let id = node.id.to_string();
            let (volume_percent, muted) = self.volume(&id).await.unwrap_or((100, false));
            sinks.push(AudioSink {
                is_default: default_id.as_deref() == Some(id.as_str()),
                id,
                name: node.name,
                description: node.description,
                volume_percent,
                muted,
                state: node.state,
            });
        }

        Ok(sinks)
    }

    pub async fn set_default_sink(&self, id: &str) -> Result<(), AudioError> {
        self.require(id).await?;
        run_checked(self.runner.as_ref(), "wpctl", &["set-default", id]).await?;
        Ok(())
    }

    pub async fn set_volume(&self, id: &str, request: VolumeRequest) -> Result<(), AudioError> {
        self.require(id).await?;
        // wpctl takes a linear factor; values above 1.0 are software gain.
        let linear = format!("{:.2}", request.linear());
        run_checked(self.runner.as_ref(), "wpctl", &["set-volume", id, &linear]).await?;
        Ok(())
    }

    pub async fn set_mute(&self, id: &str, change: MuteChange) -> Result<(), AudioError> {
        self.require(id).await?;
        run_checked(self.runner.as_ref(), "wpctl", &["set-mute", id, change.as_arg()]).await?;
        Ok(())
    }
}
