//! Sound card profiles through `pactl`.
//!
//! A Bluetooth device shows up as a card whose profile decides whether it
//! plays as a high-quality A2DP sink or as a headset. `pactl` covers both
//! PulseAudio and PipeWire (via pipewire-pulse).

use std::sync::Arc;

use btsink_core::AudioError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::runner::{run_checked, CommandRunner};

/// Modules that make PulseAudio pick up Bluetooth audio devices.
const DISCOVER_MODULES: [&str; 2] = ["module-bluetooth-discover", "module-bluez5-discover"];

/// One selectable card profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardProfile {
    pub name: String,
    pub description: String,
    pub available: bool,
}

/// A sound card and its profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioCard {
    pub name: String,
    pub description: String,
    pub active_profile: Option<String>,
    pub profiles: Vec<CardProfile>,
}

impl AudioCard {
    pub fn is_bluetooth(&self) -> bool {
        self.name.to_ascii_lowercase().contains("bluez")
    }

    pub fn has_a2dp(&self) -> bool {
        self.profiles
            .iter()
            .any(|p| p.name.to_ascii_lowercase().contains("a2dp"))
    }

    pub fn profile(&self, name: &str) -> Option<&CardProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// Whether the host is set up to receive Bluetooth audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BluetoothAudioStatus {
    /// A discover module is loaded or a Bluetooth card is present.
    pub bluetooth_audio_enabled: bool,
    /// Some Bluetooth card offers an A2DP profile.
    pub a2dp_sink_available: bool,
    /// Bluetooth cards only.
    pub cards: Vec<AudioCard>,
}

#[derive(Debug, Deserialize)]
struct PactlCard {
    #[serde(default)]
    name: String,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
    #[serde(default)]
    profiles: serde_json::Map<String, Value>,
    #[serde(default)]
    active_profile: Option<String>,
}

/// Parse `pactl -f json list cards`.
pub(crate) fn parse_cards_json(json: &str) -> Result<Vec<AudioCard>, AudioError> {
    let raw: Vec<PactlCard> = serde_json::from_str(json)
        .map_err(|e| AudioError::backend("pactl -f json list cards", format!("invalid JSON: {}", e)))?;

    Ok(raw
        .into_iter()
        .map(|card| AudioCard {
            description: card
                .properties
                .get("device.description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            profiles: card
                .profiles
                .iter()
                .map(|(name, profile)| CardProfile {
                    name: name.clone(),
                    description: profile
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    available: profile
                        .get("available")
                        .and_then(Value::as_bool)
                        .unwrap_or(true),
                })
                .collect(),
            active_profile: card.active_profile.filter(|p| !p.is_empty()),
            name: card.name,
        })
        .collect())
}

/// Parse the human-readable `pactl list cards` output.
pub(crate) fn parse_cards_text(output: &str) -> Vec<AudioCard> {
    #[derive(PartialEq)]
    enum Section {
        Other,
        Properties,
        Profiles,
    }

    let mut cards = Vec::new();
    let mut current: Option<AudioCard> = None;
    let mut section = Section::Other;

    for raw in output.lines() {
        if raw.starts_with("Card #") {
            cards.extend(current.take());
            current = Some(AudioCard {
                name: String::new(),
                description: String::new(),
                active_profile: None,
                profiles: Vec::new(),
            });
            section = Section::Other;
            continue;
        }
        let Some(card) = current.as_mut() else { continue };

        let nested = raw.starts_with("\t\t");
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if !nested {
            section = match line {
                "Properties:" => Section::Properties,
                "Profiles:" => Section::Profiles,
                _ => Section::Other,
            };
            if let Some(name) = line.strip_prefix("Name:") {
                card.name = name.trim().to_string();
            } else if let Some(active) = line.strip_prefix("Active Profile:") {
                card.active_profile = Some(active.trim().to_string()).filter(|p| !p.is_empty());
            }
            continue;
        }

        match section {
            Section::Properties => {
                if let Some(value) = line.strip_prefix("device.description =") {
                    card.description = value.trim().trim_matches('"').to_string();
                }
            }
            Section::Profiles => {
                // "a2dp_sink: High Fidelity Playback (A2DP Sink) (sinks: 1, ..., available: yes)"
                if let Some((name, rest)) = line.split_once(": ") {
                    let description = match rest.rfind(" (sinks:") {
                        Some(end) => &rest[..end],
                        None => rest,
                    };
                    card.profiles.push(CardProfile {
                        name: name.to_string(),
                        description: description.to_string(),
                        available: !rest.contains("available: no"),
                    });
                }
            }
            Section::Other => {}
        }
    }
    cards.extend(current);

    cards
}

/// Module names from `pactl list short modules` (`index\tname\targs`).
pub(crate) fn parse_short_module_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Card queries and profile switching.
#[derive(Clone)]
pub struct CardControl {
    runner: Arc<dyn CommandRunner>,
}

impl CardControl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn pactl(&self, args: &[&str]) -> Result<String, AudioError> {
        run_checked(self.runner.as_ref(), "pactl", args).await
    }

    /// List all cards, preferring JSON output when this pactl supports it.
    pub async fn list_cards(&self) -> Result<Vec<AudioCard>, AudioError> {
        match self
            .pactl(&["-f", "json", "list", "cards"])
            .await
            .and_then(|out| parse_cards_json(&out))
        {
            Ok(cards) => Ok(cards),
            Err(AudioError::Unavailable) => Err(AudioError::Unavailable),
            Err(e) => {
                debug!("Falling back to text card listing: {}", e);
                let out = self.pactl(&["list", "cards"]).await?;
                Ok(parse_cards_text(&out))
            }
        }
    }

    pub async fn bluetooth_audio_status(&self) -> Result<BluetoothAudioStatus, AudioError> {
        let cards: Vec<AudioCard> = self
            .list_cards()
            .await?
            .into_iter()
            .filter(AudioCard::is_bluetooth)
            .collect();

        let discover_loaded = match self.pactl(&["list", "short", "modules"]).await {
            Ok(out) => parse_short_module_names(&out)
                .iter()
                .any(|name| DISCOVER_MODULES.contains(&name.as_str())),
            Err(AudioError::Unavailable) => return Err(AudioError::Unavailable),
            Err(e) => {
                debug!("Could not list modules: {}", e);
                false
            }
        };

        Ok(BluetoothAudioStatus {
            bluetooth_audio_enabled: discover_loaded || !cards.is_empty(),
            a2dp_sink_available: cards.iter().any(AudioCard::has_a2dp),
            cards,
        })
    }

    /// Switch `card` to `profile`. Both must exist; nothing changes otherwise.
    pub async fn set_card_profile(&self, card: &str, profile: &str) -> Result<(), AudioError> {
        let cards = self.list_cards().await?;
        let found = cards
            .iter()
            .find(|c| c.name == card)
            .ok_or_else(|| AudioError::NotFound(card.to_string()))?;
        if found.profile(profile).is_none() {
            return Err(AudioError::UnknownProfile {
                card: card.to_string(),
                profile: profile.to_string(),
            });
        }

        self.pactl(&["set-card-profile", card, profile]).await?;
        info!("Card {} profile set to {}", card, profile);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use crate::test_support::ScriptedRunner;

    pub(crate) const BT_CARD: &str = "bluez_card.AA_BB_CC_DD_EE_FF";

    const CARDS_JSON: &str = r#"[
        {
            "index": 0,
            "name": "alsa_card.platform-bcm2835_audio",
            "driver": "module-alsa-card.c",
            "properties": { "device.description": "Built-in Audio" },
            "profiles": {
                "output:stereo-fallback": { "description": "Stereo Output", "sinks": 1, "sources": 0, "priority": 5100, "available": true },
                "off": { "description": "Off", "sinks": 0, "sources": 0, "priority": 0, "available": true }
            },
            "active_profile": "output:stereo-fallback"
        },
        {
            "index": 3,
            "name": "bluez_card.AA_BB_CC_DD_EE_FF",
            "driver": "module-bluez5-device.c",
            "properties": { "device.description": "Test Phone" },
            "profiles": {
                "a2dp_sink": { "description": "High Fidelity Playback (A2DP Sink)", "sinks": 1, "sources": 0, "priority": 40, "available": true },
                "headset_head_unit": { "description": "Headset Head Unit (HSP/HFP)", "sinks": 1, "sources": 1, "priority": 30, "available": false },
                "off": { "description": "Off", "sinks": 0, "sources": 0, "priority": 0, "available": true }
            },
            "active_profile": "a2dp_sink"
        }
    ]"#;

    const CARDS_TEXT: &str = "Card #3
\tName: bluez_card.AA_BB_CC_DD_EE_FF
\tDriver: module-bluez5-device.c
\tOwner Module: 26
\tProperties:
\t\tdevice.description = \"Test Phone\"
\t\tdevice.bus = \"bluetooth\"
\tProfiles:
\t\ta2dp_sink: High Fidelity Playback (A2DP Sink) (sinks: 1, sources: 0, priority: 40, available: yes)
\t\theadset_head_unit: Headset Head Unit (HSP/HFP) (sinks: 1, sources: 1, priority: 30, available: no)
\t\toff: Off (sinks: 0, sources: 0, priority: 0, available: yes)
\tActive Profile: a2dp_sink
\tPorts:
\t\theadset-output: Headset (type: Headset, priority: 0, latency offset: 0 usec, available)
";

    pub(crate) fn scripted() -> ScriptedRunner {
        ScriptedRunner::new(&["pactl"])
            .respond("pactl -f json list cards", CommandOutput::ok(CARDS_JSON))
            .respond(
                "pactl list short modules",
                CommandOutput::ok("0\tmodule-device-restore\t\n26\tmodule-bluez5-discover\t\n"),
            )
    }

    mod parsing {
        use super::*;

        #[test]
        fn json_cards() {
            let cards = parse_cards_json(CARDS_JSON).unwrap();
            assert_eq!(cards.len(), 2);
            assert!(!cards[0].is_bluetooth());

            let bt = &cards[1];
            assert!(bt.is_bluetooth());
            assert!(bt.has_a2dp());
            assert_eq!(bt.description, "Test Phone");
            assert_eq!(bt.active_profile.as_deref(), Some("a2dp_sink"));
            assert!(!bt.profile("headset_head_unit").unwrap().available);
        }

        #[test]
        fn text_cards() {
            let cards = parse_cards_text(CARDS_TEXT);
            assert_eq!(cards.len(), 1);

            let card = &cards[0];
            assert_eq!(card.name, BT_CARD);
            assert_eq!(card.description, "Test Phone");
            assert_eq!(card.active_profile.as_deref(), Some("a2dp_sink"));
            assert_eq!(card.profiles.len(), 3);
            assert_eq!(card.profiles[0].description, "High Fidelity Playback (A2DP Sink)");
            assert!(!card.profiles[1].available);
        }

        #[test]
        fn module_names() {
            let names = parse_short_module_names("0\tmodule-a\targ=1\n1\tmodule-b\t\n");
            assert_eq!(names, ["module-a", "module-b"]);
        }
    }

    mod control {
        use super::*;

        #[tokio::test]
        async fn status_reports_bluetooth_cards() {
            let control = CardControl::new(Arc::new(scripted()));
            let status = control.bluetooth_audio_status().await.unwrap();

            assert!(status.bluetooth_audio_enabled);
            assert!(status.a2dp_sink_available);
            assert_eq!(status.cards.len(), 1);
            assert_eq!(status.cards[0].name, BT_CARD);
        }

        #[tokio::test]
        async fn falls_back_to_text_listing() {
            let runner = ScriptedRunner::new(&["pactl"])
                .respond("pactl -f json list cards", CommandOutput::failed(1, "unknown option -f"))
                .respond("pactl list cards", CommandOutput::ok(CARDS_TEXT));
            let control = CardControl::new(Arc::new(runner));

            let cards = control.list_cards().await.unwrap();
            assert_eq!(cards.len(), 1);
        }

        #[tokio::test]
        async fn switches_profile() {
            let runner = Arc::new(scripted().respond(
                &format!("pactl set-card-profile {} headset_head_unit", BT_CARD),
                CommandOutput::ok(""),
            ));
            let control = CardControl::new(runner.clone());

            control.set_card_profile(BT_CARD, "headset_head_unit").await.unwrap();
            assert!(runner.was_called("pactl set-card-profile"));
        }

        #[tokio::test]
        async fn unknown_card_or_profile_changes_nothing() {
            let runner = Arc::new(scripted());
            let control = CardControl::new(runner.clone());

            assert_eq!(
                control.set_card_profile("bluez_card.00_00", "a2dp_sink").await.unwrap_err(),
                AudioError::NotFound("bluez_card.00_00".to_string())
            );
            assert!(matches!(
                control.set_card_profile(BT_CARD, "a2dp_source").await.unwrap_err(),
                AudioError::UnknownProfile { .. }
            ));
            assert!(!runner.was_called("pactl set-card-profile"));
        }

        #[tokio::test]
        async fn missing_pactl_is_unavailable() {
            let control = CardControl::new(Arc::new(ScriptedRunner::new(&[])));
            assert_eq!(control.list_cards().await.unwrap_err(), AudioError::Unavailable);
        }
    }
}
