//! Line-based operator console on stdin.
//!
//! Lets whoever runs the daemon in a terminal answer pairing requests and
//! manage devices and audio without a UI.

use std::fmt::Write as _;
use std::sync::Arc;

use btsink_audio::AudioController;
use btsink_bluetooth::{Decision, DeviceManager, PairingAgent};
use btsink_core::Address;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const HELP: &str = "\
commands:
  devices                    known devices
  pending                    pending pairing requests
  accept <addr>              accept a pairing request
  reject <addr>              reject a pairing request
  disconnect <addr>          disconnect without reconnecting
  forget <addr>              unpair and forget
  sinks                      audio outputs
  default <sink>             make a sink the default output
  volume <sink> <percent>    set volume (0-150)
  mute <sink> [on|off|toggle]
  cards                      sound cards and profiles
  profile <card> <profile>   switch a card profile
  status                     Bluetooth audio status
  help";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Devices,
    Pending,
    Decide(Address, Decision),
    Disconnect(Address),
    Forget(Address),
    Sinks,
    Default(String),
    Volume(String, i32),
    Mute(String, Option<bool>),
    Cards,
    Profile(String, String),
    Status,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["help"] | ["?"] => Command::Help,
            ["devices"] => Command::Devices,
            ["pending"] => Command::Pending,
            ["accept", addr] => Command::Decide(Address::new(*addr), Decision::Accept),
            ["reject", addr] => Command::Decide(Address::new(*addr), Decision::Reject),
            ["disconnect", addr] => Command::Disconnect(Address::new(*addr)),
            ["forget", addr] => Command::Forget(Address::new(*addr)),
            ["sinks"] => Command::Sinks,
            ["default", sink] => Command::Default(sink.to_string()),
            ["volume", sink, percent] => {
                let percent = percent
                    .trim_end_matches('%')
                    .parse()
                    .map_err(|_| format!("not a volume: {}", percent))?;
                Command::Volume(sink.to_string(), percent)
            }
            ["mute", sink] => Command::Mute(sink.to_string(), Some(true)),
            ["mute", sink, "on"] => Command::Mute(sink.to_string(), Some(true)),
            ["mute", sink, "off"] => Command::Mute(sink.to_string(), Some(false)),
            ["mute", sink, "toggle"] => Command::Mute(sink.to_string(), None),
            ["cards"] => Command::Cards,
            ["profile", card, profile] => Command::Profile(card.to_string(), profile.to_string()),
            ["status"] => Command::Status,
            [] => return Err("empty command".to_string()),
            [name, ..] => return Err(format!("unknown command or arguments: {} (try help)", name)),
        };
        Ok(command)
    }
}

/// Everything the console acts on.
#[derive(Clone)]
pub struct Console {
    agent: PairingAgent,
    devices: Arc<DeviceManager>,
    audio: AudioController,
}

impl Console {
    pub fn new(agent: PairingAgent, devices: Arc<DeviceManager>, audio: AudioController) -> Self {
        Self {
            agent,
            devices,
            audio,
        }
    }

    /// Run one command and return what to show.
    pub async fn execute(&self, command: Command) -> String {
        match command {
            Command::Help => HELP.to_string(),
            Command::Devices => {
                let devices = self.devices.registry().list_devices().await;
                if devices.is_empty() {
                    return "no known devices".to_string();
                }
                let mut out = String::new();
                for d in devices {
                    let _ = writeln!(
                        out,
                        "{}  {:<24} {}{}{}",
                        d.address,
                        d.display_name(),
                        if d.trusted { "trusted " } else { "" },
                        if d.paired { "paired " } else { "" },
                        if d.connected { "connected" } else { "" },
                    );
                }
                out.trim_end().to_string()
            }
            Command::Pending => {
                let requests = self.agent.pending_requests().await;
                if requests.is_empty() {
                    return "no pending requests".to_string();
                }
                let mut out = String::new();
                for r in requests {
                    let _ = writeln!(
                        out,
                        "{}  {:<24} {:?} {} until {}",
                        r.address,
                        r.device_name,
                        r.kind,
                        r.value.as_deref().unwrap_or("-"),
                        r.deadline.format("%H:%M:%S"),
                    );
                }
                out.trim_end().to_string()
            }
            Command::Decide(address, decision) => {
                if self.agent.resolve(&address, decision).await {
                    format!("{:?}: {}", decision, address)
                } else {
                    format!("no pending request for {}", address)
                }
            }
            Command::Disconnect(address) => match self.devices.disconnect(&address).await {
                Ok(()) => format!("disconnected {}", address),
                Err(e) => format!("error: {}", e),
            },
            Command::Forget(address) => match self.devices.remove(&address).await {
                Ok(Some(device)) => format!("forgot {}", device.display_name()),
                Ok(None) => format!("removed {} (no local record)", address),
                Err(e) => format!("error: {}", e),
            },
            Command::Sinks => match self.audio.list_sinks().await {
                Ok(sinks) if sinks.is_empty() => "no sinks".to_string(),
                Ok(sinks) => sinks
                    .iter()
                    .map(|s| {
                        format!(
                            "{} {:<6} {:<32} {}%{}",
                            if s.is_default { "*" } else { " " },
                            s.id,
                            s.display_name(),
                            s.volume_percent,
                            if s.muted { " muted" } else { "" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("error: {}", e),
            },
            Command::Default(sink) => match self.audio.set_default_sink(&sink).await {
                Ok(()) => format!("default sink: {}", sink),
                Err(e) => format!("error: {}", e),
            },
            Command::Volume(sink, percent) => match self.audio.set_volume(&sink, percent).await {
                Ok(applied) => format!("{}: {}%", sink, applied),
                Err(e) => format!("error: {}", e),
            },
            Command::Mute(sink, muted) => {
                let result = match muted {
                    Some(muted) => self.audio.set_mute(&sink, muted).await,
                    None => self.audio.toggle_mute(&sink).await,
                };
                match result {
                    Ok(()) => format!("{}: mute updated", sink),
                    Err(e) => format!("error: {}", e),
                }
            }
            Command::Cards => match self.audio.list_cards().await {
                Ok(cards) if cards.is_empty() => "no cards".to_string(),
                Ok(cards) => {
                    let mut out = String::new();
                    for card in cards {
                        let _ = writeln!(out, "{} ({})", card.name, card.description);
                        for p in &card.profiles {
                            let active = card.active_profile.as_deref() == Some(p.name.as_str());
                            let _ = writeln!(
                                out,
                                "  {} {}: {}{}",
                                if active { "*" } else { " " },
                                p.name,
                                p.description,
                                if p.available { "" } else { " (unavailable)" }
                            );
                        }
                    }
                    out.trim_end().to_string()
                }
                Err(e) => format!("error: {}", e),
            },
            Command::Profile(card, profile) => {
                match self.audio.set_card_profile(&card, &profile).await {
                    Ok(()) => format!("{}: {}", card, profile),
                    Err(e) => format!("error: {}", e),
                }
            }
            Command::Status => match self.audio.bluetooth_audio_status().await {
                Ok(status) => format!(
                    "bluetooth audio: {}, a2dp sink: {}, cards: {}",
                    if status.bluetooth_audio_enabled { "enabled" } else { "disabled" },
                    if status.a2dp_sink_available { "available" } else { "unavailable" },
                    status.cards.len()
                ),
                Err(e) => format!("error: {}", e),
            },
        }
    }
}

/// Read commands from stdin until it closes.
pub fn spawn_console(console: Console) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Console input closed");
                    return;
                }
                Err(e) => {
                    warn!("Console input failed: {}", e);
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match Command::parse(&line) {
                Ok(command) => console.execute(command).await,
                Err(e) => e,
            };
            if stdout.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    })
}
