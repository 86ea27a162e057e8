//! Daemon configuration: an optional TOML file with CLI overrides on top.

use std::path::{Path, PathBuf};

use anyhow::Context;
use btsink_audio::AudioConfig;
use btsink_bluetooth::{AgentConfig, ReconnectPolicy, DEFAULT_BACKOFF_SECS};
use serde::Deserialize;

use crate::cli::Args;

pub const DEFAULT_DEVICE_NAME: &str = "btsink";
pub const DEFAULT_STATE_FILE: &str = "/var/lib/btsink/devices.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub backoff_secs: Vec<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_secs(&self.backoff_secs)
    }
}

/// How pairing requests are decided when no UI is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub auto_accept: bool,
    /// Take pairing decisions and device commands from stdin.
    pub console: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub device_name: String,
    pub adapter: Option<String>,
    pub state_file: PathBuf,
    pub agent: AgentConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
    pub headless: HeadlessConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            adapter: None,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            agent: AgentConfig::default(),
            reconnect: ReconnectConfig::default(),
            audio: AudioConfig::default(),
            headless: HeadlessConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load the file named by `--config` (if any) and apply CLI overrides.
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config
            .agent
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [agent] settings")?;
        Ok(config)
    }

    fn apply(&mut self, args: &Args) {
        if let Some(name) = &args.name {
            self.device_name = name.clone();
        }
        if let Some(adapter) = &args.adapter {
            self.adapter = Some(adapter.clone());
        }
        if let Some(path) = &args.state_file {
            self.state_file = path.clone();
        }
        if let Some(secs) = args.pairing_timeout {
            self.agent.pairing_timeout_secs = secs;
        }
        if args.auto_accept {
            self.headless.auto_accept = true;
        }
        if args.console {
            self.headless.console = true;
        }
    }
}

/// Read and parse a TOML configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
