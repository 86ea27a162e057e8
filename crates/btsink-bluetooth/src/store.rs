//! Durable storage for the device registry.
//!
//! Only identity and trust survive a restart; live connection state and
//! reconnect counters are rebuilt from BlueZ events.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use btsink_core::{Address, Device, RegistryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

/// Persisted view of a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
    pub address: Address,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub paired: bool,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl From<&Device> for StoredDevice {
    fn from(device: &Device) -> Self {
        Self {
            address: device.address.clone(),
            name: device.name.clone(),
            trusted: device.trusted,
            paired: device.paired,
            last_seen: device.last_seen,
        }
    }
}

impl From<StoredDevice> for Device {
    fn from(stored: StoredDevice) -> Self {
        let mut device = Device::new(stored.address, stored.last_seen);
        device.name = stored.name;
        device.trusted = stored.trusted;
        device.paired = stored.paired;
        device
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    devices: Vec<StoredDevice>,
}

/// Backing store for registry records.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait RegistryStore: Send + Sync {
    /// Load every persisted record. A store that was never written is empty.
    async fn load(&self) -> Result<Vec<StoredDevice>, RegistryError>;

    /// Replace the persisted records.
    async fn save(&self, devices: Vec<StoredDevice>) -> Result<(), RegistryError>;
}

/// JSON file store, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "devices.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<StoredDevice>, RegistryError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No device store at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let file: StoreFile =
            serde_json::from_str(&contents).map_err(|e| RegistryError::Format(e.to_string()))?;
        if file.version != STORE_VERSION {
            return Err(RegistryError::UnsupportedVersion(file.version));
        }

        debug!("Loaded {} devices from {}", file.devices.len(), self.path.display());
        Ok(file.devices)
    }

    async fn save(&self, devices: Vec<StoredDevice>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = StoreFile {
            version: STORE_VERSION,
            devices,
        };
        let json =
            serde_json::to_vec_pretty(&file).map_err(|e| RegistryError::Format(e.to_string()))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<Vec<StoredDevice>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of what was last saved.
    pub async fn snapshot(&self) -> Vec<StoredDevice> {
        self.devices.lock().await.clone()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> Result<Vec<StoredDevice>, RegistryError> {
        Ok(self.snapshot().await)
    }

    async fn save(&self, devices: Vec<StoredDevice>) -> Result<(), RegistryError> {
        *self.devices.lock().await = devices;
        Ok(())
    }
}
