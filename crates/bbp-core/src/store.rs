use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use bbp_crypto::PersistenceKeys;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CHANNEL_CONFIG_VERSION: u32 = 1;
pub const CURRENT_STORE_SCHEMA_VERSION: u32 = 1;

/// What is remembered about a paired channel so it can be resumed without
/// showing a pairing code again.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub version: u32,
    #[serde(with = "hex")]
    pub channel: [u8; 16],
    #[serde(with = "hex")]
    pub encryption: [u8; 32],
    #[serde(with = "hex")]
    pub authentication: [u8; 32],
}

impl ChannelConfig {
    pub fn new(channel: [u8; 16], keys: &PersistenceKeys) -> Self {
        Self {
            version: CHANNEL_CONFIG_VERSION,
            channel,
            encryption: keys.encryption,
            authentication: keys.authentication,
        }
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("version", &self.version)
            .field("channel", &hex::encode(self.channel))
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn load(&self, device_id: &str) -> anyhow::Result<Option<ChannelConfig>>;
    async fn save(&self, device_id: &str, config: ChannelConfig) -> anyhow::Result<()>;
    async fn forget(&self, device_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryChannelStore {
    inner: Arc<RwLock<HashMap<String, ChannelConfig>>>,
}

impl MemoryChannelStore {
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn load(&self, device_id: &str) -> anyhow::Result<Option<ChannelConfig>> {
        Ok(self.inner.read().get(device_id).cloned())
    }

    async fn save(&self, device_id: &str, config: ChannelConfig) -> anyhow::Result<()> {
        self.inner.write().insert(device_id.to_owned(), config);
        Ok(())
    }

    async fn forget(&self, device_id: &str) -> anyhow::Result<()> {
        self.inner.write().remove(device_id);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage snapshot schema version {found} does not match supported version {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreSnapshot {
    schema_version: u32,
    channels: BTreeMap<String, ChannelConfig>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_STORE_SCHEMA_VERSION,
            channels: BTreeMap::new(),
        }
    }
}

/// JSON file holding every remembered channel, keyed by device id.
pub struct FileChannelStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileChannelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_snapshot(&self) -> Result<StoreSnapshot, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(StoreSnapshot::default()),
            Ok(bytes) => {
                let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
                if snapshot.schema_version != CURRENT_STORE_SCHEMA_VERSION {
                    return Err(StorageError::UnsupportedSchemaVersion {
                        found: snapshot.schema_version,
                        supported: CURRENT_STORE_SCHEMA_VERSION,
                    });
                }
                Ok(snapshot)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreSnapshot::default()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        Self::atomic_write(&self.path, &data)?;
        Ok(())
    }

    fn atomic_write(path: &PathBuf, data: &[u8]) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone();
        tmp.set_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, ChannelConfig>),
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut snapshot = self.read_snapshot()?;
        apply(&mut snapshot.channels);
        self.write_snapshot(&snapshot)
    }
}

#[async_trait]
impl ChannelStore for FileChannelStore {
    async fn load(&self, device_id: &str) -> anyhow::Result<Option<ChannelConfig>> {
        let snapshot = {
            let _guard = self.lock.lock();
            self.read_snapshot()?
        };
        match snapshot.channels.get(device_id) {
            Some(config) if config.version != CHANNEL_CONFIG_VERSION => {
                warn!(
                    "ignoring remembered channel for {device_id} with version {}",
                    config.version
                );
                Ok(None)
            }
            other => Ok(other.cloned()),
        }
    }

    async fn save(&self, device_id: &str, config: ChannelConfig) -> anyhow::Result<()> {
        self.update(|channels| {
            channels.insert(device_id.to_owned(), config);
        })?;
        Ok(())
    }

    async fn forget(&self, device_id: &str) -> anyhow::Result<()> {
        self.update(|channels| {
            channels.remove(device_id);
        })?;
        Ok(())
    }
}
