use anyhow::Context;
use cloudmon_cloud::config::CloudConfig;
use cloudmon_storage::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// `[http]`, `[azure]`, `[aws]` and `[rackspace]` sections.
    #[serde(flatten)]
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Periodic "all" runs. Manual runs work either way.
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sync_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_run_on_startup")]
    pub run_on_startup: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            interval_secs: default_sync_interval_secs(),
            tick_secs: default_sync_tick_secs(),
            run_on_startup: default_run_on_startup(),
        }
    }
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    900
}

fn default_sync_tick_secs() -> u64 {
    30
}

fn default_run_on_startup() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl StorageConfig {
    pub fn open(&self) -> anyhow::Result<Arc<dyn SnapshotStore>> {
        match self.backend {
            StorageBackend::Sqlite => {
                let store = SqliteSnapshotStore::new(Path::new(&self.data_dir)).with_context(
                    || format!("Failed to open snapshot store in '{}'", self.data_dir),
                )?;
                Ok(Arc::new(store))
            }
            StorageBackend::Memory => Ok(Arc::new(MemorySnapshotStore::new())),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{path}'"))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{path}'"))?;
        Ok(config)
    }
}
