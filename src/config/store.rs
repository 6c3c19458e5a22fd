//! Durable store configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Backend type for the durable store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps; nothing survives a restart
    #[default]
    Memory,
    /// Fjall (local LSM-tree storage)
    Fjall,
}

fn default_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

/// Durable store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend type
    pub backend: StoreBackend,

    /// Data directory path (for fjall)
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Interval between journal syncs (e.g., "100ms", "1s")
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: default_path(),
            flush_interval: default_flush_interval(),
        }
    }
}
