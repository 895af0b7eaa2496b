//! Configuration
//!
//! Runtime settings for the write pipeline and the LSP lifecycle, plus JSON
//! storage under `~/.oxidesync`. Missing files fall back to defaults; a
//! corrupt file is logged and replaced by defaults rather than aborting.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

/// Settings for the remote write pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSettings {
    /// Seconds before an in-flight write is forcibly failed.
    pub timeout_secs: u64,
    /// Watchdog poll interval in milliseconds.
    pub check_interval_ms: u64,
    /// Verbose logging for the save pipeline.
    pub debug: bool,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            check_interval_ms: 1000,
            debug: false,
        }
    }
}

impl WriteSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(10))
    }
}

/// Settings for the LSP save-lifecycle side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LspSettings {
    /// Interval of the supervisory sweep that clears stuck save flags, seconds.
    pub sweep_interval_secs: u64,
    /// A save flag older than this is considered stuck and cleared.
    pub max_save_secs: u64,
}

impl Default for LspSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15,
            max_save_secs: 30,
        }
    }
}

impl LspSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn max_save(&self) -> Duration {
        Duration::from_secs(self.max_save_secs)
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub write: WriteSettings,
    pub lsp: LspSettings,
}

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the configuration directory (`~/.oxidesync`).
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".oxidesync"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the config file path.
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a storage manager with the default path.
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk. A missing file yields defaults; a
    /// corrupt file is logged and replaced by defaults.
    pub async fn load(&self) -> Result<SyncConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<SyncConfig>(&contents) {
                Ok(config) => Ok(config),
                Err(e) => {
                    tracing::warn!("Config file corrupted, using defaults: {}", e);
                    Ok(SyncConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save configuration to disk.
    pub async fn save(&self, config: &SyncConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let contents = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, contents).await?;
        Ok(())
    }
}
