//! Registry configuration and its storage.
//!
//! The registry consumes a small set of named options. They can be built in
//! code, loaded from a JSON file through [`ConfigStorage`], or updated one
//! option at a time by name (as a settings dialog would).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::SNAPSHOT_EXTENSIONS;

/// Default refresh cadence.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default bound on a single live-channel poll.
pub const DEFAULT_LIVE_POLL_TIMEOUT_MS: u64 = 100;

/// Name of the default data directory under the user's home.
pub const DEFAULT_DATA_DIR_NAME: &str = "plot_data";

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration was not found.
    #[error("Configuration not found: {0}")]
    NotFound(String),

    /// Failed to read configuration.
    #[error("Read error: {0}")]
    ReadError(String),

    /// Failed to write configuration.
    #[error("Write error: {0}")]
    WriteError(String),

    /// Configuration data is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// No option with this name exists.
    #[error("Unknown option: {0}")]
    UnknownOption(String),
}

/// Options consumed by the source registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Refresh cadence in milliseconds.
    pub poll_interval_ms: u64,

    /// Discover new snapshot files in `source_folder` on every tick.
    pub watch_folder: bool,

    /// Folder scanned for snapshot files.
    pub source_folder: PathBuf,

    /// File extensions (without the dot) treated as snapshots.
    pub extensions: Vec<String>,

    /// Upper bound for a live-channel poll inside one tick.
    pub live_poll_timeout_ms: u64,

    /// Live endpoints (`tcp://host:port`) registered at startup.
    pub live_sources: Vec<String>,

    /// Remove sources whose file has been missing for this long.
    /// Unset keeps them indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evict_stale_after_ms: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            watch_folder: true,
            source_folder: default_source_folder(),
            extensions: SNAPSHOT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            live_poll_timeout_ms: DEFAULT_LIVE_POLL_TIMEOUT_MS,
            live_sources: Vec::new(),
            evict_stale_after_ms: None,
        }
    }
}

/// `~/plot_data`, or a relative `plot_data` when no home directory is known.
pub fn default_source_folder() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR_NAME))
}

impl RegistryConfig {
    /// Check option values that would make the registry misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidData(
                "pollIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::InvalidData(
                "extensions must name at least one file extension".to_string(),
            ));
        }
        Ok(())
    }

    /// Update one option by its serialized name.
    pub fn set_option(&mut self, name: &str, value: &serde_json::Value) -> Result<(), ConfigError> {
        let invalid = |expected: &str| {
            ConfigError::InvalidData(format!("{name} expects {expected}, got {value}"))
        };

        match name {
            "pollIntervalMs" => {
                self.poll_interval_ms = value.as_u64().ok_or_else(|| invalid("an integer"))?;
            }
            "watchFolder" => {
                self.watch_folder = value.as_bool().ok_or_else(|| invalid("a boolean"))?;
            }
            "sourceFolder" => {
                self.source_folder = value
                    .as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| invalid("a path string"))?;
            }
            "livePollTimeoutMs" => {
                self.live_poll_timeout_ms = value.as_u64().ok_or_else(|| invalid("an integer"))?;
            }
            "evictStaleAfterMs" => {
                self.evict_stale_after_ms = if value.is_null() {
                    None
                } else {
                    Some(value.as_u64().ok_or_else(|| invalid("an integer or null"))?)
                };
            }
            "extensions" | "liveSources" => {
                let items = serde_json::from_value::<Vec<String>>(value.clone())
                    .map_err(|_| invalid("a list of strings"))?;
                if name == "extensions" {
                    self.extensions = items;
                } else {
                    self.live_sources = items;
                }
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

/// Abstract configuration storage.
///
/// The file-based implementation is used by the binary; tests and embedders
/// can provide their own.
pub trait ConfigStorage: Send + Sync {
    /// Load registry configuration.
    fn load_config(&self) -> Result<RegistryConfig, ConfigError>;

    /// Save registry configuration.
    fn save_config(&self, config: &RegistryConfig) -> Result<(), ConfigError>;
}

/// JSON file storage (e.g. `~/.measync/config.json`).
#[derive(Debug, Clone)]
pub struct FileConfigStorage {
    path: PathBuf,
}

impl FileConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage at the per-user default location.
    pub fn user_default() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(".measync").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load_config(&self) -> Result<RegistryConfig, ConfigError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(self.path.display().to_string())
            } else {
                ConfigError::ReadError(format!("{}: {e}", self.path.display()))
            }
        })?;
        let config: RegistryConfig = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::InvalidData(format!("{}: {e}", self.path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn save_config(&self, config: &RegistryConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteError(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        std::fs::write(&self.path, json)
            .map_err(|e| ConfigError::WriteError(format!("{}: {e}", self.path.display())))
    }
}
