//! Configuration for a space replica.
//!
//! [`EchoConfig`] is persisted as TOML. Every field has a default so a
//! partial (or missing) file is valid.
//!
//! # Example
//!
//! ```ignore
//! use echo_core::config::EchoConfig;
//!
//! let config = EchoConfig::load_or_default("echo.toml")?;
//! assert_eq!(config.snapshot_message_limit, 10_000);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default number of new messages before a snapshot is triggered.
pub const DEFAULT_SNAPSHOT_MESSAGE_LIMIT: u64 = 10_000;

/// Tunables for the pipeline, snapshot monitor and network adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// New messages since the last snapshot epoch that trigger a snapshot.
    pub snapshot_message_limit: u64,

    /// Mutations buffered per object while its model is unregistered.
    pub model_buffer_capacity: usize,

    /// How long buffered mutations wait for their model before being dropped.
    pub model_buffer_window_secs: u64,

    /// Inbound messages handled between cooperative yields.
    pub inbound_yield_budget: usize,

    /// Directory holding feeds and snapshots (CLI only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            snapshot_message_limit: DEFAULT_SNAPSHOT_MESSAGE_LIMIT,
            model_buffer_capacity: 256,
            model_buffer_window_secs: 300,
            inbound_yield_budget: 64,
            data_dir: None,
        }
    }
}

impl EchoConfig {
    /// Buffer window as a [`Duration`].
    pub fn model_buffer_window(&self) -> Duration {
        Duration::from_secs(self.model_buffer_window_secs)
    }

    /// Load config from a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: EchoConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load config from a TOML file, falling back to defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Save config to a TOML file, creating parent directories as needed.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EchoConfig::default();
        assert_eq!(config.snapshot_message_limit, 10_000);
        assert_eq!(config.model_buffer_window(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EchoConfig = toml::from_str("model_buffer_capacity = 4\n").unwrap();
        assert_eq!(config.model_buffer_capacity, 4);
        assert_eq!(config.snapshot_message_limit, DEFAULT_SNAPSHOT_MESSAGE_LIMIT);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("echo.toml");

        let config = EchoConfig {
            snapshot_message_limit: 50,
            data_dir: Some(PathBuf::from("/tmp/space")),
            ..EchoConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(EchoConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EchoConfig::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, EchoConfig::default());
    }
}
