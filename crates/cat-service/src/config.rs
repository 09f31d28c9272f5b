//! Service configuration storage
//!
//! Handles persistent storage of builder limits, revert depth and the
//! database location.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::constants::{defaults, paths};

/// Full service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Largest step batch accepted from the step source
    #[serde(default = "default_max_protocol_steps")]
    pub max_protocol_steps: usize,
    /// Compressed snapshots kept per instance for revert
    #[serde(default = "default_revert_depth")]
    pub revert_depth: usize,
    /// SQLite database file; an in-memory database is used when absent
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_max_protocol_steps() -> usize {
    defaults::MAX_PROTOCOL_STEPS
}

fn default_revert_depth() -> usize {
    defaults::REVERT_DEPTH
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_protocol_steps: default_max_protocol_steps(),
            revert_depth: default_revert_depth(),
            database_path: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from disk
    ///
    /// A missing file yields the defaults.
    pub async fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = data_dir.join(paths::CONFIG_FILE);

        if !fs::try_exists(&config_path).await.map_err(ConfigError::Io)? {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)
            .await
            .map_err(ConfigError::Io)?;

        serde_json::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save configuration to disk
    pub async fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        // Ensure directory exists
        fs::create_dir_all(data_dir).await.map_err(ConfigError::Io)?;

        let config_path = data_dir.join(paths::CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        fs::write(&config_path, contents)
            .await
            .map_err(ConfigError::Io)?;

        log::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Check if instances are persisted to a file
    pub fn is_durable(&self) -> bool {
        self.database_path.is_some()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}
