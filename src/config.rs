//! Server Settings
//!
//! JSON settings file with camelCase keys. Every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::record::{LevelMask, Visibility};
use crate::log::sink::LogSettings;

/// Settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Settings file is not valid JSON for [`Settings`].
    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Port the WebSocket listener binds.
    pub listening_port: u16,
    /// Space-separated origin allow-list; `None` accepts every origin.
    pub listener_accepted_origins: Option<String>,
    /// Session count above which new attempts are refused.
    pub listener_max_connections: usize,
    /// Idle time (milliseconds) after which a session is closed.
    pub listener_max_client_dormancy: u64,
    /// Update ticks per second.
    pub server_frequency: u32,
    /// Hold new sessions in chat until they ask to play.
    pub matchmaker_needs_queuing: bool,
    /// Sessions promoted into play together.
    pub matchmaker_bulk_size: usize,
    /// Directory for `latest.log` and archived logs.
    pub file_log_directory: PathBuf,
    /// Archive the previous run's log instead of deleting it.
    pub file_log_save_old: bool,
    /// Levels printed to the console.
    pub log_showing_console: LevelMask,
    /// Levels written to the log file.
    pub log_showing_file: LevelMask,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listening_port: 443,
            listener_accepted_origins: None,
            listener_max_connections: 100,
            listener_max_client_dormancy: 60_000,
            server_frequency: 25,
            matchmaker_needs_queuing: false,
            matchmaker_bulk_size: 1,
            file_log_directory: PathBuf::from("./logs/"),
            file_log_save_old: true,
            log_showing_console: LevelMask::console_default(),
            log_showing_file: LevelMask::ALL,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse settings from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Accepted origins, or `None` when any origin is allowed.
    pub fn accepted_origins(&self) -> Option<Vec<&str>> {
        self.listener_accepted_origins
            .as_deref()
            .map(|origins| origins.split(' ').collect())
    }

    /// Idle threshold as a duration.
    pub fn max_client_dormancy(&self) -> Duration {
        Duration::from_millis(self.listener_max_client_dormancy)
    }

    /// Time between update ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.server_frequency.max(1)))
    }

    /// Log sink settings.
    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            directory: self.file_log_directory.clone(),
            save_old: self.file_log_save_old,
            visibility: Visibility {
                console: self.log_showing_console,
                file: self.log_showing_file,
            },
        }
    }
}
