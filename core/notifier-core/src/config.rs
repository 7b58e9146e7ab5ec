//! Runtime configuration and well-known paths.
//!
//! Everything lives under `~/.chat-notifier/`:
//! - `config.toml`: optional tuning knobs (see [`NotifierConfig`])
//! - `storage.json`: the persisted status record and preferences
//! - `daemon.sock`: the daemon IPC socket
//! - `logs/`: rolling CLI logs

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NotifierError, Result};

pub const SOCKET_ENV: &str = "CHAT_NOTIFIER_SOCKET";
const HOME_DIR_NAME: &str = ".chat-notifier";
const SOCKET_NAME: &str = "daemon.sock";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifierConfig {
    pub monitor: MonitorConfig,
    pub notifications: NotificationConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub startup_grace_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            startup_grace_ms: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Delays between title resolution attempts. The fallback title is used
    /// once these are exhausted.
    pub title_retry_delays_ms: Vec<u64>,
    pub message: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title_retry_delays_ms: vec![250, 500, 1000],
            message: "Your AI response is ready.".to_string(),
        }
    }
}

impl NotificationConfig {
    pub fn retry_delay(&self, attempt: usize) -> Option<Duration> {
        self.title_retry_delays_ms
            .get(attempt)
            .map(|ms| Duration::from_millis(*ms))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub repoll_interval_ms: u64,
    pub reply_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            repoll_interval_ms: 2000,
            reply_timeout_ms: 500,
        }
    }
}

impl QueryConfig {
    pub fn repoll_interval(&self) -> Duration {
        Duration::from_millis(self.repoll_interval_ms.max(1))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms.max(1))
    }
}

/// Returns `~/.chat-notifier`.
pub fn notifier_home() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(HOME_DIR_NAME))
        .ok_or(NotifierError::HomeDirNotFound)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(notifier_home()?.join("config.toml"))
}

pub fn storage_path() -> Result<PathBuf> {
    Ok(notifier_home()?.join("storage.json"))
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(notifier_home()?.join("logs"))
}

/// Socket path, honoring `CHAT_NOTIFIER_SOCKET`.
pub fn socket_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(notifier_home()?.join(SOCKET_NAME))
}

/// Loads configuration, returning defaults when the file doesn't exist.
pub fn load_config(path: Option<&Path>) -> Result<NotifierConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if !config_path.exists() {
        return Ok(NotifierConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| NotifierError::Io {
        context: format!("reading {}", config_path.display()),
        source,
    })?;
    toml::from_str::<NotifierConfig>(&content).map_err(|err| NotifierError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
