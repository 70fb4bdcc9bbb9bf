use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::relay::DEFAULT_IDLE_TIMEOUT;
use crate::socket::{DEFAULT_SOCKET_RETRIES, DEFAULT_SOCKET_RETRY_INTERVAL, WaitPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelaySettings {
    pub idle_timeout_secs: u64,
    pub socket_retries: u32,
    pub socket_retry_interval_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            socket_retries: DEFAULT_SOCKET_RETRIES,
            socket_retry_interval_ms: DEFAULT_SOCKET_RETRY_INTERVAL.as_millis() as u64,
        }
    }
}

impl RelaySettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            retries: self.socket_retries,
            interval: Duration::from_millis(self.socket_retry_interval_ms),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitorSettings {
    pub timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl MonitorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct QuorumSettings {
    /// External quorum tool and its arguments; unset means a standalone node.
    pub command: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub server: String,
    pub runtime_dir: PathBuf,
    pub config_dir: PathBuf,
    pub relay: RelaySettings,
    pub monitor: MonitorSettings,
    pub quorum: QuorumSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: "http://localhost:8000".to_string(),
            runtime_dir: PathBuf::from("/var/lib/qarax/vms"),
            config_dir: PathBuf::from("/etc/qarax/vms"),
            relay: RelaySettings::default(),
            monitor: MonitorSettings::default(),
            quorum: QuorumSettings::default(),
        }
    }
}

/// `<config dir>/qarax/config.toml`, e.g. `~/.config/qarax/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("qarax").join("config.toml"))
}

/// Load settings from `path`, or from the default location when `None`.
///
/// A missing default file yields the built-in defaults; a missing explicit
/// file is an error.
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(Settings::default()),
        },
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Settings::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}
