//! TOML configuration file for the daemon. `inksight-core` itself takes no
//! configuration format opinion; everything here is this binary's own
//! concern for turning a config file into the values its core types need.

use inksight_core::model::{AccessMode, ConflictStrategy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_port() -> u16 {
    22
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
}

fn default_username() -> String {
    "root".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    /// Bare hostname (no scheme/path) the Reachability Prober resolves via
    /// DNS; kept distinct from `base_url` since the latter isn't guaranteed
    /// to be parseable into one without a URL crate in the dependency tree.
    pub host: String,
    pub device_token: String,
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            debounce_ms: default_debounce_ms(),
            auto_reconnect: true,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    pub device: DeviceConfig,
    pub cloud: CloudConfig,
    pub local_cache_dir: PathBuf,
    #[serde(default)]
    pub mode: AccessMode,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("could not read config file {}: {e}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("could not parse config file {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("inksight")
            .join("config.toml")
    }
}
