use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tabsync_protocol::MAX_FRAME_BYTES;

use crate::connection::ReconnectPolicy;
use crate::scrollback::DEFAULT_MAX_BYTES;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub scrollback_max_bytes: usize,
    pub pending_timeout_ms: u64,
    pub max_line_bytes: usize,
    pub reconnect: ReconnectConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_interval_ms: u64,
    pub growth_factor: f64,
    pub max_attempts: u32,
    pub max_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: tabsync_protocol::paths::default_socket_path(),
            data_dir: tabsync_protocol::paths::data_dir(),
            scrollback_max_bytes: DEFAULT_MAX_BYTES,
            pending_timeout_ms: 30_000,
            max_line_bytes: MAX_FRAME_BYTES,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            growth_factor: 1.5,
            max_attempts: 10,
            max_interval_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Load from the default config file, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&tabsync_protocol::paths::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn scrollback_dir(&self) -> PathBuf {
        self.data_dir.join("scrollback")
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_interval: Duration::from_millis(self.reconnect.base_interval_ms),
            growth_factor: self.reconnect.growth_factor,
            max_attempts: self.reconnect.max_attempts,
            max_interval: Duration::from_millis(self.reconnect.max_interval_ms),
        }
    }
}
