//! Engine configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::HUB_NAME_PATTERNS;

/// What happens to commands for a port that is not attached yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Hold them and flush in order once the port attaches.
    #[default]
    Queue,
    /// Reject them with `PortNotReady`.
    FailFast,
}

/// Per-hub timing and behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// How long a correlated command waits for its ack after the write.
    pub ack_timeout_ms: u64,
    /// Bound on a single transport write attempt.
    pub write_timeout_ms: u64,
    /// Extra attempts after a failed write.
    pub write_retries: u32,
    /// Base backoff, doubled on each retry.
    pub retry_backoff_ms: u64,
    pub queue_mode: QueueMode,
    /// How long a command queued for an unattached port waits for the attach.
    pub queue_timeout_ms: u64,
    /// Send the port setup command automatically when a device attaches.
    pub auto_setup: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1000,
            write_timeout_ms: 500,
            write_retries: 3,
            retry_backoff_ms: 50,
            queue_mode: QueueMode::Queue,
            queue_timeout_ms: 10_000,
            auto_setup: true,
        }
    }
}

impl HubConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Backoff before retry number `attempt` (0 based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Discovery settings plus the config every discovered hub gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub scan_timeout_secs: u64,
    /// A hub is kept when its advertised name contains any of these.
    pub name_filters: Vec<String>,
    pub hub: HubConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 5,
            name_filters: HUB_NAME_PATTERNS.iter().map(|s| s.to_string()).collect(),
            hub: HubConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Check an advertised name against `name_filters`.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_filters.iter().any(|pattern| name.contains(pattern.as_str()))
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
