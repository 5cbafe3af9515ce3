//! Engine tunables. Every interval and bound of the core is configurable
//! here; nothing is hardcoded at the call sites.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Durable snapshots are flushed at most once per interval per session,
    /// except for forced-flush boundaries.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// A subscriber receives a heartbeat when no event has fired for this long.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Outbound queue bound per subscriber; overflow disconnects the subscriber.
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,

    /// A non-terminal session with no producer activity and no subscribers
    /// for this long is evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Terminal sessions are kept in memory for this long.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// How often the reaper scans.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Durable write retry budget and backoff base.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_write_backoff_ms")]
    pub write_backoff_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How many recent sessions are loaded into memory on startup.
    #[serde(default = "default_recovery_load_limit")]
    pub recovery_load_limit: u64,
}

fn default_batch_interval_ms() -> u64 {
    2500
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_subscriber_queue_size() -> usize {
    32
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_reap_interval_ms() -> u64 {
    60_000
}

fn default_write_retries() -> u32 {
    3
}

fn default_write_backoff_ms() -> u64 {
    100
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_recovery_load_limit() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            subscriber_queue_size: default_subscriber_queue_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            retention_secs: default_retention_secs(),
            reap_interval_ms: default_reap_interval_ms(),
            write_retries: default_write_retries(),
            write_backoff_ms: default_write_backoff_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            recovery_load_limit: default_recovery_load_limit(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("batchIntervalMs", self.batch_interval_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("reapIntervalMs", self.reap_interval_ms),
            ("writeTimeoutMs", self.write_timeout_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Validation {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }
        if self.subscriber_queue_size == 0 {
            return Err(ConfigError::Validation {
                message: "subscriberQueueSize must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
