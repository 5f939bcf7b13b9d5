use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{MonitorPolicy, RetryPolicy};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub retry_max: u32,
    pub retry_base_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_max_polls: u32,
    /// Age after which a handle-less PENDING workspace is reported as stale.
    pub stale_grace_secs: i64,
}

fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VDI_DATA_DIR") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".vdi")
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("VDI_DB_PATH") {
        return PathBuf::from(path);
    }

    default_data_dir().join("vdi.db")
}

fn default_retry_max() -> u32 {
    env_parsed("VDI_RETRY_MAX", 3)
}

fn default_retry_base_secs() -> u64 {
    env_parsed("VDI_RETRY_BASE_SECS", 30)
}

fn default_monitor_interval_secs() -> u64 {
    env_parsed("VDI_MONITOR_INTERVAL_SECS", 30)
}

fn default_monitor_max_polls() -> u32 {
    env_parsed("VDI_MONITOR_MAX_POLLS", 60)
}

fn default_stale_grace_secs() -> i64 {
    env_parsed("VDI_STALE_GRACE_SECS", 3600)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: default_db_path(),
            retry_max: default_retry_max(),
            retry_base_secs: default_retry_base_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            monitor_max_polls: default_monitor_max_polls(),
            stale_grace_secs: default_stale_grace_secs(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// The vault passphrase is never defaulted; refusing to run beats
    /// encrypting credentials under a guessable key.
    pub fn vault_passphrase(&self) -> Result<String> {
        std::env::var("VDI_VAULT_PASSPHRASE").map_err(|_| {
            OrchestratorError::InvalidInput(
                "VDI_VAULT_PASSPHRASE is not set; it is required to unlock stored credentials"
                    .to_string(),
            )
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max,
            base_delay: Duration::from_secs(self.retry_base_secs),
        }
    }

    pub fn monitor_policy(&self) -> MonitorPolicy {
        MonitorPolicy {
            interval: Duration::from_secs(self.monitor_interval_secs),
            max_polls: self.monitor_max_polls,
        }
    }
}
