//! BridgeConfig - TOML から読む設定
//!
//! 全フィールドにデフォルトがあるので、空ファイルでも動く。
//!
//! ```toml
//! [retry]
//! base_delay_secs = 30
//! multiplier = 2.0
//! max_delay_secs = 3600
//!
//! [dispatch]
//! soft_deadline_margin_ms = 5000
//! cancel_grace_ms = 1000
//! shutdown_grace_ms = 3000
//!
//! [store]
//! retention_secs = 604800
//! path = "/var/lib/app/dormant.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RetryPolicy;

/// ConfigError は設定の読み込み・検証エラー
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Backoff for one-off retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Cap on a single delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// The soft deadline fires this long before the host budget runs out.
    #[serde(default = "default_soft_deadline_margin_ms")]
    pub soft_deadline_margin_ms: u64,

    /// How long a cancelled handler may keep running before it is aborted.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// How long `shutdown` waits for in-flight handlers.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_soft_deadline_margin_ms() -> u64 {
    5_000
}

fn default_cancel_grace_ms() -> u64 {
    1_000
}

fn default_shutdown_grace_ms() -> u64 {
    3_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            soft_deadline_margin_ms: default_soft_deadline_margin_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Settled runs older than this are purged.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// JSON state file. In-memory store when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            path: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_secs ({}) is below retry.base_delay_secs ({})",
                self.retry.max_delay_secs, self.retry.base_delay_secs
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry.base_delay_secs),
            self.retry.multiplier,
            Duration::from_secs(self.retry.max_delay_secs),
        )
    }

    pub fn soft_deadline_margin(&self) -> Duration {
        Duration::from_millis(self.dispatch.soft_deadline_margin_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.dispatch.cancel_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.dispatch.shutdown_grace_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.store.retention_secs)
    }
}
