//! Runtime configuration.
//!
//! Provides a single [`RuntimeConfig`] that can be loaded from a JSON file or
//! string. Every section has defaults, so `{}` is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::RetryPolicy;
use crate::external_deps::clearance::ClearanceSettings;
use crate::modules::monitor::AlertConfig;
use crate::modules::proxy::ProxyPoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A proxy entry: either a bare URL or a URL with an explicit weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxySpec {
    Url(String),
    Weighted { url: String, weight: u32 },
}

impl ProxySpec {
    pub fn url(&self) -> &str {
        match self {
            ProxySpec::Url(url) | ProxySpec::Weighted { url, .. } => url,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            ProxySpec::Url(_) => 1,
            ProxySpec::Weighted { weight, .. } => *weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub state_file: PathBuf,
    #[serde(rename = "auto_resolve_secs", with = "duration_secs")]
    pub auto_resolve_after: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("error_monitor.json"),
            auto_resolve_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub proxies: Vec<ProxySpec>,
    pub proxy: ProxyPoolConfig,
    pub alerts: AlertConfig,
    pub retry: RetryPolicy,
    pub challenge: Option<ClearanceSettings>,
    pub monitor: MonitorSettings,
}

impl RuntimeConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.rate_limit_min > self.retry.rate_limit_max {
            return Err(ConfigError::Invalid(
                "retry.rate_limit_min_ms exceeds retry.rate_limit_max_ms".into(),
            ));
        }
        if self.proxy.health_check && self.proxy.health_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "proxy.health_check_interval_secs must be positive".into(),
            ));
        }
        if let Some(spec) = self.proxies.iter().find(|spec| spec.url().trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("empty proxy url in {spec:?}")));
        }
        Ok(())
    }
}

/// Serde helpers storing a [`Duration`] as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde helpers storing a [`Duration`] as milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
