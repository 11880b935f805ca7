//! Node configuration.
//!
//! Every tunable has a default from `vigil_protocol::defaults`; a TOML file
//! may override any subset, and command-line flags override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vigil_protocol::{defaults, ResourceLimits, RetryPolicy};
use vigil_worker::WorkerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Executor pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub count: usize,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub cancel_grace_ms: u64,
    pub storage_retries: u32,
    pub storage_backoff_ms: u64,
    pub malformed_threshold: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: defaults::DEFAULT_WORKER_COUNT,
            visibility_timeout_secs: defaults::DEFAULT_VISIBILITY_TIMEOUT_SECS,
            poll_interval_ms: defaults::DEFAULT_POLL_INTERVAL_MS,
            cancel_grace_ms: defaults::DEFAULT_CANCEL_GRACE_MS,
            storage_retries: defaults::DEFAULT_STORAGE_RETRIES,
            storage_backoff_ms: defaults::DEFAULT_STORAGE_BACKOFF_MS,
            malformed_threshold: defaults::DEFAULT_MALFORMED_THRESHOLD,
        }
    }
}

/// Defaults applied to runs that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    pub max_rate_limit_per_minute: u32,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::DEFAULT_RUN_TIMEOUT_SECS,
            rate_limit_per_minute: defaults::DEFAULT_RATE_LIMIT_PER_MINUTE,
            max_rate_limit_per_minute: defaults::MAX_RATE_LIMIT_PER_MINUTE,
        }
    }
}

/// Everything a node needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub database_path: PathBuf,
    pub artifact_root: PathBuf,
    /// Name prefix of this node's executors.
    pub node_name: String,
    pub sweep_interval_ms: u64,
    pub authorization_ttl_secs: i64,
    pub worker: WorkerSettings,
    pub retry: RetryPolicy,
    pub limits: ResourceLimits,
    pub runs: RunDefaults,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let home = vigil_logging::vigil_home();
        Self {
            database_path: home.join(defaults::DEFAULT_STATE_STORE_PATH),
            artifact_root: home.join(defaults::DEFAULT_ARTIFACT_ROOT),
            node_name: "node".to_string(),
            sweep_interval_ms: defaults::DEFAULT_SWEEP_INTERVAL_MS,
            authorization_ttl_secs: defaults::DEFAULT_AUTHORIZATION_TTL_SECS,
            worker: WorkerSettings::default(),
            retry: RetryPolicy::default(),
            limits: ResourceLimits::default(),
            runs: RunDefaults::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: NodeConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid("worker.count must be at least 1".into()));
        }
        if self.worker.visibility_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.visibility_timeout_secs must be positive".into(),
            ));
        }
        if self.worker.poll_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll and sweep intervals must be positive".into()));
        }
        // The poll interval bounds how late a cancel or deadline is noticed;
        // it has to fit inside a lease or renewals fall behind.
        if self.worker.poll_interval_ms >= self.worker.visibility_timeout_secs * 1000 / 3 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be under a third of the visibility timeout".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.worker.malformed_threshold) {
            return Err(ConfigError::Invalid(
                "worker.malformed_threshold must be within 0..=1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.runs.max_rate_limit_per_minute == 0
            || self.runs.rate_limit_per_minute == 0
            || self.runs.rate_limit_per_minute > self.runs.max_rate_limit_per_minute
        {
            return Err(ConfigError::Invalid(
                "runs.rate_limit_per_minute must be within 1..=max_rate_limit_per_minute".into(),
            ));
        }
        if self.runs.timeout_secs == 0 {
            return Err(ConfigError::Invalid("runs.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            pool_name: self.node_name.clone(),
            executors: self.worker.count,
            visibility_timeout: Duration::from_secs(self.worker.visibility_timeout_secs),
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            cancel_grace: Duration::from_millis(self.worker.cancel_grace_ms),
            limits: self.limits.clone(),
            storage_retries: self.worker.storage_retries,
            storage_backoff: Duration::from_millis(self.worker.storage_backoff_ms),
            malformed_threshold: self.worker.malformed_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert!(config.database_path.ends_with("vigil.sqlite3"));
        assert_eq!(config.worker.count, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.runs.max_rate_limit_per_minute, 6_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            database_path = "/tmp/vigil/test.sqlite3"

            [worker]
            count = 2

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/vigil/test.sqlite3"));
        assert_eq!(config.worker.count, 2);
        assert_eq!(config.worker.poll_interval_ms, defaults::DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_base_ms, defaults::DEFAULT_RETRY_BACKOFF_BASE_MS);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = NodeConfig::default();
        config.worker.poll_interval_ms = 30_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::default();
        config.runs.rate_limit_per_minute = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "worker = 3").unwrap();
        let err = NodeConfig::load(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&tmp.path().display().to_string()));
    }

    #[test]
    fn test_worker_config_conversion() {
        let config = NodeConfig {
            node_name: "edge".into(),
            ..NodeConfig::default()
        };
        let worker = config.worker_config();
        assert_eq!(worker.pool_name, "edge");
        assert_eq!(worker.visibility_timeout, Duration::from_secs(60));
        assert_eq!(worker.cancel_grace, Duration::from_secs(5));
    }
}
