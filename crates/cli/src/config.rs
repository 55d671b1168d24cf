//! Worker configuration: a TOML file overridden by flags and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobwarden_infra::jobs::{BackoffPolicy, DispatcherConfig, QueueConfig, RetryCoordinatorConfig};
use jobwarden_observability::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the runtime needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory of the JSON-file store.
    pub data_dir: PathBuf,
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    pub default_max_attempts: u32,
    pub max_dead_letter_retries: u32,
    pub backoff: BackoffPolicy,
    /// Periodic re-run of recently failed executions during `run`.
    pub retry_enabled: bool,
    pub retry: RetryCoordinatorConfig,
    /// Alert rules document (TOML or JSON). Alerting is off without one.
    pub alert_config: Option<PathBuf>,
    /// Overrides the alert document's `healthCheckIntervalSecs`.
    pub health_check_interval_secs: Option<u64>,
    /// Used by `executions cleanup` when no `--days` is given.
    pub execution_retention_days: u32,
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            data_dir: PathBuf::from("data"),
            max_concurrency: queue.max_concurrency,
            poll_interval_ms: 250,
            default_max_attempts: queue.default_max_attempts,
            max_dead_letter_retries: queue.max_dead_letter_retries,
            backoff: queue.default_backoff,
            retry_enabled: true,
            retry: RetryCoordinatorConfig::default(),
            alert_config: None,
            health_check_interval_secs: None,
            execution_retention_days: 30,
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parse a TOML file. Unset keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("default_max_attempts must be at least 1".into()));
        }
        if self.retry.lookback_hours <= 0 {
            return Err(ConfigError::Invalid("retry.lookback_hours must be positive".into()));
        }
        if self.retry.interval.is_zero() {
            return Err(ConfigError::Invalid("retry.interval must be positive".into()));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_dead_letter_retries: self.max_dead_letter_retries,
            ..QueueConfig::default()
        }
        .with_max_concurrency(self.max_concurrency)
        .with_default_max_attempts(self.default_max_attempts)
        .with_default_backoff(self.backoff.clone())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default().with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

/// Options shared by every command.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct GlobalArgs {
    /// Worker config file (TOML)
    #[arg(long, short = 'c', global = true, env = "JOBWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of the job store
    #[arg(long, global = true, env = "JOBWARDEN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Concurrent job executions
    #[arg(long, global = true, env = "JOBWARDEN_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// Alert rules document (TOML or JSON)
    #[arg(long, global = true, env = "JOBWARDEN_ALERT_CONFIG")]
    pub alert_config: Option<PathBuf>,

    /// Log output: json or pretty
    #[arg(long, global = true, env = "JOBWARDEN_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

impl GlobalArgs {
    /// Load the config file (if any) and apply flag overrides on top.
    pub fn resolve(&self) -> Result<WorkerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)?,
            None => WorkerConfig::default(),
        };

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if let Some(path) = &self.alert_config {
            config.alert_config = Some(path.clone());
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }

        config.validate()?;
        Ok(config)
    }
}
