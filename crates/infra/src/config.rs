//! Process configuration.
//!
//! Loaded from `CIRRUS__*` environment variables (after an optional `.env`
//! file), e.g. `CIRRUS__DATABASE__URL`, `CIRRUS__WORKER__EXEC_SIZE`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use cirrus_observability::LogFormat;

use crate::jobs::{SortOrder, WorkerConfig};

const ENV_PREFIX: &str = "CIRRUS";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Bound on how long a locking read waits for another session
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub name: String,
    pub pick_size: u64,
    pub exec_size: usize,
    pub exec_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub order: SortOrder,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let defaults = WorkerConfig::default();
        Self {
            name: defaults.name,
            pick_size: defaults.pick_size,
            exec_size: defaults.exec_size,
            exec_timeout_secs: defaults.exec_timeout.as_secs(),
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            shutdown_grace_secs: defaults.shutdown_grace.as_secs(),
            order: defaults.order,
        }
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        WorkerConfig::default()
            .with_name(settings.name.clone())
            .with_pick_size(settings.pick_size)
            .with_exec_size(settings.exec_size)
            .with_exec_timeout(Duration::from_secs(settings.exec_timeout_secs))
            .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
            .with_shutdown_grace(Duration::from_secs(settings.shutdown_grace_secs))
            .with_order(settings.order)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Settings {
    /// Load from `.env` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::build(environment())
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(environment().source(Some(vars)))
    }

    fn build(source: config::Environment) -> Result<Self, ConfigError> {
        let settings: Settings = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url must be set".into()));
        }
        if self.worker.pick_size == 0 {
            return Err(ConfigError::Invalid("worker.pick_size must be positive".into()));
        }
        if self.worker.exec_size == 0 {
            return Err(ConfigError::Invalid("worker.exec_size must be positive".into()));
        }
        if self.worker.exec_timeout_secs == 0 {
            return Err(ConfigError::Invalid("worker.exec_timeout_secs must be positive".into()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("worker.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
