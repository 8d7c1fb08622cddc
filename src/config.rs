//! Settings for the queued tracking system.
//!
//! Settings are built once at process start (from a YAML file, environment
//! overrides and defaults) and passed explicitly into the backend, manager and
//! worker constructors.
//!
//! # Example
//!
//! ```yaml
//! enabled: true
//! backend: redis
//! redis:
//!   hosts: ["127.0.0.1"]
//!   ports: [6379]
//!   database: 0
//! shard_count: 4
//! batch_size: 25
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest supported number of queue shards.
pub const MAX_SHARD_COUNT: u32 = 16;

/// Default number of request sets pulled per batch.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Default shard lock lifetime in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// Prefix of environment variables that override file settings.
const ENV_PREFIX: &str = "QUEUED_TRACKING_";

/// Storage engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A single Redis node.
    #[default]
    Redis,
    /// A Redis Cluster.
    Cluster,
    /// Redis behind Sentinel failover.
    Sentinel,
    /// A SQL table (SQLite).
    Sql,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(BackendKind::Redis),
            "cluster" => Ok(BackendKind::Cluster),
            "sentinel" => Ok(BackendKind::Sentinel),
            "sql" | "mysql" | "sqlite" => Ok(BackendKind::Sql),
            other => Err(ConfigError::InvalidValue {
                key: "backend".to_string(),
                message: format!("unknown backend '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Redis => "redis",
            BackendKind::Cluster => "cluster",
            BackendKind::Sentinel => "sentinel",
            BackendKind::Sql => "sql",
        };
        f.write_str(name)
    }
}

/// Connection parameters shared by all Redis variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Hosts; cluster and sentinel take several, paired with `ports`.
    pub hosts: Vec<String>,
    /// Ports; a single port applies to every host.
    pub ports: Vec<u16>,
    pub password: Option<String>,
    pub database: i64,
    /// Connect timeout in seconds; 0 disables it.
    pub timeout_secs: f64,
    /// Master name looked up through sentinel.
    pub sentinel_master: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_string()],
            ports: vec![6379],
            password: None,
            database: 0,
            timeout_secs: 0.0,
            sentinel_master: "mymaster".to_string(),
        }
    }
}

impl RedisSettings {
    /// Returns `(host, port)` pairs for every configured node.
    pub fn nodes(&self) -> Result<Vec<(String, u16)>, ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis.hosts cannot be empty".to_string(),
            ));
        }

        match self.ports.len() {
            0 => Ok(self.hosts.iter().map(|h| (h.clone(), 6379)).collect()),
            1 => Ok(self
                .hosts
                .iter()
                .map(|h| (h.clone(), self.ports[0]))
                .collect()),
            n if n == self.hosts.len() => Ok(self
                .hosts
                .iter()
                .cloned()
                .zip(self.ports.iter().copied())
                .collect()),
            n => Err(ConfigError::ValidationFailed(format!(
                "redis.ports has {} entries but redis.hosts has {}",
                n,
                self.hosts.len()
            ))),
        }
    }

    /// Returns the connect timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs > 0.0 {
            Some(Duration::from_secs_f64(self.timeout_secs))
        } else {
            None
        }
    }
}

/// Parameters for the SQL-table backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlSettings {
    /// Path of the SQLite database file.
    pub path: String,
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            path: "queuedtracking.db".to_string(),
        }
    }
}

/// Complete settings for one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether incoming requests are queued at all.
    pub enabled: bool,
    pub backend: BackendKind,
    pub redis: RedisSettings,
    pub sql: SqlSettings,
    /// Number of queue shards, 1 to 16.
    pub shard_count: u32,
    /// Request sets processed per batch.
    pub batch_size: usize,
    /// Process right after enqueueing instead of waiting for an external trigger.
    pub process_during_tracking_request: bool,
    /// Hold the global processor lock for a whole worker invocation.
    pub processor_lock: bool,
    /// Initial lifetime of a shard lock in seconds.
    pub lock_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Redis,
            redis: RedisSettings::default(),
            sql: SqlSettings::default(),
            shard_count: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            process_during_tracking_request: false,
            processor_lock: true,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
        }
    }
}

impl Settings {
    /// Loads settings from a YAML file, applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut settings: Settings = serde_yaml::from_str(&content)?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Builds settings from defaults and environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `QUEUED_TRACKING_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("ENABLED") {
            self.enabled = parse_env_bool(&val, "ENABLED")?;
        }

        if let Some(val) = lookup("BACKEND") {
            self.backend = val.parse()?;
        }

        if let Some(val) = lookup("REDIS_HOSTS") {
            self.redis.hosts = split_list(&val);
        }

        if let Some(val) = lookup("REDIS_PORTS") {
            self.redis.ports = split_list(&val)
                .iter()
                .map(|p| parse_env_value(p, "REDIS_PORTS"))
                .collect::<Result<_, _>>()?;
        }

        if let Some(val) = lookup("REDIS_PASSWORD") {
            self.redis.password = if val.is_empty() { None } else { Some(val) };
        }

        if let Some(val) = lookup("REDIS_DATABASE") {
            self.redis.database = parse_env_value(&val, "REDIS_DATABASE")?;
        }

        if let Some(val) = lookup("REDIS_TIMEOUT") {
            self.redis.timeout_secs = parse_env_value(&val, "REDIS_TIMEOUT")?;
        }

        if let Some(val) = lookup("SENTINEL_MASTER") {
            self.redis.sentinel_master = val;
        }

        if let Some(val) = lookup("SQL_PATH") {
            self.sql.path = val;
        }

        if let Some(val) = lookup("SHARD_COUNT") {
            self.shard_count = parse_env_value(&val, "SHARD_COUNT")?;
        }

        if let Some(val) = lookup("BATCH_SIZE") {
            self.batch_size = parse_env_value(&val, "BATCH_SIZE")?;
        }

        if let Some(val) = lookup("PROCESS_DURING_TRACKING_REQUEST") {
            self.process_during_tracking_request =
                parse_env_bool(&val, "PROCESS_DURING_TRACKING_REQUEST")?;
        }

        if let Some(val) = lookup("PROCESSOR_LOCK") {
            self.processor_lock = parse_env_bool(&val, "PROCESSOR_LOCK")?;
        }

        if let Some(val) = lookup("LOCK_TTL") {
            self.lock_ttl_secs = parse_env_value(&val, "LOCK_TTL")?;
        }

        Ok(())
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 || self.shard_count > MAX_SHARD_COUNT {
            return Err(ConfigError::ValidationFailed(format!(
                "shard_count must be between 1 and {}, got {}",
                MAX_SHARD_COUNT, self.shard_count
            )));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be at least 1".to_string(),
            ));
        }

        if self.lock_ttl_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.redis.timeout_secs < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "redis.timeout_secs cannot be negative".to_string(),
            ));
        }

        match self.backend {
            BackendKind::Redis | BackendKind::Cluster | BackendKind::Sentinel => {
                self.redis.nodes()?;
            }
            BackendKind::Sql => {
                if self.sql.path.is_empty() {
                    return Err(ConfigError::ValidationFailed(
                        "sql.path cannot be empty".to_string(),
                    ));
                }
            }
        }

        if self.backend == BackendKind::Sentinel && self.redis.sentinel_master.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis.sentinel_master cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the backend kind.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Builder method to set the shard count.
    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Builder method to set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method to enable inline processing.
    pub fn with_process_during_tracking_request(mut self, enabled: bool) -> Self {
        self.process_during_tracking_request = enabled;
        self
    }

    /// Builder method to toggle the global processor lock.
    pub fn with_processor_lock(mut self, enabled: bool) -> Self {
        self.processor_lock = enabled;
        self
    }

    /// Builder method to set the SQLite path.
    pub fn with_sql_path(mut self, path: impl Into<String>) -> Self {
        self.sql.path = path.into();
        self
    }

    /// Returns the shard lock TTL as a duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{}{}", ENV_PREFIX, key),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: format!("{}{}", ENV_PREFIX, key),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
