//! Error types for queued tracking operations.
//!
//! Defines error types for all major subsystems:
//! - Storage backends (Redis, Redis Cluster, Sentinel, SQL table)
//! - The tracking engine boundary
//! - Queue shards, locks and batch processing
//! - Configuration loading

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a storage backend.
///
/// Backend errors are never retried at this layer; they propagate to the caller.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SQL operation failed: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Backend connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Backend operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors raised by the tracking engine while applying a request.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Invalid tracking request: {0}")]
    InvalidRequest(String),

    #[error("Tracking storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("No open transaction")]
    NotInTransaction,

    #[error("Tracking failed: {0}")]
    Failed(String),
}

/// Errors that can occur during queue, lock and processing operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Failed to serialize request set: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Corrupt entry in queue '{key}': {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid entry in queue '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },

    /// The shard lock expired or was taken over while a batch was in flight.
    #[error("Lost lock '{key}' while processing")]
    LockLost { key: String },

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Invalid shard count {0}: must be between 1 and {max}", max = crate::config::MAX_SHARD_COUNT)]
    InvalidShardCount(u32),

    #[error("Shard {shard_id} does not exist (shard count is {shard_count})")]
    UnknownShard { shard_id: u32, shard_count: u32 },
}

impl QueueError {
    /// Returns true if this error means exclusive ownership of a shard was lost.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, QueueError::LockLost { .. })
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Backend(BackendError::Redis(err))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Backend(BackendError::Sql(err))
    }
}

/// Errors that can occur while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),
}
