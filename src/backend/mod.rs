//! Storage backend abstraction.
//!
//! A [`Backend`] exposes the small set of atomic primitives the queue, lock and
//! manager are built from: list append/peek/trim/count, conditional set,
//! compare-and-delete, compare-and-expire, key enumeration and TTL lookup.
//! Every primitive is atomic with respect to itself; no cross-key transactions
//! are assumed.
//!
//! # Implementations
//!
//! - [`RedisBackend`]: single node, Redis Cluster or Sentinel-resolved master,
//!   with CAS operations as server-side Lua scripts
//! - [`SqlBackend`]: SQLite tables with conditional `INSERT`/`UPDATE`/`DELETE`
//! - [`MemoryBackend`]: process-local maps, for tests and single-process use
//!
//! Use [`connect`] to build the backend selected in [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use crate::config::{BackendKind, Settings};
use crate::error::BackendError;

pub mod memory;
pub mod redis;
pub mod sql;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use sql::SqlBackend;

/// TTL reported for a key that exists without an expiry.
pub const NO_EXPIRY_TTL_MILLIS: u64 = u64::MAX;

/// Atomic storage primitives shared by every storage engine.
///
/// Errors propagate to the caller; implementations never retry.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Pushes values to the tail of a list, preserving order. Empty input is a no-op.
    async fn append_to_list(&self, key: &str, values: &[String]) -> Result<(), BackendError>;

    /// Returns up to `n` values from the head of a list without removing them.
    async fn peek_first_n(&self, key: &str, n: usize) -> Result<Vec<String>, BackendError>;

    /// Removes up to `n` values from the head of a list.
    async fn trim_first_n(&self, key: &str, n: usize) -> Result<(), BackendError>;

    /// Returns the number of entries in a list; 0 if the list does not exist.
    async fn count(&self, key: &str) -> Result<usize, BackendError>;

    /// Returns true if the list holds at least `n` entries.
    async fn has_at_least_n(&self, key: &str, n: usize) -> Result<bool, BackendError>;

    /// Creates `key` only if it holds no live value. Returns whether it was created.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Returns the live value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Deletes `key` iff it currently holds `expected`. Returns whether it deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError>;

    /// Resets the TTL of `key` iff it currently holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Lists live keys matching a glob pattern (`*` wildcard only).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

    /// Remaining TTL in milliseconds: 0 if absent, [`NO_EXPIRY_TTL_MILLIS`] if no TTL.
    async fn time_to_live_millis(&self, key: &str) -> Result<u64, BackendError>;

    /// Deletes a key (value or list). Returns whether anything was deleted.
    async fn delete_key(&self, key: &str) -> Result<bool, BackendError>;

    /// Removes every key in the namespace.
    async fn flush_all(&self) -> Result<(), BackendError>;
}

/// Connects to the backend selected in the settings.
///
/// # Errors
///
/// Returns `BackendError::ConnectionFailed` or `BackendError::Timeout` if the
/// storage engine cannot be reached.
pub async fn connect(settings: &Settings) -> Result<Arc<dyn Backend>, BackendError> {
    let backend: Arc<dyn Backend> = match settings.backend {
        BackendKind::Redis => Arc::new(RedisBackend::connect(&settings.redis).await?),
        BackendKind::Cluster => Arc::new(RedisBackend::connect_cluster(&settings.redis).await?),
        BackendKind::Sentinel => {
            Arc::new(RedisBackend::connect_sentinel(&settings.redis).await?)
        }
        BackendKind::Sql => Arc::new(SqlBackend::open(&settings.sql.path).await?),
    };

    info!(backend = %settings.backend, "Backend connected");
    Ok(backend)
}

/// Compiles a glob pattern where `*` matches any run of characters.
///
/// Every other character, including `?` and `[`, matches itself.
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", body.join(".*")))
}
