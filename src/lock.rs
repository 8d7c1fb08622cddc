//! Distributed lock built on the backend's conditional primitives.
//!
//! A lock is a backend key (`prefix + id`) holding a random per-acquisition
//! token with a TTL. Only the instance that created the key knows the token,
//! and release/extension go through compare-and-delete/compare-and-expire, so
//! a holder whose lock expired and was taken over can never touch the new
//! holder's lock. If a holder crashes the key simply expires.
//!
//! One `Lock` tracks at most one key at a time and is meant to be driven by a
//! single owner; it is not shared between tasks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::DEFAULT_LOCK_TTL_SECS;
use crate::error::QueueError;

/// Key prefix of per-shard locks.
pub const SHARD_LOCK_PREFIX: &str = "QueuedTrackingLock";

/// A lock over keys sharing one prefix.
pub struct Lock {
    backend: Arc<dyn Backend>,
    prefix: String,
    ttl: Duration,
    /// Key and token of the current acquisition.
    held: Option<(String, String)>,
}

impl Lock {
    /// Creates a lock for keys under `prefix` with the default 60 second TTL.
    pub fn new(backend: Arc<dyn Backend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            held: None,
        }
    }

    /// Builder method to set the TTL applied on acquisition.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the backend key for `id`.
    pub fn key_for(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Returns the key currently tracked by this instance, if any.
    pub fn held_key(&self) -> Option<&str> {
        self.held.as_ref().map(|(key, _)| key.as_str())
    }

    /// Tries to take the lock for `id`.
    ///
    /// On success the new key and token replace whatever this instance tracked
    /// before; the previous key is not released, so callers unlock first.
    /// On failure the tracked state is left untouched.
    pub async fn acquire(&mut self, id: &str) -> Result<bool, QueueError> {
        let key = self.key_for(id);
        let token = Uuid::new_v4().to_string();

        let acquired = self.backend.set_if_absent(&key, &token, self.ttl).await?;
        if acquired {
            debug!(key = %key, "Lock acquired");
            self.held = Some((key, token));
        }
        Ok(acquired)
    }

    /// Returns true if the backend still holds this instance's token.
    pub async fn is_locked(&self) -> Result<bool, QueueError> {
        match &self.held {
            Some((key, token)) => {
                let current = self.backend.get(key).await?;
                Ok(current.as_deref() == Some(token.as_str()))
            }
            None => Ok(false),
        }
    }

    /// Releases the lock if this instance still owns it.
    ///
    /// The tracked token is forgotten whatever the outcome.
    pub async fn unlock(&mut self) -> Result<bool, QueueError> {
        let Some((key, token)) = self.held.take() else {
            return Ok(false);
        };

        let released = self.backend.compare_and_delete(&key, &token).await?;
        if released {
            debug!(key = %key, "Lock released");
        } else {
            warn!(key = %key, "Lock was no longer owned when releasing");
        }
        Ok(released)
    }

    /// Extends the lock to expire `ttl_secs` from now, if still owned.
    ///
    /// Returns false without touching the backend when no lock is held or the
    /// TTL is zero.
    pub async fn expire(&self, ttl_secs: u64) -> Result<bool, QueueError> {
        if ttl_secs == 0 {
            return Ok(false);
        }

        match &self.held {
            Some((key, token)) => Ok(self
                .backend
                .compare_and_expire(key, token, Duration::from_secs(ttl_secs))
                .await?),
            None => Ok(false),
        }
    }

    /// Returns the keys of every live lock under this prefix.
    pub async fn acquired_keys(&self) -> Result<Vec<String>, QueueError> {
        Ok(self
            .backend
            .keys_matching(&format!("{}*", self.prefix))
            .await?)
    }

    /// Returns the number of live locks under this prefix.
    pub async fn count_acquired(&self) -> Result<usize, QueueError> {
        Ok(self.acquired_keys().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new())
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let backend = backend();
        let mut first = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);
        let mut second = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);

        assert!(first.acquire("1").await.unwrap());
        assert!(!second.acquire("1").await.unwrap());
        assert!(first.is_locked().await.unwrap());
        assert!(!second.is_locked().await.unwrap());

        assert!(second.acquire("2").await.unwrap());
        assert_eq!(first.count_acquired().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_acquire_keeps_held_lock() {
        let backend = backend();
        let mut holder = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);
        let mut other = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);

        assert!(other.acquire("2").await.unwrap());
        assert!(holder.acquire("1").await.unwrap());
        assert!(!holder.acquire("2").await.unwrap());

        assert_eq!(holder.held_key(), Some("QueuedTrackingLock1"));
        assert!(holder.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_and_expire_without_lock() {
        let mut lock = Lock::new(backend(), SHARD_LOCK_PREFIX);
        assert!(!lock.unlock().await.unwrap());
        assert!(!lock.expire(30).await.unwrap());
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_zero_is_noop() {
        let mut lock = Lock::new(backend(), SHARD_LOCK_PREFIX);
        assert!(lock.acquire("0").await.unwrap());
        assert!(!lock.expire(0).await.unwrap());
        assert!(lock.expire(120).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_touch_new_holder() {
        let backend = backend();
        let mut stale =
            Lock::new(backend.clone(), SHARD_LOCK_PREFIX).with_ttl(Duration::from_millis(30));
        let mut fresh = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);

        assert!(stale.acquire("5").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fresh.acquire("5").await.unwrap());

        assert!(!stale.is_locked().await.unwrap());
        assert!(!stale.expire(60).await.unwrap());
        assert!(!stale.unlock().await.unwrap());

        assert!(fresh.is_locked().await.unwrap());
        assert!(fresh.unlock().await.unwrap());
        assert_eq!(fresh.count_acquired().await.unwrap(), 0);
    }

    #[test]
    fn test_key_for() {
        let lock = Lock::new(backend(), "trackingProcessorLock");
        assert_eq!(lock.key_for(""), "trackingProcessorLock");
        assert_eq!(lock.key_for("7"), "trackingProcessorLock7");
    }
}
