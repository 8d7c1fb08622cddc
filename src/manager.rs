//! Shard routing, lock rotation and shard-count migration.
//!
//! The [`Manager`] owns the view of all `shard_count` queue shards of one
//! backend. Producers hand it request sets to route; consumers ask it for the
//! next shard that both needs processing and can be locked.
//!
//! # Routing
//!
//! Every request inside a set is routed individually by
//! `crc32(identity) % shard_count`, where the identity is the visitor id when
//! present and a hash of the client address otherwise. Requests that land on
//! the same shard are appended together as one narrower set, so all activity
//! of one visitor stays in one shard.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::{Settings, MAX_SHARD_COUNT};
use crate::error::QueueError;
use crate::lock::{Lock, SHARD_LOCK_PREFIX};
use crate::metrics::MetricsCollector;
use crate::queue::Queue;
use crate::request_set::{RequestSet, TrackingRequest};

/// Owns the queue shards of one backend and the lock of the shard being processed.
pub struct Manager {
    backend: Arc<dyn Backend>,
    shard_count: u32,
    batch_size: usize,
    lock: Lock,
    current_shard: Option<u32>,
    next_shard: Option<u32>,
}

impl Manager {
    /// Creates a manager over `shard_count` shards.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidShardCount` unless `shard_count` is within 1..=16.
    pub fn new(
        backend: Arc<dyn Backend>,
        shard_count: u32,
        batch_size: usize,
    ) -> Result<Self, QueueError> {
        validate_shard_count(shard_count)?;
        let lock = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);

        Ok(Self {
            backend,
            shard_count,
            batch_size: batch_size.max(1),
            lock,
            current_shard: None,
            next_shard: None,
        })
    }

    /// Creates a manager from settings, using the configured lock TTL.
    pub fn from_settings(backend: Arc<dyn Backend>, settings: &Settings) -> Result<Self, QueueError> {
        Ok(Self::new(backend, settings.shard_count, settings.batch_size)?
            .with_lock_ttl(settings.lock_ttl()))
    }

    /// Builder method to set the TTL applied when a shard lock is acquired.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock = self.lock.with_ttl(ttl);
        self
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Shard currently locked by this manager, if any.
    pub fn current_shard(&self) -> Option<u32> {
        self.current_shard
    }

    /// Key of the shard lock currently held, if any.
    pub fn held_lock_key(&self) -> Option<&str> {
        self.lock.held_key()
    }

    /// Returns the backend key of the lock guarding `shard_id`.
    pub fn lock_key(&self, shard_id: u32) -> String {
        self.lock.key_for(&shard_id.to_string())
    }

    /// Returns the queue of one shard.
    pub fn queue(&self, shard_id: u32) -> Queue {
        Queue::new(self.backend.clone(), shard_id, self.batch_size)
    }

    /// Returns the queues of all shards, in id order.
    pub fn queues(&self) -> Vec<Queue> {
        (0..self.shard_count).map(|id| self.queue(id)).collect()
    }

    /// Maps a routing identity to a shard id.
    pub fn shard_for(&self, identity: &str) -> u32 {
        shard_for_identity(identity, self.shard_count)
    }

    /// Splits a request set by shard and appends each part to its queue.
    ///
    /// Request order is preserved within each part. Empty sets are ignored.
    pub async fn route_to_shard(&self, request_set: &RequestSet) -> Result<(), QueueError> {
        if request_set.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<u32, Vec<TrackingRequest>> = BTreeMap::new();
        for request in request_set.requests() {
            let identity = request_set.routing_identity(request);
            groups
                .entry(self.shard_for(&identity))
                .or_default()
                .push(request.clone());
        }

        for (shard_id, requests) in groups {
            debug!(shard_id, requests = requests.len(), "Routing requests to shard");
            self.queue(shard_id)
                .append(&request_set.with_requests(requests))
                .await?;
            MetricsCollector::new().record_enqueued(shard_id, 1);
        }
        Ok(())
    }

    /// Returns true while fewer shard locks are held than there are shards.
    pub async fn can_acquire_more_locks(&self) -> Result<bool, QueueError> {
        let acquired = self.lock.count_acquired().await?;
        Ok(acquired < self.shard_count as usize)
    }

    /// Locks the next shard that has a full batch waiting.
    ///
    /// Releases any previously held shard first. The first scan of a manager
    /// starts at a random shard; later scans continue after the last shard
    /// locked. Each scan visits every shard at most once; `None` means no shard
    /// both needed processing and could be locked.
    pub async fn lock_next(&mut self) -> Result<Option<Queue>, QueueError> {
        self.unlock().await?;

        let shard_count = self.shard_count;
        let start = *self
            .next_shard
            .get_or_insert_with(|| rand::rng().random_range(0..shard_count));

        for step in 0..shard_count {
            let shard_id = (start + step) % shard_count;
            let queue = self.queue(shard_id);

            if !queue.should_process().await? {
                continue;
            }
            if self.lock.acquire(&shard_id.to_string()).await? {
                debug!(shard_id, "Locked shard for processing");
                self.current_shard = Some(shard_id);
                self.next_shard = Some((shard_id + 1) % shard_count);
                return Ok(Some(queue));
            }
        }

        Ok(None)
    }

    /// Releases the held shard lock, if any.
    pub async fn unlock(&mut self) -> Result<bool, QueueError> {
        self.current_shard = None;
        self.lock.unlock().await
    }

    /// Extends the held shard lock to `ttl_secs` from now.
    ///
    /// Returns false when no lock is held or it is no longer owned.
    pub async fn expire_lock(&self, ttl_secs: u64) -> Result<bool, QueueError> {
        self.lock.expire(ttl_secs).await
    }

    /// Moves the contents of removed shards into the remaining ones.
    ///
    /// Does nothing and returns false unless `new_count < old_count`. Every
    /// shard in `new_count..=old_count` is drained batch by batch, each drained
    /// set is routed again over `new_count` shards, and the drained shard's
    /// storage is deleted. Shards that never existed drain as empty.
    pub async fn migrate_shards(&mut self, old_count: u32, new_count: u32) -> Result<bool, QueueError> {
        if new_count >= old_count {
            return Ok(false);
        }
        validate_shard_count(new_count)?;

        info!(old_count, new_count, "Migrating queue shards");
        self.shard_count = new_count;
        self.next_shard = self.next_shard.filter(|&shard_id| shard_id < new_count);

        for shard_id in new_count..=old_count {
            let queue = self.queue(shard_id);
            let mut moved = 0usize;

            loop {
                let batch = queue.peek_batch().await?;
                if batch.is_empty() {
                    break;
                }
                for request_set in &batch {
                    self.route_to_shard(request_set).await?;
                }
                moved += batch.len();
                queue.mark_processed().await?;
            }

            queue.delete().await?;
            if moved > 0 {
                info!(shard_id, moved, "Drained removed shard");
            }
        }

        Ok(true)
    }

    /// Switches to a new shard count, migrating data out of removed shards.
    pub async fn apply_shard_count(&mut self, new_count: u32) -> Result<(), QueueError> {
        validate_shard_count(new_count)?;
        let old_count = self.shard_count;
        if !self.migrate_shards(old_count, new_count).await? {
            self.shard_count = new_count;
        }
        Ok(())
    }

    /// Returns the number of request sets queued across all shards.
    pub async fn total_queued(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for queue in self.queues() {
            total += queue.count().await?;
        }
        Ok(total)
    }
}

/// Maps an identity to a shard: `crc32(identity) % shard_count`.
pub fn shard_for_identity(identity: &str, shard_count: u32) -> u32 {
    if shard_count <= 1 {
        return 0;
    }
    crc32fast::hash(identity.as_bytes()) % shard_count
}

fn validate_shard_count(shard_count: u32) -> Result<(), QueueError> {
    if shard_count == 0 || shard_count > MAX_SHARD_COUNT {
        return Err(QueueError::InvalidShardCount(shard_count));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn manager(shard_count: u32, batch_size: usize) -> Manager {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        Manager::new(backend, shard_count, batch_size).expect("manager should build")
    }

    fn visit(visitor: &str) -> TrackingRequest {
        TrackingRequest::new()
            .with_param("idsite", "1")
            .with_param("_id", visitor)
    }

    #[test]
    fn test_shard_for_identity_uses_crc32() {
        assert_eq!(crc32fast::hash(b"0123456789abcdef"), 0x68c4_f033);
        assert_eq!(shard_for_identity("0123456789abcdef", 4), 3);
        assert_eq!(shard_for_identity("0123456789abcdef", 10), 1);
        assert_eq!(shard_for_identity("fedcba9876543210", 4), 0);
        assert_eq!(shard_for_identity("visitor-a", 5), 4);
        assert_eq!(shard_for_identity("anything", 1), 0);
    }

    #[test]
    fn test_invalid_shard_count_rejected() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        assert!(matches!(
            Manager::new(backend.clone(), 0, 1),
            Err(QueueError::InvalidShardCount(0))
        ));
        assert!(Manager::new(backend, 17, 1).is_err());
    }

    #[tokio::test]
    async fn test_route_splits_set_by_visitor() {
        let manager = manager(4, 10);
        let set = RequestSet::new(vec![
            visit("0123456789abcdef"),
            visit("fedcba9876543210"),
            visit("0123456789abcdef"),
        ])
        .with_env("HTTP_USER_AGENT", "test");

        manager.route_to_shard(&set).await.unwrap();

        let shard3 = manager.queue(3).peek(10).await.unwrap();
        assert_eq!(shard3.len(), 1);
        assert_eq!(shard3[0].len(), 2);
        assert_eq!(shard3[0].environment().get("HTTP_USER_AGENT").map(String::as_str), Some("test"));

        let shard0 = manager.queue(0).peek(10).await.unwrap();
        assert_eq!(shard0.len(), 1);
        assert_eq!(shard0[0].requests()[0].param("_id"), Some("fedcba9876543210"));

        assert_eq!(manager.total_queued().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_route_falls_back_to_client_address() {
        let manager = manager(4, 10);
        let request = TrackingRequest::new()
            .with_param("idsite", "1")
            .with_param("cip", "192.168.1.10");

        manager
            .route_to_shard(&RequestSet::new(vec![request]))
            .await
            .unwrap();
        assert_eq!(manager.queue(1).count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_next_skips_shards_below_threshold() {
        let mut manager = manager(4, 2);
        assert!(manager.lock_next().await.unwrap().is_none());

        for _ in 0..2 {
            manager
                .route_to_shard(&RequestSet::new(vec![visit("1111111111111111")]))
                .await
                .unwrap();
        }

        let queue = manager.lock_next().await.unwrap().expect("shard 2 should be locked");
        assert_eq!(queue.id(), 2);
        assert_eq!(manager.current_shard(), Some(2));
        assert_eq!(manager.held_lock_key(), Some("QueuedTrackingLock2"));
        assert!(manager.expire_lock(30).await.unwrap());

        // The held lock is released before scanning again, so the same shard is found.
        let again = manager.lock_next().await.unwrap().expect("shard 2 should be relocked");
        assert_eq!(again.id(), 2);

        assert!(manager.unlock().await.unwrap());
        assert!(!manager.expire_lock(30).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_next_rotates_between_calls() {
        let mut manager = manager(4, 1);
        // Shards 0, 2 and 3 each hold one set.
        for visitor in ["fedcba9876543210", "1111111111111111", "0123456789abcdef"] {
            manager
                .route_to_shard(&RequestSet::new(vec![visit(visitor)]))
                .await
                .unwrap();
        }

        let ready = [0, 2, 3];
        let first = manager.lock_next().await.unwrap().expect("a shard should be locked").id();
        let offset = ready.iter().position(|&id| id == first).expect("locked shard should be ready");

        for step in 1..=ready.len() {
            let queue = manager.lock_next().await.unwrap().expect("a shard should be locked");
            assert_eq!(queue.id(), ready[(offset + step) % ready.len()]);
        }

        // Unlocking keeps the rotation position.
        let expected = ready[(offset + 1) % ready.len()];
        manager.unlock().await.unwrap();
        assert_eq!(manager.lock_next().await.unwrap().map(|q| q.id()), Some(expected));
    }

    #[tokio::test]
    async fn test_locked_shard_is_not_handed_out_twice() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut first = Manager::new(backend.clone(), 2, 1).unwrap();
        let mut second = Manager::new(backend.clone(), 2, 1).unwrap();

        first
            .route_to_shard(&RequestSet::new(vec![visit("visitor-a")]))
            .await
            .unwrap();

        assert!(first.lock_next().await.unwrap().is_some());
        assert!(second.lock_next().await.unwrap().is_none());
        assert!(second.can_acquire_more_locks().await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_exhausted_when_all_shards_locked() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let manager = Manager::new(backend.clone(), 1, 1).unwrap();
        let mut lock = Lock::new(backend, SHARD_LOCK_PREFIX);

        assert!(manager.can_acquire_more_locks().await.unwrap());
        assert!(lock.acquire("0").await.unwrap());
        assert!(!manager.can_acquire_more_locks().await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_noop_when_not_shrinking() {
        let mut manager = manager(4, 1);
        assert!(!manager.migrate_shards(4, 4).await.unwrap());
        assert!(!manager.migrate_shards(4, 8).await.unwrap());
        assert_eq!(manager.shard_count(), 4);
    }

    #[tokio::test]
    async fn test_apply_shard_count_moves_entries() {
        let mut manager = manager(10, 3);
        for visitor in ["0123456789abcdef", "fedcba9876543210", "visitor-a"] {
            manager
                .route_to_shard(&RequestSet::new(vec![visit(visitor)]))
                .await
                .unwrap();
        }
        assert_eq!(manager.queue(6).count().await.unwrap(), 1);

        manager.apply_shard_count(5).await.unwrap();
        assert_eq!(manager.shard_count(), 5);
        assert_eq!(manager.queue(6).count().await.unwrap(), 0);
        assert_eq!(manager.total_queued().await.unwrap(), 3);
        assert_eq!(manager.queue(4).count().await.unwrap(), 1);
        assert_eq!(manager.queue(1).count().await.unwrap(), 2);

        manager.apply_shard_count(8).await.unwrap();
        assert_eq!(manager.shard_count(), 8);
    }
}
