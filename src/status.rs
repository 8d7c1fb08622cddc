//! Read-only inspection and operator recovery.
//!
//! Nothing here consumes queue entries: pending request sets are peeked, never
//! trimmed. The only mutating operations are [`Status::force_unlock`] for
//! recovering from a stuck lock and the scratch keys written by
//! [`Status::self_test`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{Backend, NO_EXPIRY_TTL_MILLIS};
use crate::config::Settings;
use crate::error::QueueError;
use crate::lock::{Lock, SHARD_LOCK_PREFIX};
use crate::manager::Manager;
use crate::processor::PROCESSOR_LOCK_KEY;
use crate::request_set::RequestSet;

const SELF_TEST_PREFIX: &str = "queuedTrackingSelfTest";

/// State of one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub shard_id: u32,
    pub queue_key: String,
    pub queued: usize,
    pub lock_key: String,
    /// Remaining lock lifetime; 0 when the shard is not locked.
    pub lock_ttl_millis: u64,
}

/// Snapshot of all shards.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub shard_count: u32,
    pub batch_size: usize,
    pub total_queued: usize,
    pub shards: Vec<ShardStatus>,
    pub acquired_locks: Vec<String>,
}

/// Result of one backend self-test step.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
}

/// Inspection over one backend.
pub struct Status {
    backend: Arc<dyn Backend>,
    manager: Manager,
}

impl Status {
    pub fn new(backend: Arc<dyn Backend>, settings: &Settings) -> Result<Self, QueueError> {
        let manager = Manager::new(backend.clone(), settings.shard_count, settings.batch_size)?;
        Ok(Self { backend, manager })
    }

    /// Returns per-shard counts, lock TTLs and the acquired lock keys.
    pub async fn monitor(&self) -> Result<QueueSummary, QueueError> {
        let mut shards = Vec::new();
        let mut total_queued = 0;

        for queue in self.manager.queues() {
            let queued = queue.count().await?;
            let lock_key = self.manager.lock_key(queue.id());
            let lock_ttl_millis = self.lock_ttl_millis(&lock_key).await?;
            total_queued += queued;

            shards.push(ShardStatus {
                shard_id: queue.id(),
                queue_key: queue.key().to_string(),
                queued,
                lock_key,
                lock_ttl_millis,
            });
        }

        Ok(QueueSummary {
            shard_count: self.manager.shard_count(),
            batch_size: self.manager.batch_size(),
            total_queued,
            shards,
            acquired_locks: self.acquired_lock_keys().await?,
        })
    }

    /// Remaining lifetime of a lock key in milliseconds.
    pub async fn lock_ttl_millis(&self, key: &str) -> Result<u64, QueueError> {
        Ok(self.backend.time_to_live_millis(key).await?)
    }

    /// Keys of every live shard lock.
    pub async fn acquired_lock_keys(&self) -> Result<Vec<String>, QueueError> {
        Lock::new(self.backend.clone(), SHARD_LOCK_PREFIX)
            .acquired_keys()
            .await
    }

    /// Deletes a lock key regardless of its holder.
    ///
    /// Only shard locks and the processor lock can be removed this way; any
    /// other key is refused and false is returned.
    pub async fn force_unlock(&self, key: &str) -> Result<bool, QueueError> {
        if !key.starts_with(SHARD_LOCK_PREFIX) && key != PROCESSOR_LOCK_KEY {
            warn!(key = %key, "Refusing to force-unlock a key that is not a queue lock");
            return Ok(false);
        }

        let deleted = self.backend.delete_key(key).await?;
        if deleted {
            info!(key = %key, "Lock forcibly released");
        }
        Ok(deleted)
    }

    /// Pending request sets at the head of a shard, without consuming them.
    pub async fn pending_requests(
        &self,
        shard_id: u32,
        limit: usize,
    ) -> Result<Vec<RequestSet>, QueueError> {
        if shard_id >= self.manager.shard_count() {
            return Err(QueueError::UnknownShard {
                shard_id,
                shard_count: self.manager.shard_count(),
            });
        }
        self.manager.queue(shard_id).peek(limit).await
    }

    /// Exercises every backend primitive on scratch keys.
    ///
    /// Scratch keys are removed afterwards, also when a step fails.
    pub async fn self_test(&self) -> Result<Vec<CheckResult>, QueueError> {
        let result = self.run_self_test().await;
        for key in self
            .backend
            .keys_matching(&format!("{}*", SELF_TEST_PREFIX))
            .await?
        {
            self.backend.delete_key(&key).await?;
        }
        result
    }

    async fn run_self_test(&self) -> Result<Vec<CheckResult>, QueueError> {
        let backend = &self.backend;
        let list = format!("{}List", SELF_TEST_PREFIX);
        let lock = format!("{}Lock", SELF_TEST_PREFIX);
        let mut checks = Vec::new();
        let mut check = |name: &'static str, passed: bool| {
            if !passed {
                warn!(check = name, "Backend self-test step failed");
            }
            checks.push(CheckResult { name, passed });
        };

        let values = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        backend.append_to_list(&list, &values).await?;
        check("append_to_list", backend.count(&list).await? == 3);
        check(
            "peek_first_n",
            backend.peek_first_n(&list, 2).await? == values[..2].to_vec(),
        );
        check(
            "has_at_least_n",
            backend.has_at_least_n(&list, 3).await? && !backend.has_at_least_n(&list, 4).await?,
        );
        backend.trim_first_n(&list, 2).await?;
        check("trim_first_n", backend.peek_first_n(&list, 5).await? == values[2..].to_vec());

        let ttl = Duration::from_secs(60);
        check("set_if_absent", backend.set_if_absent(&lock, "owner", ttl).await?);
        check(
            "set_if_absent_conflict",
            !backend.set_if_absent(&lock, "other", ttl).await?,
        );
        check("get", backend.get(&lock).await?.as_deref() == Some("owner"));
        check(
            "compare_and_expire",
            backend
                .compare_and_expire(&lock, "owner", Duration::from_secs(30))
                .await?
                && !backend
                    .compare_and_expire(&lock, "other", Duration::from_secs(30))
                    .await?,
        );
        let remaining = backend.time_to_live_millis(&lock).await?;
        check(
            "time_to_live_millis",
            remaining > 0 && remaining <= 30_000 && remaining != NO_EXPIRY_TTL_MILLIS,
        );
        check(
            "keys_matching",
            backend
                .keys_matching(&format!("{}Lo*", SELF_TEST_PREFIX))
                .await?
                == vec![lock.clone()],
        );
        check(
            "compare_and_delete",
            !backend.compare_and_delete(&lock, "other").await?
                && backend.compare_and_delete(&lock, "owner").await?,
        );
        check("delete_key", backend.delete_key(&list).await? && backend.count(&list).await? == 0);

        Ok(checks)
    }
}
