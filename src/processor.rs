//! Batch processing of one locked shard.
//!
//! [`Processor::process`] repeatedly peeks a batch, applies it through the
//! [`Handler`] inside one transaction, retries whatever the handler reports
//! once, and trims the batch from the queue. Before each request set the shard
//! lock is extended to cover the work about to be done; if the extension
//! fails the batch is rolled back and processing stops with
//! [`QueueError::LockLost`], since another worker may already own the shard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::QueueError;
use crate::handler::Handler;
use crate::lock::Lock;
use crate::manager::Manager;
use crate::metrics::MetricsCollector;
use crate::queue::Queue;
use crate::request_set::RequestSet;
use crate::tracker::Tracker;

/// Key of the lock guarding a whole processing invocation.
pub const PROCESSOR_LOCK_KEY: &str = "globalProcessorLock";

/// Upper bound on batches taken from one shard per `process` call.
pub const MAX_BATCHES_PER_PROCESS: usize = 500;

/// Minimum lock extension in seconds.
const MIN_LOCK_TTL_SECS: u64 = 20;

/// Seconds of lock lifetime needed to process `requests` requests.
pub fn lock_ttl_for(requests: usize) -> u64 {
    (requests as u64 * 2).max(MIN_LOCK_TTL_SECS)
}

/// Callback invoked before each batch is read.
pub type BatchCallback = Box<dyn Fn(&Queue) + Send + Sync>;

/// Throughput of one or more `process` calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessStats {
    /// Batches trimmed from their queue.
    pub batches: usize,
    /// Request sets committed to the tracker.
    pub request_sets: usize,
    /// Individual requests committed to the tracker.
    pub requests: usize,
    /// Request sets that reported a tracking error, over both passes.
    pub failed: usize,
    /// Retry candidates discarded because the retry pass failed as well.
    pub dropped: usize,
    pub elapsed: Duration,
}

impl ProcessStats {
    /// Folds another run's numbers into this one.
    pub fn merge(&mut self, other: &ProcessStats) {
        self.batches += other.batches;
        self.request_sets += other.request_sets;
        self.requests += other.requests;
        self.failed += other.failed;
        self.dropped += other.dropped;
        self.elapsed += other.elapsed;
    }

    /// Committed requests per second of elapsed time.
    pub fn requests_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.requests as f64 / secs
    }
}

/// Processes batches of a locked shard through a [`Handler`].
pub struct Processor {
    handler: Handler,
    processor_lock: Lock,
    on_process_new_batch: Option<BatchCallback>,
    metrics: MetricsCollector,
}

impl Processor {
    pub fn new(backend: Arc<dyn Backend>, tracker: Box<dyn Tracker>) -> Self {
        Self {
            handler: Handler::new(tracker),
            processor_lock: Lock::new(backend, PROCESSOR_LOCK_KEY),
            on_process_new_batch: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Builder method to set the TTL of the processor lock.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.processor_lock = self.processor_lock.with_ttl(ttl);
        self
    }

    /// Builder method registering a callback run before each batch.
    pub fn with_batch_callback(mut self, callback: BatchCallback) -> Self {
        self.on_process_new_batch = Some(callback);
        self
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Takes the processor lock. Returns false if another invocation holds it.
    pub async fn acquire_lock(&mut self) -> Result<bool, QueueError> {
        self.processor_lock.acquire("").await
    }

    /// Releases the processor lock if this instance holds it.
    pub async fn unlock(&mut self) -> Result<bool, QueueError> {
        self.processor_lock.unlock().await
    }

    /// Drains full batches from `queue`, which `manager` must hold locked.
    ///
    /// Stops when the queue no longer holds a full batch or after
    /// [`MAX_BATCHES_PER_PROCESS`] batches. Returns immediately with empty
    /// stats when the tracker is not recording.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::LockLost` if the shard lock could not be extended;
    /// the open batch has been rolled back and nothing was trimmed.
    pub async fn process(
        &mut self,
        manager: &Manager,
        queue: &Queue,
    ) -> Result<ProcessStats, QueueError> {
        let mut stats = ProcessStats::default();
        if !self.handler.is_tracking_enabled() {
            debug!(shard_id = queue.id(), "Tracking disabled, skipping shard");
            return Ok(stats);
        }

        let started = Instant::now();
        for _ in 0..MAX_BATCHES_PER_PROCESS {
            if !queue.should_process().await? {
                break;
            }

            if let Some(callback) = &self.on_process_new_batch {
                callback(queue);
            }

            let batch = queue.peek_batch().await?;
            if !batch.is_empty() {
                self.process_with_retry(manager, queue, &batch, &mut stats)
                    .await?;
            }
            queue.mark_processed().await?;
            stats.batches += 1;
        }
        stats.elapsed = started.elapsed();

        if stats.batches > 0 {
            info!(
                shard_id = queue.id(),
                batches = stats.batches,
                request_sets = stats.request_sets,
                requests = stats.requests,
                dropped = stats.dropped,
                "Processed shard"
            );
        }
        Ok(stats)
    }

    /// Applies one batch, retrying the handler's retry set exactly once.
    async fn process_with_retry(
        &mut self,
        manager: &Manager,
        queue: &Queue,
        batch: &[RequestSet],
        stats: &mut ProcessStats,
    ) -> Result<(), QueueError> {
        let started = Instant::now();
        let mut committed: &[RequestSet] = batch;

        let mut failed = 0;
        let mut dropped = 0;

        let retry = self.process_batch(manager, batch).await?;
        if self.handler.has_errors() {
            failed += self.handler.error_count();
            committed = &[];

            if !retry.is_empty() {
                debug!(shard_id = queue.id(), retry = retry.len(), "Retrying request sets");
                let leftover = self.process_batch(manager, &retry).await?;

                if self.handler.has_errors() {
                    failed += self.handler.error_count();
                    dropped += retry.len();
                    warn!(
                        shard_id = queue.id(),
                        dropped = retry.len(),
                        unretried = leftover.len(),
                        "Dropping request sets that failed again after retry"
                    );
                } else {
                    committed = &retry;
                }
            }
        }

        let sets = committed.len();
        let requests: usize = committed.iter().map(RequestSet::len).sum();
        stats.request_sets += sets;
        stats.requests += requests;
        stats.failed += failed;
        stats.dropped += dropped;

        self.metrics.record_failures(failed as u64, dropped as u64);

        self.metrics.record_batch(
            queue.id(),
            sets as u64,
            requests as u64,
            started.elapsed().as_secs_f64(),
        );
        Ok(())
    }

    /// Applies request sets in one transaction and returns those to retry.
    ///
    /// Commits and returns an empty list when every set succeeded. Otherwise
    /// rolls back and returns the sets, or successful prefixes, that were
    /// applied before rollback.
    pub async fn process_batch(
        &mut self,
        manager: &Manager,
        request_sets: &[RequestSet],
    ) -> Result<Vec<RequestSet>, QueueError> {
        if request_sets.is_empty() {
            return Ok(Vec::new());
        }

        self.handler.begin_batch().await?;

        let mut total_requests = 0;
        for request_set in request_sets {
            total_requests += request_set.len();
            self.extend_lock(manager, lock_ttl_for(request_set.len()))
                .await?;

            if let Err(e) = self.handler.process_one(request_set).await {
                self.handler.on_error(request_set, &e);
            }
        }

        self.extend_lock(manager, lock_ttl_for(total_requests)).await?;

        if self.handler.has_errors() {
            Ok(self.handler.rollback().await?)
        } else {
            self.handler.commit().await?;
            Ok(Vec::new())
        }
    }

    /// Extends the shard lock, rolling back the open batch if it is gone.
    async fn extend_lock(&mut self, manager: &Manager, ttl_secs: u64) -> Result<(), QueueError> {
        let extended = match manager.expire_lock(ttl_secs).await {
            Ok(extended) => extended,
            Err(e) => {
                self.abort_batch().await;
                return Err(e);
            }
        };

        if !extended {
            let key = manager
                .held_lock_key()
                .unwrap_or("<no shard lock>")
                .to_string();
            error!(key = %key, "Shard lock lost while processing, rolling back batch");
            self.abort_batch().await;
            self.metrics.record_lock_lost();
            return Err(QueueError::LockLost { key });
        }

        // The processor lock must outlive the batch as well.
        if let Err(e) = self.processor_lock.expire(ttl_secs).await {
            warn!(error = %e, "Failed to extend processor lock");
        }
        Ok(())
    }

    async fn abort_batch(&mut self) {
        if let Err(e) = self.handler.rollback().await {
            error!(error = %e, "Rollback after lost lock failed");
        }
    }
}
