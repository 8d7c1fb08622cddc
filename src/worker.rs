//! Worker invocations and an in-process worker pool.
//!
//! A [`Worker`] is what one "process the queue" run executes: take the
//! processor lock, check shard-lock capacity, then lock and drain shards one at
//! a time until none needs processing. Every lock taken is released on the
//! way out, whichever way the run ends.
//!
//! [`WorkerPool`] runs several workers as tokio tasks sharing one backend,
//! each with its own locks and tracker, until a shutdown signal is broadcast.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::Settings;
use crate::error::QueueError;
use crate::manager::Manager;
use crate::metrics::MetricsCollector;
use crate::processor::{ProcessStats, Processor};
use crate::tracker::{Tracker, TrackerFactory};

/// Outcome of one worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    /// At least one shard was locked and processed.
    Processed(ProcessStats),
    /// No shard held a full batch that could be locked.
    NothingToProcess,
    /// Every shard lock is already held by other workers.
    CapacityExhausted,
    /// Another invocation holds the processor lock.
    AlreadyRunning,
    /// The tracker is not recording; queues are left untouched.
    TrackingDisabled,
}

impl WorkerReport {
    pub fn stats(&self) -> Option<&ProcessStats> {
        match self {
            WorkerReport::Processed(stats) => Some(stats),
            _ => None,
        }
    }
}

/// One worker: a manager, a processor and the locks they hold.
pub struct Worker {
    manager: Manager,
    processor: Processor,
    use_processor_lock: bool,
    metrics: MetricsCollector,
}

impl Worker {
    /// Creates a worker over `backend` applying requests to `tracker`.
    pub fn new(
        backend: Arc<dyn Backend>,
        settings: &Settings,
        tracker: Box<dyn Tracker>,
    ) -> Result<Self, QueueError> {
        let manager = Manager::from_settings(backend.clone(), settings)?;
        let processor = Processor::new(backend, tracker).with_lock_ttl(settings.lock_ttl());

        Ok(Self {
            manager,
            processor,
            use_processor_lock: settings.processor_lock,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut Manager {
        &mut self.manager
    }

    /// Runs one invocation.
    ///
    /// # Errors
    ///
    /// Backend failures and `QueueError::LockLost` abort the invocation; all
    /// locks are still released before the error is returned.
    pub async fn run_once(&mut self) -> Result<WorkerReport, QueueError> {
        if self.use_processor_lock && !self.processor.acquire_lock().await? {
            debug!("Processor lock held elsewhere");
            return Ok(WorkerReport::AlreadyRunning);
        }

        self.metrics.worker_started();
        let result = self.drain().await;
        self.metrics.worker_finished();

        let released = self.release().await;
        let report = result?;
        released?;
        Ok(report)
    }

    async fn drain(&mut self) -> Result<WorkerReport, QueueError> {
        if !self.processor.handler().is_tracking_enabled() {
            debug!("Tracking disabled, leaving queues untouched");
            return Ok(WorkerReport::TrackingDisabled);
        }
        if !self.manager.can_acquire_more_locks().await? {
            return Ok(WorkerReport::CapacityExhausted);
        }

        let started = Instant::now();
        let mut total = ProcessStats::default();
        let mut processed_any = false;

        while let Some(queue) = self.manager.lock_next().await? {
            processed_any = true;
            let stats = self.processor.process(&self.manager, &queue).await?;
            total.merge(&stats);

            self.metrics
                .set_queue_depth(queue.id(), queue.count().await?);
        }

        if !processed_any {
            return Ok(WorkerReport::NothingToProcess);
        }
        total.elapsed = started.elapsed();
        Ok(WorkerReport::Processed(total))
    }

    /// Releases the shard lock and the processor lock, attempting both.
    async fn release(&mut self) -> Result<(), QueueError> {
        let shard = self.manager.unlock().await;
        let processor = if self.use_processor_lock {
            self.processor.unlock().await.map(|_| ())
        } else {
            Ok(())
        };
        shard?;
        processor
    }
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Pause between invocations that found nothing to do.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Invocations that processed at least one shard.
    pub invocations: u64,
    pub request_sets_processed: u64,
    pub requests_processed: u64,
    pub request_sets_dropped: u64,
    /// Invocations that ended in an error.
    pub failures: u64,
}

#[derive(Default)]
struct SharedPoolStats {
    invocations: AtomicU64,
    request_sets_processed: AtomicU64,
    requests_processed: AtomicU64,
    request_sets_dropped: AtomicU64,
    failures: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, stats: &ProcessStats) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.request_sets_processed
            .fetch_add(stats.request_sets as u64, Ordering::SeqCst);
        self.requests_processed
            .fetch_add(stats.requests as u64, Ordering::SeqCst);
        self.request_sets_dropped
            .fetch_add(stats.dropped as u64, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            invocations: self.invocations.load(Ordering::SeqCst),
            request_sets_processed: self.request_sets_processed.load(Ordering::SeqCst),
            requests_processed: self.requests_processed.load(Ordering::SeqCst),
            request_sets_dropped: self.request_sets_dropped.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Pool of workers draining the queue until shut down.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    backend: Arc<dyn Backend>,
    settings: Settings,
    tracker_factory: TrackerFactory,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool; workers are spawned by [`WorkerPool::start`].
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `backend` - Backend shared by every worker
    /// * `settings` - Shard, batch and lock settings
    /// * `tracker_factory` - Builds one tracker per worker
    pub fn new(
        config: WorkerPoolConfig,
        backend: Arc<dyn Backend>,
        settings: Settings,
        tracker_factory: TrackerFactory,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            backend,
            settings,
            tracker_factory,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running, or
    /// `PoolError::WorkerInitFailed` if the settings are unusable.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        if self.config.num_workers > 1 && self.settings.processor_lock {
            warn!(
                num_workers = self.config.num_workers,
                "Processor lock is enabled, workers will take turns instead of running in parallel"
            );
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                self.backend.clone(),
                &self.settings,
                (self.tracker_factory)(),
            )?;
            let task = PoolTask {
                id: format!("worker-{}", i),
                worker,
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
            };

            self.worker_handles.push(tokio::spawn(task.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Signals all workers to stop and waits for their current invocation.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within the
    /// configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// A worker running inside the pool.
struct PoolTask {
    id: String,
    worker: Worker,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl PoolTask {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let idle = match self.worker.run_once().await {
                Ok(WorkerReport::Processed(stats)) => {
                    self.stats.record(&stats);
                    debug!(
                        worker_id = %self.id,
                        requests = stats.requests,
                        "Invocation finished"
                    );
                    false
                }
                Ok(report) => {
                    debug!(worker_id = %self.id, report = ?report, "Nothing processed");
                    true
                }
                Err(e) => {
                    self.stats.record_failure();
                    error!(worker_id = %self.id, error = %e, "Worker invocation failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}
