//! Producer-facing entry point.
//!
//! [`QueuedTracking`] ties one backend, the settings and a tracker factory
//! together. On connect it applies the configured shard count, migrating queued
//! data out of removed shards when the count shrank, before anything is routed
//! with the new count.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{self, Backend};
use crate::config::Settings;
use crate::error::{BackendError, QueueError};
use crate::lock::Lock;
use crate::manager::Manager;
use crate::request_set::RequestSet;
use crate::status::Status;
use crate::tracker::TrackerFactory;
use crate::worker::{Worker, WorkerReport};

/// Backend key storing the shard count the queue was last laid out with.
pub const SHARD_COUNT_KEY: &str = "trackingQueueShardCount";

/// Lock serializing shard-count migrations across processes.
pub const MIGRATION_LOCK_KEY: &str = "trackingQueueMigrationLock";

const MIGRATION_LOCK_TTL: Duration = Duration::from_secs(300);
const MIGRATION_LOCK_ATTEMPTS: u32 = 50;
const MIGRATION_LOCK_RETRY: Duration = Duration::from_millis(200);

/// Queue facade used by producers and operational tooling.
pub struct QueuedTracking {
    backend: Arc<dyn Backend>,
    settings: Settings,
    manager: Manager,
    tracker_factory: TrackerFactory,
    inline_worker: Option<Mutex<Worker>>,
}

impl QueuedTracking {
    /// Connects to the configured backend and applies the shard count.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Backend` if the backend is unreachable, or any
    /// error raised while migrating shards.
    pub async fn connect(
        settings: Settings,
        tracker_factory: TrackerFactory,
    ) -> Result<Self, QueueError> {
        let backend = backend::connect(&settings).await?;
        Self::with_backend(backend, settings, tracker_factory).await
    }

    /// Builds the facade over an existing backend.
    pub async fn with_backend(
        backend: Arc<dyn Backend>,
        settings: Settings,
        tracker_factory: TrackerFactory,
    ) -> Result<Self, QueueError> {
        let mut manager = Manager::from_settings(backend.clone(), &settings)?;
        sync_shard_count(&backend, &mut manager).await?;

        let inline_worker = if settings.process_during_tracking_request {
            let worker = Worker::new(backend.clone(), &settings, tracker_factory())?;
            Some(Mutex::new(worker))
        } else {
            None
        };

        Ok(Self {
            backend,
            settings,
            manager,
            tracker_factory,
            inline_worker,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Whether requests should go through the queue at all.
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Routes a request set into the queue. Empty sets are ignored.
    ///
    /// With inline processing enabled, one worker invocation follows the
    /// append. Its failures are logged and never returned to the producer.
    pub async fn enqueue(&self, request_set: &RequestSet) -> Result<(), QueueError> {
        if request_set.is_empty() {
            return Ok(());
        }

        self.manager.route_to_shard(request_set).await?;

        if let Some(worker) = &self.inline_worker {
            // Another producer is already processing inline.
            let Ok(mut worker) = worker.try_lock() else {
                return Ok(());
            };
            match worker.run_once().await {
                Ok(WorkerReport::Processed(stats)) => {
                    debug!(requests = stats.requests, "Processed queue inline");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Inline queue processing failed"),
            }
        }
        Ok(())
    }

    /// Creates a worker with its own tracker.
    pub fn worker(&self) -> Result<Worker, QueueError> {
        Worker::new(
            self.backend.clone(),
            &self.settings,
            (self.tracker_factory)(),
        )
    }

    pub fn tracker_factory(&self) -> TrackerFactory {
        self.tracker_factory.clone()
    }

    pub fn status(&self) -> Result<Status, QueueError> {
        Status::new(self.backend.clone(), &self.settings)
    }
}

/// Reads the stored shard count.
pub async fn stored_shard_count(backend: &Arc<dyn Backend>) -> Result<Option<u32>, QueueError> {
    let Some(raw) = backend.get(SHARD_COUNT_KEY).await? else {
        return Ok(None);
    };

    match raw.parse::<u32>() {
        Ok(count) => Ok(Some(count)),
        Err(_) => {
            warn!(value = %raw, "Ignoring unparseable stored shard count");
            Ok(None)
        }
    }
}

async fn store_shard_count(backend: &Arc<dyn Backend>, count: u32) -> Result<(), QueueError> {
    backend.delete_key(SHARD_COUNT_KEY).await?;
    backend
        .set_if_absent(SHARD_COUNT_KEY, &count.to_string(), Duration::ZERO)
        .await?;
    Ok(())
}

/// Applies the manager's shard count, migrating from the stored one if it shrank.
///
/// Runs under the migration lock so that concurrent processes migrate once.
pub async fn sync_shard_count(
    backend: &Arc<dyn Backend>,
    manager: &mut Manager,
) -> Result<(), QueueError> {
    let configured = manager.shard_count();
    if stored_shard_count(backend).await? == Some(configured) {
        return Ok(());
    }

    let mut lock = Lock::new(backend.clone(), MIGRATION_LOCK_KEY).with_ttl(MIGRATION_LOCK_TTL);
    let mut acquired = false;
    for _ in 0..MIGRATION_LOCK_ATTEMPTS {
        if lock.acquire("").await? {
            acquired = true;
            break;
        }
        tokio::time::sleep(MIGRATION_LOCK_RETRY).await;
    }
    if !acquired {
        return Err(BackendError::Timeout(MIGRATION_LOCK_RETRY * MIGRATION_LOCK_ATTEMPTS).into());
    }

    let result = migrate_locked(backend, manager, configured).await;
    let released = lock.unlock().await;
    result?;
    released?;
    Ok(())
}

async fn migrate_locked(
    backend: &Arc<dyn Backend>,
    manager: &mut Manager,
    configured: u32,
) -> Result<(), QueueError> {
    // Re-read: another process may have finished the migration meanwhile.
    match stored_shard_count(backend).await? {
        Some(stored) if stored == configured => return Ok(()),
        Some(stored) => {
            info!(from = stored, to = configured, "Shard count changed");
            manager.migrate_shards(stored, configured).await?;
        }
        None => {}
    }

    store_shard_count(backend, configured).await
}
