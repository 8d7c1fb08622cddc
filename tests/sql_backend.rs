//! The whole pipeline over SQLite files: SQL-table queue backend and SQLite tracker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::tagged_set;
use futures::future::join_all;
use queued_tracking::backend::{self, Backend, SqlBackend};
use queued_tracking::lock::{Lock, SHARD_LOCK_PREFIX};
use queued_tracking::tracker::{SqliteTracker, Tracker, TrackerFactory};
use queued_tracking::{BackendKind, QueuedTracking, Settings, WorkerReport};

fn sql_settings(dir: &tempfile::TempDir) -> Settings {
    Settings::default()
        .with_backend(BackendKind::Sql)
        .with_sql_path(dir.path().join("queue.db").to_string_lossy().to_string())
        .with_shard_count(2)
        .with_batch_size(2)
}

#[tokio::test]
async fn test_enqueue_and_process_through_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let settings = sql_settings(&dir);

    let tracker_path = dir.path().join("tracked.db");
    let tracker = SqliteTracker::open(&tracker_path.to_string_lossy())
        .await
        .expect("tracker database should open");
    let pool = tracker.pool().clone();
    let factory: TrackerFactory =
        Arc::new(move || Box::new(SqliteTracker::with_pool(pool.clone())) as Box<dyn Tracker>);

    let service = QueuedTracking::connect(settings, factory)
        .await
        .expect("service should connect");
    for tag in 0..4 {
        service
            .enqueue(&tagged_set("visitor-a", tag))
            .await
            .expect("enqueue should succeed");
    }
    assert_eq!(service.manager().total_queued().await.unwrap(), 4);

    let mut worker = service.worker().expect("worker should build");
    let report = worker.run_once().await.expect("run should succeed");
    assert_eq!(report.stats().map(|s| s.requests), Some(4));

    assert_eq!(tracker.count_tracked(Some(1)).await.unwrap(), 4);
    assert_eq!(service.manager().total_queued().await.unwrap(), 0);
    assert_eq!(
        worker.run_once().await.unwrap(),
        WorkerReport::NothingToProcess
    );
}

#[tokio::test]
async fn test_sql_lock_has_single_holder() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend: Arc<dyn Backend> = Arc::new(
        SqlBackend::open(&dir.path().join("locks.db").to_string_lossy())
            .await
            .expect("backend should open"),
    );

    let attempts = (0..8).map(|_| {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut lock = Lock::new(backend, SHARD_LOCK_PREFIX);
            lock.acquire("0").await.expect("acquire should not error")
        })
    });
    let winners = join_all(attempts)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().expect("task should not panic"))
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_sql_lock_expires() {
    let backend: Arc<dyn Backend> =
        Arc::new(SqlBackend::in_memory().await.expect("backend should open"));

    let mut first = Lock::new(backend.clone(), SHARD_LOCK_PREFIX)
        .with_ttl(Duration::from_millis(50));
    assert!(first.acquire("3").await.unwrap());
    assert!(backend.time_to_live_millis("QueuedTrackingLock3").await.unwrap() <= 50);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(backend.time_to_live_millis("QueuedTrackingLock3").await.unwrap(), 0);

    let mut second = Lock::new(backend, SHARD_LOCK_PREFIX);
    assert!(second.acquire("3").await.unwrap());
    assert!(!first.unlock().await.unwrap());
    assert!(second.unlock().await.unwrap());
}

#[tokio::test]
async fn test_self_test_passes_on_sql_backend() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let settings = sql_settings(&dir);
    let backend = backend::connect(&settings).await.expect("backend should connect");

    let status = queued_tracking::status::Status::new(backend.clone(), &settings).unwrap();
    let checks = status.self_test().await.expect("self-test should run");
    assert!(!checks.is_empty());
    assert!(checks.iter().all(|c| c.passed), "failed checks: {:?}", checks);

    assert!(backend
        .keys_matching("queuedTrackingSelfTest*")
        .await
        .unwrap()
        .is_empty());
}
