//! Lock exclusivity and ownership under concurrency.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{memory_backend, memory_settings, tagged_set};
use futures::future::join_all;
use queued_tracking::backend::Backend;
use queued_tracking::lock::{Lock, SHARD_LOCK_PREFIX};
use queued_tracking::tracker::{MemoryTracker, TrackedStore, Tracker};
use queued_tracking::{
    Manager, Queue, RequestSet, TrackerError, TrackingRequest, Worker, WorkerReport,
};

const STOLEN_TOKEN: &str = "other-worker";

/// Memory tracker that hands shard 0 to another owner during its first request.
struct LockStealingTracker {
    inner: MemoryTracker,
    backend: Arc<dyn Backend>,
    stolen: bool,
}

#[async_trait]
impl Tracker for LockStealingTracker {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn begin_transaction(&mut self) -> Result<(), TrackerError> {
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&mut self) -> Result<(), TrackerError> {
        self.inner.commit_transaction().await
    }

    async fn rollback_transaction(&mut self) -> Result<(), TrackerError> {
        self.inner.rollback_transaction().await
    }

    fn restore_environment(&mut self, request_set: &RequestSet) {
        self.inner.restore_environment(request_set);
    }

    async fn track_request(&mut self, request: &TrackingRequest) -> Result<(), TrackerError> {
        if !self.stolen {
            self.stolen = true;
            let key = format!("{}0", SHARD_LOCK_PREFIX);
            self.backend.delete_key(&key).await.expect("delete should succeed");
            assert!(self
                .backend
                .set_if_absent(&key, STOLEN_TOKEN, Duration::from_secs(60))
                .await
                .expect("set should succeed"));
        }
        self.inner.track_request(request).await
    }

    fn requests_logged(&self) -> u64 {
        self.inner.requests_logged()
    }

    fn set_requests_logged(&mut self, count: u64) {
        self.inner.set_requests_logged(count);
    }
}

#[tokio::test]
async fn test_at_most_one_holder_per_key() {
    let backend = memory_backend();

    let attempts = (0..32).map(|_| {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut lock = Lock::new(backend, SHARD_LOCK_PREFIX);
            lock.acquire("0").await.expect("acquire should not error")
        })
    });

    let winners = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.expect("task should not panic"))
        .filter(|acquired| *acquired)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_unlock_and_extend_require_ownership() {
    let backend = memory_backend();
    let mut owner = Lock::new(backend.clone(), SHARD_LOCK_PREFIX)
        .with_ttl(Duration::from_millis(50));
    assert!(owner.acquire("1").await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;

    let mut thief = Lock::new(backend.clone(), SHARD_LOCK_PREFIX);
    assert!(thief.acquire("1").await.expect("expired lock should be free"));

    // The first owner lost the key and must not touch the new holder's lock.
    assert!(!owner.is_locked().await.unwrap());
    assert!(!owner.expire(30).await.unwrap());
    assert!(!owner.unlock().await.unwrap());

    assert!(thief.is_locked().await.unwrap());
    assert!(thief.unlock().await.unwrap());
    assert_eq!(thief.count_acquired().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_managers_lock_distinct_shards() {
    let backend = memory_backend();
    let producer = Manager::new(backend.clone(), 4, 1).expect("manager should build");
    for (tag, visitor) in ["visitor-a", "0123456789abcdef", "1111111111111111"]
        .iter()
        .enumerate()
    {
        producer.route_to_shard(&tagged_set(visitor, tag)).await.unwrap();
    }

    let tasks = (0..6).map(|_| {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut manager = Manager::new(backend, 4, 1).expect("manager should build");
            let locked = manager.lock_next().await.expect("lock_next should not error");
            locked.map(|queue| queue.id())
        })
    });

    let mut locked: Vec<u32> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|r| r.expect("task should not panic"))
        .collect();
    locked.sort_unstable();
    assert_eq!(locked, vec![0, 2, 3]);
}

#[tokio::test]
async fn test_processor_lock_serializes_invocations() {
    let backend = memory_backend();
    let settings = memory_settings(1, 1);
    let producer = Manager::new(backend.clone(), 1, 1).unwrap();
    producer.route_to_shard(&tagged_set("visitor-a", 0)).await.unwrap();

    let mut holder = Lock::new(backend.clone(), "globalProcessorLock");
    assert!(holder.acquire("").await.unwrap());

    let mut worker = Worker::new(backend.clone(), &settings, Box::new(MemoryTracker::new()))
        .expect("worker should build");
    assert_eq!(
        worker.run_once().await.unwrap(),
        WorkerReport::AlreadyRunning
    );

    holder.unlock().await.unwrap();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.stats().map(|s| s.request_sets), Some(1));

    // Every lock is released once the invocation returns.
    assert!(backend
        .keys_matching("*Lock*")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_parallel_workers_without_processor_lock() {
    let backend = memory_backend();
    let settings = memory_settings(4, 1).with_processor_lock(false);
    let producer = Manager::new(backend.clone(), 4, 1).unwrap();

    let visitors = ["visitor-a", "0123456789abcdef", "1111111111111111"];
    for tag in 0..30 {
        producer
            .route_to_shard(&tagged_set(visitors[tag % visitors.len()], tag))
            .await
            .unwrap();
    }

    let tracker = MemoryTracker::new();
    let store = tracker.store();
    let workers = (0..3).map(|_| {
        let backend = backend.clone();
        let settings = settings.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let mut worker =
                Worker::new(backend, &settings, Box::new(MemoryTracker::with_store(store)))
                    .expect("worker should build");
            worker.run_once().await.expect("run should succeed")
        })
    });
    for result in join_all(workers).await {
        result.expect("task should not panic");
    }

    // A final pass finds nothing left behind by the racing workers.
    let mut sweeper = Worker::new(
        backend.clone(),
        &settings,
        Box::new(MemoryTracker::with_store(store.clone())),
    )
    .expect("worker should build");
    assert_eq!(
        sweeper.run_once().await.unwrap(),
        WorkerReport::NothingToProcess
    );

    let mut tags: Vec<_> = store
        .lock()
        .await
        .iter()
        .filter_map(common::tag_of)
        .collect();
    tags.sort_unstable();
    assert_eq!(tags, (0..30).collect::<Vec<_>>());
    assert_eq!(producer.total_queued().await.unwrap(), 0);
}

#[tokio::test]
async fn test_lock_taken_over_mid_batch_rolls_back() {
    let backend = memory_backend();
    let settings = memory_settings(1, 2);
    let queue = Queue::new(backend.clone(), 0, 2);
    queue.append(&tagged_set("visitor-a", 0)).await.unwrap();
    queue.append(&tagged_set("visitor-a", 1)).await.unwrap();

    let store = TrackedStore::default();
    let tracker = LockStealingTracker {
        inner: MemoryTracker::with_store(store.clone()),
        backend: backend.clone(),
        stolen: false,
    };
    let mut worker =
        Worker::new(backend.clone(), &settings, Box::new(tracker)).expect("worker should build");

    let err = worker.run_once().await.expect_err("run should lose its lock");
    assert!(err.is_lock_lost());

    // Nothing committed, nothing trimmed, and the new owner keeps the shard.
    assert!(store.lock().await.is_empty());
    assert_eq!(queue.count().await.unwrap(), 2);
    assert_eq!(
        backend.get("QueuedTrackingLock0").await.unwrap().as_deref(),
        Some(STOLEN_TOKEN)
    );
}
