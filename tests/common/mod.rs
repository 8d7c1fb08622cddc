//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use queued_tracking::backend::{Backend, MemoryBackend};
use queued_tracking::tracker::{require_site_id, TrackedStore, Tracker, TrackerFactory};
use queued_tracking::{RequestSet, Settings, TrackerError, TrackingRequest};
use tokio::sync::Mutex;

pub fn memory_backend() -> Arc<dyn Backend> {
    Arc::new(MemoryBackend::new())
}

pub fn request(site: &str, visitor: &str) -> TrackingRequest {
    TrackingRequest::new()
        .with_param("idsite", site)
        .with_param("_id", visitor)
}

/// One-request set for `visitor`, tagged so tests can tell sets apart.
pub fn tagged_set(visitor: &str, tag: usize) -> RequestSet {
    RequestSet::new(vec![request("1", visitor).with_param("url", format!("/page/{}", tag))])
}

pub fn tag_of(request: &TrackingRequest) -> Option<usize> {
    request
        .param("url")
        .and_then(|url| url.strip_prefix("/page/"))
        .and_then(|tag| tag.parse().ok())
}

pub fn memory_settings(shard_count: u32, batch_size: usize) -> Settings {
    Settings::default()
        .with_shard_count(shard_count)
        .with_batch_size(batch_size)
}

/// Tracker that fails chosen `track_request` calls, counted across the tracker's life.
///
/// Call numbers start at 1 and include calls made inside rolled back batches.
pub struct ScriptedTracker {
    fail_on: HashSet<usize>,
    calls: Arc<AtomicUsize>,
    pending: Option<Vec<TrackingRequest>>,
    store: TrackedStore,
    requests_logged: u64,
}

impl ScriptedTracker {
    pub fn new(fail_on: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_on: fail_on.into_iter().collect(),
            calls: Arc::new(AtomicUsize::new(0)),
            pending: None,
            store: Arc::new(Mutex::new(Vec::new())),
            requests_logged: 0,
        }
    }

    pub fn store(&self) -> TrackedStore {
        self.store.clone()
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tracker for ScriptedTracker {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn begin_transaction(&mut self) -> Result<(), TrackerError> {
        self.pending = Some(Vec::new());
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), TrackerError> {
        let pending = self.pending.take().ok_or(TrackerError::NotInTransaction)?;
        self.store.lock().await.extend(pending);
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<(), TrackerError> {
        self.pending.take().ok_or(TrackerError::NotInTransaction)?;
        Ok(())
    }

    fn restore_environment(&mut self, _request_set: &RequestSet) {}

    async fn track_request(&mut self, request: &TrackingRequest) -> Result<(), TrackerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&call) {
            return Err(TrackerError::Failed(format!("scripted failure on call {}", call)));
        }
        require_site_id(request)?;

        let pending = self.pending.as_mut().ok_or(TrackerError::NotInTransaction)?;
        pending.push(request.clone());
        self.requests_logged += 1;
        Ok(())
    }

    fn requests_logged(&self) -> u64 {
        self.requests_logged
    }

    fn set_requests_logged(&mut self, count: u64) {
        self.requests_logged = count;
    }
}

/// Factory handing out memory trackers that all commit into `store`.
pub fn memory_tracker_factory(store: TrackedStore) -> TrackerFactory {
    Arc::new(move || {
        Box::new(queued_tracking::tracker::MemoryTracker::with_store(store.clone()))
            as Box<dyn Tracker>
    })
}
