//! Process-local tracker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{require_site_id, Tracker};
use crate::error::TrackerError;
use crate::request_set::{RequestSet, TrackingRequest};

/// Committed requests, shared between trackers built from the same store.
pub type TrackedStore = Arc<Mutex<Vec<TrackingRequest>>>;

/// Tracker that buffers requests per transaction and appends them to a
/// shared store on commit.
///
/// Applies the same validation as [`super::SqliteTracker`]: a request
/// without a valid `idsite` fails.
pub struct MemoryTracker {
    store: TrackedStore,
    pending: Option<Vec<TrackingRequest>>,
    requests_logged: u64,
    enabled: bool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::with_store(TrackedStore::default())
    }

    /// Creates a tracker committing into an existing store.
    pub fn with_store(store: TrackedStore) -> Self {
        Self {
            store,
            pending: None,
            requests_logged: 0,
            enabled: true,
        }
    }

    /// Builder method to toggle recording.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn store(&self) -> TrackedStore {
        self.store.clone()
    }

    /// Returns a copy of everything committed so far.
    pub async fn committed(&self) -> Vec<TrackingRequest> {
        self.store.lock().await.clone()
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    fn is_enabled(&self) -> bool {
        self.enabled
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
        let pending = self.pending.as_mut().ok_or(TrackerError::NotInTransaction)?;
        require_site_id(request)?;
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
