//! Transactional unit of work around the tracker for one batch.
//!
//! The handler applies request sets to a [`Tracker`] inside one transaction
//! per batch and keeps track of what was applied. A failure inside a set keeps
//! only the prefix of requests that succeeded before it. When the batch rolls
//! back, those applied sets (whole or truncated) become the retry candidates;
//! when it commits there is nothing to retry.

use tracing::warn;

use crate::error::TrackerError;
use crate::request_set::RequestSet;
use crate::tracker::Tracker;

/// Applies batches of request sets to a tracker.
pub struct Handler {
    tracker: Box<dyn Tracker>,
    has_errors: bool,
    error_count: usize,
    /// Sets (or successful prefixes) applied in the open transaction.
    applied: Vec<RequestSet>,
    retry_candidates: Vec<RequestSet>,
    /// Requests applied from the set currently being processed.
    applied_in_current: usize,
    logged_before_batch: u64,
}

impl Handler {
    pub fn new(tracker: Box<dyn Tracker>) -> Self {
        Self {
            tracker,
            has_errors: false,
            error_count: 0,
            applied: Vec::new(),
            retry_candidates: Vec::new(),
            applied_in_current: 0,
            logged_before_batch: 0,
        }
    }

    /// Whether the tracker is currently recording.
    pub fn is_tracking_enabled(&self) -> bool {
        self.tracker.is_enabled()
    }

    /// Opens a transaction and resets the per-batch state.
    pub async fn begin_batch(&mut self) -> Result<(), TrackerError> {
        self.has_errors = false;
        self.error_count = 0;
        self.applied.clear();
        self.retry_candidates.clear();
        self.applied_in_current = 0;
        self.logged_before_batch = self.tracker.requests_logged();

        self.tracker.begin_transaction().await
    }

    /// Applies every request of one set in order.
    ///
    /// Stops at the first failing request and returns its error; the requests
    /// applied before it are remembered for [`Handler::on_error`].
    pub async fn process_one(&mut self, request_set: &RequestSet) -> Result<(), TrackerError> {
        self.applied_in_current = 0;
        self.tracker.restore_environment(request_set);

        for request in request_set.requests() {
            self.tracker.track_request(request).await?;
            self.applied_in_current += 1;
        }

        self.applied.push(request_set.clone());
        Ok(())
    }

    /// Records a failure of `request_set`.
    ///
    /// Keeps the successfully applied prefix, if any, as a retry candidate.
    pub fn on_error(&mut self, request_set: &RequestSet, error: &TrackerError) {
        self.has_errors = true;
        self.error_count += 1;

        let failed = request_set.requests().get(self.applied_in_current);
        let visitor = failed
            .map(|r| request_set.routing_identity(r))
            .unwrap_or_default();
        warn!(
            site_id = failed.and_then(|r| r.site_id()).unwrap_or("-"),
            visitor = %visitor,
            position = self.applied_in_current,
            requests = request_set.len(),
            error = %error,
            "Failed to track request"
        );

        if self.applied_in_current > 0 {
            self.applied
                .push(request_set.truncated(self.applied_in_current));
        }
        self.applied_in_current = 0;
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    /// Number of request sets that failed in the current batch.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Rolls the batch back and returns the sets to retry.
    pub async fn rollback(&mut self) -> Result<Vec<RequestSet>, TrackerError> {
        self.retry_candidates = std::mem::take(&mut self.applied);
        self.tracker.set_requests_logged(self.logged_before_batch);
        self.tracker.rollback_transaction().await?;
        Ok(self.retry_candidates.clone())
    }

    /// Commits the batch. Nothing is left to retry afterwards.
    pub async fn commit(&mut self) -> Result<(), TrackerError> {
        self.applied.clear();
        self.retry_candidates.clear();
        self.tracker.commit_transaction().await
    }

    /// Retry candidates determined by the last rollback.
    pub fn retry_candidates(&self) -> &[RequestSet] {
        &self.retry_candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_set::TrackingRequest;
    use crate::tracker::MemoryTracker;

    fn valid(url: &str) -> TrackingRequest {
        TrackingRequest::new()
            .with_param("idsite", "1")
            .with_param("url", url)
    }

    fn invalid() -> TrackingRequest {
        TrackingRequest::new().with_param("url", "/broken")
    }

    async fn run(handler: &mut Handler, sets: &[RequestSet]) {
        handler.begin_batch().await.unwrap();
        for set in sets {
            if let Err(e) = handler.process_one(set).await {
                handler.on_error(set, &e);
            }
        }
    }

    #[tokio::test]
    async fn test_commit_leaves_nothing_to_retry() {
        let tracker = MemoryTracker::new();
        let store = tracker.store();
        let mut handler = Handler::new(Box::new(tracker));

        run(&mut handler, &[RequestSet::new(vec![valid("/a"), valid("/b")])]).await;
        assert!(!handler.has_errors());
        handler.commit().await.unwrap();

        assert!(handler.retry_candidates().is_empty());
        assert_eq!(store.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_successful_prefix() {
        let tracker = MemoryTracker::new();
        let store = tracker.store();
        let mut handler = Handler::new(Box::new(tracker));

        let before = RequestSet::new(vec![valid("/before")]);
        let partial = RequestSet::new(vec![
            valid("/1"),
            valid("/2"),
            invalid(),
            valid("/4"),
            valid("/5"),
        ]);
        let first_fails = RequestSet::new(vec![invalid(), valid("/x")]);
        let after = RequestSet::new(vec![valid("/after")]);

        run(
            &mut handler,
            &[before.clone(), partial.clone(), first_fails, after.clone()],
        )
        .await;
        assert!(handler.has_errors());
        assert_eq!(handler.error_count(), 2);

        let retry = handler.rollback().await.unwrap();
        assert_eq!(retry, vec![before, partial.truncated(2), after]);
        assert_eq!(retry[1].len(), 2);
        assert_eq!(handler.retry_candidates().len(), 3);
        assert!(store.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_logged_count() {
        let mut handler = Handler::new(Box::new(MemoryTracker::new()));

        run(&mut handler, &[RequestSet::new(vec![valid("/a")])]).await;
        handler.commit().await.unwrap();

        run(&mut handler, &[RequestSet::new(vec![valid("/b"), invalid()])]).await;
        handler.rollback().await.unwrap();
        assert_eq!(handler.tracker.requests_logged(), 1);
    }

    #[tokio::test]
    async fn test_begin_batch_clears_previous_retry_candidates() {
        let mut handler = Handler::new(Box::new(MemoryTracker::new()));

        run(&mut handler, &[RequestSet::new(vec![valid("/a"), invalid()])]).await;
        assert_eq!(handler.rollback().await.unwrap().len(), 1);

        run(&mut handler, &[RequestSet::new(vec![valid("/b")])]).await;
        assert!(handler.retry_candidates().is_empty());
        assert!(!handler.has_errors());
        handler.commit().await.unwrap();
    }
}
