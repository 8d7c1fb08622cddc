//! Boundary to the tracking engine.
//!
//! A [`Tracker`] turns individual tracking requests into stored analytics
//! data. The queue never looks inside a request; it only restores the captured
//! environment, hands each request to the tracker inside a transaction, and
//! commits or rolls back per batch.
//!
//! Two trackers ship with the crate:
//!
//! - [`SqliteTracker`]: stores requests in a `tracked_requests` table
//! - [`MemoryTracker`]: keeps committed requests in a shared vector

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TrackerError;
use crate::request_set::{RequestSet, TrackingRequest};

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryTracker, TrackedStore};
pub use sqlite::SqliteTracker;

/// The tracking engine as seen by the batch handler.
#[async_trait]
pub trait Tracker: Send {
    /// Whether recording is currently enabled. Processing is skipped when false.
    fn is_enabled(&self) -> bool;

    async fn begin_transaction(&mut self) -> Result<(), TrackerError>;

    async fn commit_transaction(&mut self) -> Result<(), TrackerError>;

    async fn rollback_transaction(&mut self) -> Result<(), TrackerError>;

    /// Makes the set's captured environment current for the following requests.
    fn restore_environment(&mut self, request_set: &RequestSet);

    /// Applies one request inside the open transaction.
    async fn track_request(&mut self, request: &TrackingRequest) -> Result<(), TrackerError>;

    /// Number of requests applied so far.
    fn requests_logged(&self) -> u64;

    fn set_requests_logged(&mut self, count: u64);
}

/// Builds a fresh tracker for each worker.
pub type TrackerFactory = Arc<dyn Fn() -> Box<dyn Tracker> + Send + Sync>;

/// Returns the numeric site id of a request.
///
/// # Errors
///
/// Returns `TrackerError::InvalidRequest` when `idsite` is missing or not a
/// positive integer.
pub fn require_site_id(request: &TrackingRequest) -> Result<i64, TrackerError> {
    let raw = request
        .site_id()
        .ok_or_else(|| TrackerError::InvalidRequest("missing idsite".to_string()))?;

    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(TrackerError::InvalidRequest(format!(
            "invalid idsite '{}'",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_site_id() {
        let ok = TrackingRequest::new().with_param("idsite", "7");
        assert_eq!(require_site_id(&ok).unwrap(), 7);

        let missing = TrackingRequest::new().with_param("url", "/");
        assert!(matches!(
            require_site_id(&missing),
            Err(TrackerError::InvalidRequest(_))
        ));

        let zero = TrackingRequest::new().with_param("idsite", "0");
        assert!(require_site_id(&zero).is_err());

        let text = TrackingRequest::new().with_param("idsite", "abc");
        let err = require_site_id(&text).expect_err("non-numeric idsite should fail");
        assert!(err.to_string().contains("abc"));
    }
}
