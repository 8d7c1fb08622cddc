//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, BATCH_DURATION, LOCKS_LOST, QUEUE_DEPTH, REQUESTS_TRACKED,
    REQUEST_SETS_DROPPED, REQUEST_SETS_ENQUEUED, REQUEST_SETS_FAILED, REQUEST_SETS_PROCESSED,
};

/// Metrics collector for queue and processing events.
///
/// Every method is a no-op until [`super::init_metrics`] has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record request sets appended to a shard.
    pub fn record_enqueued(&self, shard_id: u32, request_sets: u64) {
        if let Some(enqueued) = REQUEST_SETS_ENQUEUED.get() {
            enqueued
                .with_label_values(&[shard_id.to_string().as_str()])
                .inc_by(request_sets as f64);
        }
    }

    /// Record one processed batch.
    ///
    /// # Arguments
    ///
    /// * `shard_id` - Shard the batch was read from
    /// * `committed_sets` - Request sets committed to the tracker
    /// * `committed_requests` - Individual requests inside those sets
    /// * `duration_secs` - Time spent on the batch including its retry pass
    pub fn record_batch(
        &self,
        shard_id: u32,
        committed_sets: u64,
        committed_requests: u64,
        duration_secs: f64,
    ) {
        if let Some(processed) = REQUEST_SETS_PROCESSED.get() {
            processed
                .with_label_values(&[shard_id.to_string().as_str()])
                .inc_by(committed_sets as f64);
        }

        if let Some(tracked) = REQUESTS_TRACKED.get() {
            tracked.inc_by(committed_requests as f64);
        }

        if let Some(duration) = BATCH_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            shard_id = shard_id,
            committed_sets = committed_sets,
            committed_requests = committed_requests,
            duration_secs = duration_secs,
            "Recorded batch metric"
        );
    }

    /// Record request sets that failed, and those dropped after their retry.
    pub fn record_failures(&self, failed: u64, dropped: u64) {
        if let Some(counter) = REQUEST_SETS_FAILED.get() {
            counter.inc_by(failed as f64);
        }
        if let Some(counter) = REQUEST_SETS_DROPPED.get() {
            counter.inc_by(dropped as f64);
        }
    }

    pub fn record_lock_lost(&self) {
        if let Some(counter) = LOCKS_LOST.get() {
            counter.inc();
        }
    }

    /// Update the depth gauge of one shard.
    pub fn set_queue_depth(&self, shard_id: u32, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge
                .with_label_values(&[shard_id.to_string().as_str()])
                .set(depth as f64);
        }
    }

    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_finished(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
