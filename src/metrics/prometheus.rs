//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by queued-tracking and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all queued-tracking metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of request sets waiting, labeled by shard id.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Total request sets appended to a shard, labeled by shard id.
pub static REQUEST_SETS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Total request sets committed to the tracker, labeled by shard id.
pub static REQUEST_SETS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Total individual requests committed to the tracker.
pub static REQUESTS_TRACKED: OnceLock<Counter> = OnceLock::new();

/// Total request sets that reported a tracking failure.
pub static REQUEST_SETS_FAILED: OnceLock<Counter> = OnceLock::new();

/// Total request sets discarded after failing their retry pass.
pub static REQUEST_SETS_DROPPED: OnceLock<Counter> = OnceLock::new();

/// Total times a shard lock was lost mid-batch.
pub static LOCKS_LOST: OnceLock<Counter> = OnceLock::new();

/// Batch processing duration in seconds.
pub static BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of workers currently inside a processing invocation.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new(
            "queued_tracking_queue_depth",
            "Number of request sets waiting in a shard",
        ),
        &["shard"],
    )?;

    let request_sets_enqueued = CounterVec::new(
        Opts::new(
            "queued_tracking_request_sets_enqueued_total",
            "Total request sets appended to a shard",
        ),
        &["shard"],
    )?;

    // Processing metrics
    let request_sets_processed = CounterVec::new(
        Opts::new(
            "queued_tracking_request_sets_processed_total",
            "Total request sets committed to the tracker",
        ),
        &["shard"],
    )?;

    let requests_tracked = Counter::new(
        "queued_tracking_requests_tracked_total",
        "Total individual requests committed to the tracker",
    )?;

    let request_sets_failed = Counter::new(
        "queued_tracking_request_sets_failed_total",
        "Total request sets that reported a tracking failure",
    )?;

    let request_sets_dropped = Counter::new(
        "queued_tracking_request_sets_dropped_total",
        "Total request sets discarded after failing their retry pass",
    )?;

    let locks_lost = Counter::new(
        "queued_tracking_locks_lost_total",
        "Total times a shard lock was lost while processing",
    )?;

    let batch_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "queued_tracking_batch_duration_seconds",
            "Batch processing duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "queued_tracking_active_workers",
        "Number of workers currently processing",
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(request_sets_enqueued.clone()))?;
    registry.register(Box::new(request_sets_processed.clone()))?;
    registry.register(Box::new(requests_tracked.clone()))?;
    registry.register(Box::new(request_sets_failed.clone()))?;
    registry.register(Box::new(request_sets_dropped.clone()))?;
    registry.register(Box::new(locks_lost.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = REQUEST_SETS_ENQUEUED.set(request_sets_enqueued);
    let _ = REQUEST_SETS_PROCESSED.set(request_sets_processed);
    let _ = REQUESTS_TRACKED.set(requests_tracked);
    let _ = REQUEST_SETS_FAILED.set(request_sets_failed);
    let _ = REQUEST_SETS_DROPPED.set(request_sets_dropped);
    let _ = LOCKS_LOST.set(locks_lost);
    let _ = BATCH_DURATION.set(batch_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
