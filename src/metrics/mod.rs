//! Prometheus-based monitoring of queue depth and processing throughput.
//!
//! # Example
//!
//! ```ignore
//! use queued_tracking::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_batch(0, 25, 40, 0.8);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BATCH_DURATION, LOCKS_LOST, QUEUE_DEPTH, REGISTRY, REQUESTS_TRACKED,
    REQUEST_SETS_DROPPED, REQUEST_SETS_ENQUEUED, REQUEST_SETS_FAILED, REQUEST_SETS_PROCESSED,
};
