//! queued-tracking: sharded tracking-request queue with lock-guarded batch processing.
//!
//! Request sets are appended to one of up to 16 FIFO queues chosen by a
//! stable hash of the visitor identity. Workers lock a shard, replay its
//! oldest batch through a [`tracker::Tracker`] inside one transaction and
//! trim the batch only after the commit succeeded. Queue contents and locks
//! live in a pluggable [`backend::Backend`] (Redis, Redis Cluster, Sentinel,
//! SQLite or in-memory).

// Core modules
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod request_set;
pub mod service;
pub mod status;
pub mod tracker;
pub mod worker;

// Re-export commonly used types
pub use backend::Backend;
pub use config::{BackendKind, Settings};
pub use error::{BackendError, ConfigError, QueueError, TrackerError};
pub use manager::Manager;
pub use processor::{ProcessStats, Processor};
pub use queue::Queue;
pub use request_set::{RequestSet, TrackingRequest};
pub use service::QueuedTracking;
pub use worker::{Worker, WorkerPool, WorkerPoolConfig, WorkerReport};
