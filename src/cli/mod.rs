//! Command-line interface for queued-tracking.
//!
//! Provides commands for processing the queue, running a worker pool,
//! inspecting shards and locks, and checking the backend.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
