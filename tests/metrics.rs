//! Prometheus counters driven by real worker runs.

mod common;

use common::{memory_backend, memory_settings, tagged_set, ScriptedTracker};
use queued_tracking::metrics::{export_metrics, init_metrics};
use queued_tracking::{Queue, Worker};

fn counter_value(exported: &str, name: &str) -> f64 {
    exported
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix(name)?.trim().parse().ok())
        .unwrap_or(0.0)
}

#[tokio::test]
async fn test_failed_and_dropped_sets_are_counted() {
    init_metrics().expect("metrics should initialize");

    let backend = memory_backend();
    let settings = memory_settings(1, 2);
    let queue = Queue::new(backend.clone(), 0, 2);
    queue.append(&tagged_set("visitor-a", 0)).await.unwrap();
    queue.append(&tagged_set("visitor-a", 1)).await.unwrap();

    // Call 2 fails the first pass, call 3 fails the retry.
    let mut worker = Worker::new(backend, &settings, Box::new(ScriptedTracker::new([2, 3])))
        .expect("worker should build");
    let report = worker.run_once().await.expect("run should succeed");
    let stats = report.stats().expect("should have processed");
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.dropped, 1);

    let exported = export_metrics();
    assert_eq!(
        counter_value(&exported, "queued_tracking_request_sets_failed_total"),
        2.0
    );
    assert_eq!(
        counter_value(&exported, "queued_tracking_request_sets_dropped_total"),
        1.0
    );
}
