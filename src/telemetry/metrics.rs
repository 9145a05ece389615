//! Metric instrument factories for buildq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"buildq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for buildq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("buildq")
}

/// Counter: build requests accepted or rejected.
/// Labels: `mode` ("docker" | "webcontainer"), `result` ("queued" | "invalid" | "error").
pub fn builds_submitted() -> Counter<u64> {
    meter()
        .u64_counter("buildq.builds.submitted")
        .with_description("Number of build requests submitted")
        .build()
}

/// Counter: queue-level operations (enqueue, dequeue, complete, retry, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("buildq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: queue entry state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("buildq.job.state_transitions")
        .with_description("Number of queue entry state transitions")
        .build()
}

/// Histogram: build phase duration in milliseconds.
/// Labels: `phase`, `result` ("ok" | "error").
pub fn phase_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("buildq.build.phase_duration_ms")
        .with_description("Build phase duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: webhook POST attempts.
/// Labels: `result` ("success" | "failure").
pub fn webhook_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("buildq.webhook.deliveries")
        .with_description("Number of webhook delivery attempts")
        .build()
}

/// Counter: progress events published.
/// Labels: `event` ("progress" | "log" | "completed" | "error").
pub fn progress_events_published() -> Counter<u64> {
    meter()
        .u64_counter("buildq.progress.events")
        .with_description("Number of progress events published")
        .build()
}
