//! Integration tests for telemetry initialization and span helpers.

use buildq::model::JobId;
use buildq::telemetry::{TelemetryConfig, init_telemetry, job, metrics};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so this may
    // return Err when another test got there first.
    let _guard = init_telemetry(TelemetryConfig {
        service_name: "buildq-test".to_string(),
        ..Default::default()
    });
}

#[test]
fn job_span_creates_and_records_transition() {
    let span = job::start_job_span("builds", JobId::new(), 1);
    job::record_state_transition(&span, "pending", "active");
    job::record_state_transition(&span, "active", "completed");
}

#[test]
fn instruments_accept_documented_labels() {
    metrics::builds_submitted().add(
        1,
        &[KeyValue::new("mode", "docker"), KeyValue::new("result", "queued")],
    );
    metrics::queue_operations().add(
        1,
        &[KeyValue::new("queue", "builds"), KeyValue::new("operation", "enqueue")],
    );
    metrics::phase_duration_ms().record(
        12.5,
        &[KeyValue::new("phase", "install"), KeyValue::new("result", "ok")],
    );
    metrics::webhook_deliveries().add(1, &[KeyValue::new("result", "success")]);
    metrics::progress_events_published().add(1, &[KeyValue::new("event", "progress")]);
}
