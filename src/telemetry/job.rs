//! Build job span helpers.
//!
//! Provides span creation and state-transition recording for jobs
//! flowing through the worker pool.

use crate::model::JobId;
use tracing::Span;

/// Start a span for one attempt of a queued job.
///
/// The `job.phase` field is declared empty and filled in as the
/// attempt moves through its phases.
pub fn start_job_span(queue: &str, job_id: JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.queue" = queue,
        "job.id" = %job_id,
        "job.attempt" = attempt,
        "job.phase" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
