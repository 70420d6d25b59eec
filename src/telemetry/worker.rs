//! Worker span helpers.
//!
//! A worker span wraps the whole lifetime of a background service, a session
//! span wraps one fetch→dispatch cycle, and an item span wraps one call to
//! `process`. Log lines inside inherit the fields, which is how every event
//! carries the worker name and item key.

use tracing::Span;
use uuid::Uuid;

pub fn start_worker_span(worker: &str) -> Span {
    tracing::info_span!("worker", worker = worker)
}

/// The `concurrent_tasks` field is declared so it shows on every line.
pub fn start_session_span(session_id: &Uuid, concurrent_tasks: usize) -> Span {
    tracing::info_span!(
        "worker.session",
        session_id = %session_id,
        concurrent_tasks,
    )
}

pub fn start_task_span(task_index: usize) -> Span {
    tracing::debug_span!("worker.task", task_index)
}

/// `outcome` and `elapsed_ms` are filled in by [`record_outcome`].
pub fn start_item_span(item_key: &str) -> Span {
    tracing::info_span!(
        "worker.item",
        item_key = item_key,
        outcome = tracing::field::Empty,
        elapsed_ms = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str, elapsed_ms: u64) {
    span.record("outcome", outcome);
    span.record("elapsed_ms", elapsed_ms);
}
