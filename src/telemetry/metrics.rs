//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter installed these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workers")
}

/// Counter: worker sessions started.
/// Labels: `worker`.
pub fn sessions() -> Counter<u64> {
    meter()
        .u64_counter("workers.sessions")
        .with_description("Number of worker sessions started")
        .build()
}

/// Counter: work items produced by discovery.
/// Labels: `worker`.
pub fn items_discovered() -> Counter<u64> {
    meter()
        .u64_counter("workers.items.discovered")
        .with_description("Number of work items discovered")
        .build()
}

/// Counter: work items handed to `process`.
/// Labels: `worker`, `result` ("ok" | "error" | "cancelled").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("workers.items.processed")
        .with_description("Number of work items processed")
        .build()
}

/// Counter: stateful queue operations.
/// Labels: `queue`, `operation` ("enqueued" | "updated" | "unchanged" |
/// "recovered" | "requeued").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workers.queue.operations")
        .with_description("Number of stateful queue operations")
        .build()
}

/// Histogram: time spent in a discovery (fetch) phase.
/// Labels: `worker`.
pub fn fetch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workers.fetch.duration_ms")
        .with_description("Discovery phase duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: time spent processing one work item.
/// Labels: `worker`.
pub fn process_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workers.process.duration_ms")
        .with_description("Work item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
