//! Background workers.
//!
//! Two kinds share one lifecycle ([`BackgroundService`]) and one outer loop
//! (session → log outcome → idle → session …):
//!
//! - [`PullWorker`] discovers a batch of work every session and fans it out
//!   to concurrent consumers through a bounded relay.
//! - [`ResumableWorker`] drains a long-lived [`StatefulQueue`] forever and
//!   writes started/finished watermarks around every item.
//!
//! Cancellation is a [`CancellationToken`] threaded through every suspension
//! point. A cancelled worker unwinds quietly; only real failures are logged
//! as errors.
//!
//! [`StatefulQueue`]: crate::queue::StatefulQueue

pub mod pull;
pub mod resumable;

pub use pull::{PullJob, PullWorker};
pub use resumable::{ResumableJob, ResumableWorker};

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::worker::{record_outcome, start_item_span, start_session_span};

/// Lifecycle every worker exposes to the host.
#[async_trait]
pub trait BackgroundService: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn settings(&self) -> &WorkerSettings;

    /// Runs once before [`run`](Self::run).
    async fn initialize(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Runs until `cancel` fires. Returns an error only for failures that
    /// must stop the worker.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// How one call to a job's `process` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Processed,
    Failed,
    Cancelled,
}

impl ItemOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ItemOutcome::Processed => "ok",
            ItemOutcome::Failed => "error",
            ItemOutcome::Cancelled => "cancelled",
        }
    }
}

/// Await one `process` call inside an item span and log how it went.
///
/// An error returned after `cancel` fired counts as cancellation, not failure.
pub(crate) async fn process_item<F>(
    worker: &str,
    item_key: &str,
    cancel: &CancellationToken,
    process: F,
) -> ItemOutcome
where
    F: Future<Output = anyhow::Result<()>>,
{
    let span = start_item_span(item_key);
    let started = Instant::now();
    let result = process.instrument(span.clone()).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let outcome = span.in_scope(|| match result {
        Ok(()) => {
            info!("{worker} processed {item_key} in {elapsed_ms} ms");
            ItemOutcome::Processed
        }
        Err(_) if cancel.is_cancelled() => {
            debug!("{worker} stopped while processing {item_key}");
            ItemOutcome::Cancelled
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "{worker} failed {item_key} in {elapsed_ms} ms");
            ItemOutcome::Failed
        }
    });
    record_outcome(&span, outcome.as_str(), elapsed_ms);

    let labels = [
        KeyValue::new("worker", worker.to_string()),
        KeyValue::new("result", outcome.as_str()),
    ];
    metrics::items_processed().add(1, &labels);
    metrics::process_duration_ms().record(elapsed_ms as f64, &labels[..1]);

    outcome
}

/// The outer forever-loop shared by both worker kinds.
///
/// Each iteration gets a fresh session id. A failed session is logged as
/// critical and the loop carries on after the idle delay, except for
/// [`Error::Consistency`], which ends the worker.
pub(crate) async fn run_sessions<F, Fut>(
    worker: &str,
    settings: &WorkerSettings,
    cancel: &CancellationToken,
    mut session: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while !cancel.is_cancelled() {
        let session_id = Uuid::new_v4();
        let span = start_session_span(&session_id, settings.concurrent_task_count);
        metrics::sessions().add(1, &[KeyValue::new("worker", worker.to_string())]);

        let result = async {
            info!(
                "{worker} running. Concurrent task count: {}",
                settings.concurrent_task_count
            );
            session().await
        }
        .instrument(span.clone())
        .await;

        span.in_scope(|| match result {
            Ok(()) if cancel.is_cancelled() => {
                info!("{worker} stopped");
                Ok(())
            }
            Ok(()) => {
                info!("{worker} finished");
                Ok(())
            }
            Err(e @ Error::Consistency { .. }) => {
                error!(error = %e, "{worker} hit a state store consistency violation, stopping");
                Err(e)
            }
            Err(e) => {
                error!(critical = true, error = %e, "{worker} failed");
                Ok(())
            }
        })?;

        idle(settings, cancel).await;
    }

    Ok(())
}

/// Sleep the idle interval, waking early on cancellation.
async fn idle(settings: &WorkerSettings, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(settings.idle_time()) => {}
    }
}

/// Log a task that died instead of returning.
pub(crate) fn log_join_error(worker: &str, error: JoinError) {
    if error.is_cancelled() {
        debug!("{worker} task aborted");
    } else {
        error!(critical = true, error = %error, "{worker} task panicked");
    }
}
