//! Pull worker: repeated fetch → dispatch → idle sessions.
//!
//! Each session acquires the worker's throttle group, runs the job's
//! discovery to completion while feeding a bounded relay, and lets
//! `concurrent_task_count` consumers process whatever arrives. The worker
//! keeps no state of its own; a restart simply fetches again.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use crate::config::WorkerSettings;
use crate::error::Result;
use crate::telemetry::metrics;
use crate::telemetry::worker::{start_task_span, start_worker_span};
use crate::throttle::Throttle;

use super::{BackgroundService, log_join_error, process_item, run_sessions};

/// Domain side of a pull worker.
#[async_trait]
pub trait PullJob: Send + Sync + 'static {
    /// Logged as the item key.
    type Item: Display + Send + 'static;

    /// Lazily produce this session's work. May do I/O of its own.
    fn discover(&self, cancel: CancellationToken) -> BoxStream<'_, anyhow::Result<Self::Item>>;

    async fn process(&self, item: Self::Item, cancel: &CancellationToken) -> anyhow::Result<()>;
}

pub struct PullWorker<J: PullJob> {
    name: String,
    settings: WorkerSettings,
    job: Arc<J>,
    throttle: Arc<Throttle>,
}

/// How a session's discovery phase ended.
#[derive(Debug)]
enum Discovery {
    Completed(usize),
    Cancelled,
    Failed(anyhow::Error),
}

type Relay<T> = Arc<Mutex<mpsc::Receiver<T>>>;

impl<J: PullJob> PullWorker<J> {
    pub fn new(
        name: impl Into<String>,
        settings: WorkerSettings,
        job: J,
        throttle: Arc<Throttle>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            job: Arc::new(job),
            throttle,
        }
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// One fetch → dispatch cycle. Returns once discovery has ended and
    /// every consumer has drained the relay.
    async fn session(&self, cancel: &CancellationToken) -> Result<()> {
        let concurrency = self.settings.concurrent_task_count.max(1);
        let (sender, receiver) = mpsc::channel(concurrency);
        let relay: Relay<J::Item> = Arc::new(Mutex::new(receiver));

        let mut tasks = JoinSet::new();

        tasks.spawn(
            provide(
                self.name.clone(),
                self.settings.resource_group.clone(),
                Arc::clone(&self.job),
                Arc::clone(&self.throttle),
                sender,
                cancel.clone(),
            )
            .in_current_span(),
        );

        for index in 0..concurrency {
            tasks.spawn(
                consume(
                    self.name.clone(),
                    Arc::clone(&self.job),
                    Arc::clone(&relay),
                    cancel.clone(),
                )
                .instrument(start_task_span(index)),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log_join_error(&self.name, e);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<J: PullJob> BackgroundService for PullWorker<J> {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        run_sessions(&self.name, &self.settings, &cancel, || self.session(&cancel))
            .instrument(start_worker_span(&self.name))
            .await
    }
}

/// Producer: hold the throttle permit for the whole discovery and close the
/// relay when done, whatever the outcome.
async fn provide<J: PullJob>(
    worker: String,
    group: String,
    job: Arc<J>,
    throttle: Arc<Throttle>,
    sender: mpsc::Sender<J::Item>,
    cancel: CancellationToken,
) {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        permit = throttle.acquire(&group) => permit,
    };
    let permit = match permit {
        Ok(permit) => permit,
        Err(e) => {
            error!(error = %e, "{worker} could not acquire resource group {group}");
            return;
        }
    };

    let started = Instant::now();
    let discovery = discover_into(&*job, &sender, &cancel).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    drop(sender);
    permit.release();

    let labels = [KeyValue::new("worker", worker.clone())];
    metrics::fetch_duration_ms().record(elapsed_ms as f64, &labels);

    match discovery {
        Discovery::Completed(count) => {
            metrics::items_discovered().add(count as u64, &labels);
            info!(
                elapsed_ms,
                count, "{worker} fetched work items in {elapsed_ms} ms. Count: {count}"
            );
        }
        Discovery::Cancelled => debug!(elapsed_ms, "{worker} fetch stopped"),
        Discovery::Failed(e) => error!(
            elapsed_ms,
            error = %format!("{e:#}"),
            "{worker} failed fetching work items in {elapsed_ms} ms"
        ),
    }
}

async fn discover_into<J: PullJob>(
    job: &J,
    sender: &mpsc::Sender<J::Item>,
    cancel: &CancellationToken,
) -> Discovery {
    let mut items = job.discover(cancel.clone());
    let mut count = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Discovery::Cancelled,
            next = items.next() => next,
        };

        let item = match next {
            None => return Discovery::Completed(count),
            Some(Ok(item)) => item,
            Some(Err(_)) if cancel.is_cancelled() => return Discovery::Cancelled,
            Some(Err(e)) => return Discovery::Failed(e),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Discovery::Cancelled,
            sent = sender.send(item) => {
                // Every consumer is gone; nobody left to hand work to.
                if sent.is_err() {
                    return Discovery::Cancelled;
                }
            }
        }
        count += 1;
    }
}

/// Consumer: take items off the relay until it is closed and empty. A
/// failing item is logged and skipped.
async fn consume<J: PullJob>(
    worker: String,
    job: Arc<J>,
    relay: Relay<J::Item>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = async { relay.lock().await.recv().await } => next,
        };
        let Some(item) = next else {
            return;
        };

        let key = item.to_string();
        process_item(&worker, &key, &cancel, job.process(item, &cancel)).await;
    }
}
