//! Resumable worker: drains a stateful queue for its whole lifetime.
//!
//! Around every item the worker writes two durable watermarks through the
//! queue: "started" (comparison fields reset to the minimal value) before
//! `process`, and "finished" (in-processing cleared) after it succeeds. A
//! failed or interrupted item keeps its in-processing flag and is replayed
//! by [`StatefulQueue::recover_from_storage`] on the next start.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::model::{FinishResult, WorkItem};
use crate::queue::StatefulQueue;
use crate::telemetry::worker::{start_task_span, start_worker_span};

use super::{BackgroundService, ItemOutcome, log_join_error, process_item, run_sessions};

/// Domain side of a resumable worker.
#[async_trait]
pub trait ResumableJob: Send + Sync + 'static {
    type Item: WorkItem;

    async fn process(&self, item: Self::Item, cancel: &CancellationToken) -> anyhow::Result<()>;
}

pub struct ResumableWorker<J: ResumableJob> {
    name: String,
    settings: WorkerSettings,
    job: Arc<J>,
    queue: Arc<StatefulQueue<J::Item>>,
}

impl<J: ResumableJob> ResumableWorker<J> {
    pub fn new(
        name: impl Into<String>,
        settings: WorkerSettings,
        job: J,
        queue: Arc<StatefulQueue<J::Item>>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            job: Arc::new(job),
            queue,
        }
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    pub fn queue(&self) -> &Arc<StatefulQueue<J::Item>> {
        &self.queue
    }

    fn spawn_consumer(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        consumers: &CancellationToken,
        index: usize,
    ) {
        tasks.spawn(
            consume(
                self.name.clone(),
                Arc::clone(&self.job),
                Arc::clone(&self.queue),
                consumers.clone(),
            )
            .instrument(start_task_span(index)),
        );
    }

    /// Run the consumers until cancelled. A consistency violation in any
    /// consumer stops the others and is returned. A consumer that panicked
    /// is replaced; its item keeps the started watermark.
    async fn session(&self, cancel: &CancellationToken) -> Result<()> {
        let consumers = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut spawned = 0;

        while spawned < self.settings.concurrent_task_count.max(1) {
            self.spawn_consumer(&mut tasks, &consumers, spawned);
            spawned += 1;
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    consumers.cancel();
                    fatal.get_or_insert(e);
                }
                Err(e) if e.is_panic() && !consumers.is_cancelled() => {
                    log_join_error(&self.name, e);
                    warn!("{} replacing a consumer that panicked", self.name);
                    self.spawn_consumer(&mut tasks, &consumers, spawned);
                    spawned += 1;
                }
                Err(e) => log_join_error(&self.name, e),
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<J: ResumableJob> BackgroundService for ResumableWorker<J> {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Re-queue everything a previous run left in-processing.
    async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        let span = start_worker_span(&self.name);
        async {
            info!("{} initializing", self.name);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(()),
                recovered = self.queue.recover_from_storage() => recovered.map(|_| ()),
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        run_sessions(&self.name, &self.settings, &cancel, || self.session(&cancel))
            .instrument(start_worker_span(&self.name))
            .await
    }
}

/// One consumer. Returns `Err` only for a consistency violation.
async fn consume<J: ResumableJob>(
    worker: String,
    job: Arc<J>,
    queue: Arc<StatefulQueue<J::Item>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut items = std::pin::pin!(queue.drain(cancel.clone()));

    while let Some(next) = items.next().await {
        let item = match next {
            Ok(item) => item,
            Err(e @ Error::Consistency { .. }) => return Err(e),
            Err(e) => {
                error!(error = %e, "{worker} could not read queued work item");
                continue;
            }
        };
        let key = item.key().to_string();

        let item = match queue.mark_started(&item).await {
            Ok(current) => current,
            Err(e @ Error::Consistency { .. }) => return Err(e),
            Err(e) => {
                error!(item_key = %key, error = %e, "{worker} could not record start of {key}");
                continue;
            }
        };

        let outcome =
            process_item(&worker, &key, &cancel, job.process(item.clone(), &cancel)).await;
        if outcome != ItemOutcome::Processed {
            // Still flagged in-processing; the next recovery pass picks it up.
            continue;
        }

        match queue.mark_finished(&item).await {
            Ok(FinishResult::Finished) => {}
            Ok(FinishResult::Requeued) => debug!(item_key = %key, "{worker} requeued {key}"),
            Err(e @ Error::Consistency { .. }) => return Err(e),
            Err(e) => {
                error!(item_key = %key, error = %e, "{worker} could not record completion of {key}")
            }
        }
    }

    Ok(())
}
