//! Worker host: schedules background services and shuts them down.
//!
//! Disabled workers are dropped at registration and never spawned. On
//! start, every service runs its `initialize` hook in registration order;
//! only then is each `run` loop spawned as its own task. Stopping cancels
//! the shared token and waits up to the shutdown timeout for every task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::worker::BackgroundService;

pub struct WorkerHost {
    services: Vec<Arc<dyn BackgroundService>>,
    running: Vec<(String, JoinHandle<Result<()>>)>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerHost {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            services: Vec::new(),
            running: Vec::new(),
            cancel: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Add a service. Returns false if its settings disable it.
    pub fn register(&mut self, service: impl BackgroundService) -> bool {
        self.register_shared(Arc::new(service))
    }

    pub fn register_shared(&mut self, service: Arc<dyn BackgroundService>) -> bool {
        if !service.settings().enabled {
            info!(worker = service.name(), "worker disabled, not scheduling");
            return false;
        }
        self.services.push(service);
        true
    }

    /// Names of the services that will be (or are) scheduled.
    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Token cancelled by [`stop`](Self::stop). Services receive child tokens.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Initialize every service, then spawn every run loop.
    ///
    /// No run loop starts before every `initialize` hook has returned; a
    /// queue's recovery pass must not see keys that producers just enqueued.
    /// An `initialize` failure aborts the start with nothing spawned.
    pub async fn start(&mut self) -> Result<()> {
        for service in &self.services {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            service.initialize(&self.cancel).await?;
        }

        for service in &self.services {
            let name = service.name().to_string();
            let task = Arc::clone(service);
            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(async move { task.run(cancel).await });
            self.running.push((name, handle));
        }

        info!(workers = self.running.len(), "worker host started");
        Ok(())
    }

    /// Cancel every service and wait for it. Returns true if all of them
    /// ended cleanly within the shutdown timeout.
    pub async fn stop(&mut self) -> bool {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut clean = true;

        for (name, mut handle) in self.running.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    error!(worker = %name, error = %e, "worker terminated with an error");
                    clean = false;
                }
                Ok(Err(e)) => {
                    error!(worker = %name, error = %e, "worker task panicked");
                    clean = false;
                }
                Err(_) => {
                    warn!(worker = %name, "worker did not stop within the shutdown timeout, aborting");
                    handle.abort();
                    clean = false;
                }
            }
        }

        info!(clean, "worker host stopped");
        clean
    }

    /// Start, wait for `shutdown`, stop. Returns a process exit code: 0 when
    /// everything started and stopped cleanly, 1 otherwise.
    pub async fn run_until<F>(mut self, shutdown: F) -> i32
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.start().await {
            error!(error = %e, "worker host failed to start");
            self.stop().await;
            return 1;
        }

        tokio::select! {
            _ = shutdown => info!("shutdown requested"),
            _ = self.cancel.cancelled() => {}
        }

        if self.stop().await { 0 } else { 1 }
    }
}
