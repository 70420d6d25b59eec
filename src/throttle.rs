//! Named concurrency limits shared across independently scheduled workers.
//!
//! Workers that hit the same downstream resource declare the same resource
//! group and never run their fetch phase at the same time. Groups are created
//! lazily with a single permit and live as long as the registry. The
//! [`DEFAULT_GROUP`] is unbounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Resource group used when a worker does not configure one.
pub const DEFAULT_GROUP: &str = "Default";

/// Registry of named semaphores. Construct once and share by `Arc`.
#[derive(Debug)]
pub struct Throttle {
    groups: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Throttle {
    pub fn new() -> Self {
        let mut groups = HashMap::new();
        groups.insert(
            DEFAULT_GROUP.to_string(),
            Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        );
        Self {
            groups: Mutex::new(groups),
        }
    }

    /// Wait for a permit in `group`. Dropping the permit releases it.
    pub async fn acquire(&self, group: &str) -> Result<ThrottlePermit> {
        let semaphore = self.semaphore(group);
        trace!(group, available = semaphore.available_permits(), "acquiring throttle permit");

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Other(format!("throttle group {group} closed")))?;

        debug!(group, "throttle permit acquired");
        Ok(ThrottlePermit {
            group: group.to_string(),
            _permit: permit,
        })
    }

    /// Number of permits currently free in `group`.
    pub fn available(&self, group: &str) -> usize {
        self.semaphore(group).available_permits()
    }

    /// Number of groups seen so far, including the default group.
    pub fn group_count(&self) -> usize {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn semaphore(&self, group: &str) -> Arc<Semaphore> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            groups
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of a fetch phase.
#[derive(Debug)]
pub struct ThrottlePermit {
    group: String,
    _permit: OwnedSemaphorePermit,
}

impl ThrottlePermit {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Give the permit back explicitly. Equivalent to dropping it.
    pub fn release(self) {
        debug!(group = %self.group, "throttle permit released");
    }
}
