//! Stateful queue: an in-memory queue fronting a persisted state store.
//!
//! Incoming work is deduplicated against the stored record for its key, and
//! consumers always see the stored record rather than the copy that was
//! queued. Everything flagged in-processing in the store can be replayed
//! into the in-memory queue after a restart.
//!
//! Read-check-write sections for a key (`enqueue`, `mark_started`,
//! `mark_finished`) are serialized by an in-process key lock. Producers in
//! other processes still race through the store's last-write-wins upsert.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use opentelemetry::KeyValue;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{EnqueueResult, FinishResult, ItemState, WorkItem};
use crate::store::StateStore;
use crate::telemetry::metrics;

pub struct StatefulQueue<T: WorkItem> {
    name: String,
    store: Arc<dyn StateStore<T>>,
    sender: mpsc::UnboundedSender<T>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    locks: Arc<KeyLocks<T::Key>>,
}

impl<T: WorkItem> StatefulQueue<T> {
    pub fn new(name: impl Into<String>, store: Arc<dyn StateStore<T>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            store,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            locks: Arc::new(KeyLocks::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn StateStore<T>> {
        &self.store
    }

    /// Offer an item. Unchanged values are dropped; changed values are
    /// persisted in-processing and pushed unless an earlier occurrence of the
    /// key is still in flight.
    pub async fn enqueue(&self, item: T) -> Result<EnqueueResult> {
        let key = item.key();
        let _guard = KeyLocks::lock(&self.locks, &key).await;

        let result = match self.store.load_by_key(&key).await? {
            None => {
                self.store.persist(&ItemState::pending(item.clone())).await?;
                self.push(item)?;
                EnqueueResult::Queued
            }
            Some(existing) if existing.item.equals_by_value(&item) => EnqueueResult::Unchanged,
            Some(existing) => {
                self.store.persist(&ItemState::pending(item.clone())).await?;
                if existing.in_processing {
                    EnqueueResult::Updated
                } else {
                    self.push(item)?;
                    EnqueueResult::Queued
                }
            }
        };

        debug!(queue = %self.name, item_key = %key, %result, "enqueue");
        self.record(&result.to_string());
        Ok(result)
    }

    /// Endless stream of work for one consumer. Each popped key is re-read
    /// from the store and the stored item is yielded. Ends when `cancel`
    /// fires. A missing record yields [`Error::Consistency`].
    pub fn drain(&self, cancel: CancellationToken) -> impl Stream<Item = Result<T>> + Send + '_ {
        futures::stream::unfold(cancel, move |cancel| async move {
            let popped = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = self.pop() => item,
            }?;
            let current = self.reload(&popped.key()).await;
            Some((current, cancel))
        })
    }

    /// Push every record flagged in-processing straight onto the in-memory
    /// queue, without dedup. Run once at startup, before consumers start.
    pub async fn recover_from_storage(&self) -> Result<usize> {
        let pending = self.store.load_all_in_processing().await?;
        let count = pending.len();

        for state in pending {
            self.push(state.item)?;
        }

        metrics::queue_operations().add(
            count as u64,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", "recovered"),
            ],
        );
        info!(queue = %self.name, count, "recovered in-processing work items");
        Ok(count)
    }

    /// Write the durable "started" watermark for the stored record of
    /// `item`'s key and return that record's item, which is what should be
    /// processed.
    pub async fn mark_started(&self, item: &T) -> Result<T> {
        let key = item.key();
        let _guard = KeyLocks::lock(&self.locks, &key).await;

        let current = self
            .store
            .load_by_key(&key)
            .await?
            .ok_or_else(|| Error::Consistency {
                key: key.to_string(),
            })?;
        self.store.persist(&ItemState::started(&current.item)).await?;
        Ok(current.item)
    }

    /// Write the "finished" watermark for a processed item, unless a newer
    /// value was enqueued meanwhile. In that case the record stays
    /// in-processing and the key goes back on the queue.
    pub async fn mark_finished(&self, item: &T) -> Result<FinishResult> {
        let key = item.key();
        let _guard = KeyLocks::lock(&self.locks, &key).await;

        let current = self
            .store
            .load_by_key(&key)
            .await?
            .ok_or_else(|| Error::Consistency {
                key: key.to_string(),
            })?;

        let untouched = current.item.equals_by_value(&item.with_minimal_value())
            || current.item.equals_by_value(item);

        if untouched {
            self.store.persist(&ItemState::finished(item.clone())).await?;
            Ok(FinishResult::Finished)
        } else {
            info!(queue = %self.name, item_key = %key, "value changed while processing, requeueing");
            self.push(current.item)?;
            self.record("requeued");
            Ok(FinishResult::Requeued)
        }
    }

    fn push(&self, item: T) -> Result<()> {
        self.sender
            .send(item)
            .map_err(|_| Error::Other(format!("queue {} is closed", self.name)))
    }

    async fn pop(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    async fn reload(&self, key: &T::Key) -> Result<T> {
        match self.store.load_by_key(key).await? {
            Some(state) => Ok(state.item),
            None => {
                warn!(queue = %self.name, item_key = %key, "queued work item has no stored state");
                Err(Error::Consistency {
                    key: key.to_string(),
                })
            }
        }
    }

    fn record(&self, operation: &str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation.to_string()),
            ],
        );
    }
}

// ---------------------------------------------------------------------------
// Key locks
// ---------------------------------------------------------------------------

/// One async mutex per key that currently has a holder or waiter.
struct KeyLocks<K> {
    entries: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Clone + Eq + Hash> KeyLocks<K> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(locks: &Arc<Self>, key: &K) -> KeyGuard<K> {
        let entry = {
            let mut entries = locks.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key.clone()).or_default())
        };
        let guard = entry.lock_owned().await;
        KeyGuard {
            locks: Arc::clone(locks),
            key: key.clone(),
            _guard: guard,
        }
    }
}

struct KeyGuard<K: Clone + Eq + Hash> {
    locks: Arc<KeyLocks<K>>,
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K: Clone + Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        let mut entries = self
            .locks
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Map and this guard are the only holders: nobody is waiting.
        if entries
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) <= 2)
        {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_count(locks: &KeyLocks<String>) -> usize {
        locks
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[tokio::test]
    async fn key_lock_entry_is_removed_after_last_holder() {
        let locks = Arc::new(KeyLocks::new());
        let key = "A".to_string();

        let guard = KeyLocks::lock(&locks, &key).await;
        assert_eq!(entry_count(&locks), 1);
        drop(guard);
        assert_eq!(entry_count(&locks), 0);
    }

    #[tokio::test]
    async fn key_lock_entry_survives_while_someone_waits() {
        let locks = Arc::new(KeyLocks::new());
        let key = "A".to_string();

        let first = KeyLocks::lock(&locks, &key).await;
        let waiter = tokio::spawn({
            let locks = Arc::clone(&locks);
            let key = key.clone();
            async move {
                let _second = KeyLocks::lock(&locks, &key).await;
            }
        });
        // Let the waiter register on the entry.
        while entry_refs(&locks, &key) < 3 {
            tokio::task::yield_now().await;
        }

        drop(first);
        assert_eq!(entry_count(&locks), 1);
        waiter.await.unwrap();
        assert_eq!(entry_count(&locks), 0);
    }

    fn entry_refs(locks: &KeyLocks<String>, key: &String) -> usize {
        locks
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Arc::strong_count)
    }
}
