//! State store contract consumed by the stateful queue.
//!
//! A store persists one [`ItemState`] per key with last-write-wins upserts.
//! No multi-key transactions are assumed.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ItemState, WorkItem};

#[async_trait]
pub trait StateStore<T: WorkItem>: Send + Sync + 'static {
    /// Upsert by key.
    async fn persist(&self, state: &ItemState<T>) -> Result<()>;

    async fn load_by_key(&self, key: &T::Key) -> Result<Option<ItemState<T>>>;

    /// Every record currently flagged in-processing.
    async fn load_all_in_processing(&self) -> Result<Vec<ItemState<T>>>;
}

/// In-process store. State is lost with the process, so recovery only
/// replays what was written earlier in the same run.
#[derive(Debug)]
pub struct MemoryStateStore<T: WorkItem> {
    records: Mutex<HashMap<T::Key, ItemState<T>>>,
}

impl<T: WorkItem> MemoryStateStore<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a store with existing records, as if left behind by a previous run.
    pub fn with_records(records: impl IntoIterator<Item = ItemState<T>>) -> Self {
        let records = records
            .into_iter()
            .map(|state| (state.key(), state))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: WorkItem> Default for MemoryStateStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: WorkItem> StateStore<T> for MemoryStateStore<T> {
    async fn persist(&self, state: &ItemState<T>) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.key(), state.clone());
        Ok(())
    }

    async fn load_by_key(&self, key: &T::Key) -> Result<Option<ItemState<T>>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn load_all_in_processing(&self) -> Result<Vec<ItemState<T>>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|state| state.in_processing)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        name: &'static str,
        value: u32,
    }

    impl WorkItem for Counter {
        type Key = &'static str;

        fn key(&self) -> &'static str {
            self.name
        }

        fn equals_by_value(&self, other: &Self) -> bool {
            self.value == other.value
        }

        fn with_minimal_value(&self) -> Self {
            Self {
                name: self.name,
                value: u32::MAX,
            }
        }
    }

    #[tokio::test]
    async fn persist_overwrites_by_key() {
        let store = MemoryStateStore::<Counter>::new();
        let first = Counter { name: "a", value: 1 };
        let second = Counter { name: "a", value: 2 };

        store.persist(&ItemState::pending(first)).await.unwrap();
        store.persist(&ItemState::finished(second.clone())).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load_by_key(&"a").await.unwrap(),
            Some(ItemState::finished(second))
        );
    }

    #[tokio::test]
    async fn in_processing_filter() {
        let store = MemoryStateStore::with_records([
            ItemState::pending(Counter { name: "a", value: 1 }),
            ItemState::finished(Counter { name: "b", value: 1 }),
            ItemState::started(&Counter { name: "c", value: 7 }),
        ]);

        let mut pending: Vec<_> = store
            .load_all_in_processing()
            .await
            .unwrap()
            .into_iter()
            .map(|state| state.key())
            .collect();
        pending.sort_unstable();

        assert_eq!(pending, vec!["a", "c"]);
        assert!(store.load_by_key(&"z").await.unwrap().is_none());
    }
}
