//! Stateful queue: dedup, drain, recovery, and watermarks against an
//! in-memory store.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use workers::{
    EnqueueResult, Error, FinishResult, ItemState, MemoryStateStore, StateStore, StatefulQueue,
    WorkItem,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Doc {
    id: String,
    version: i64,
}

fn doc(id: &str, version: i64) -> Doc {
    Doc {
        id: id.to_string(),
        version,
    }
}

impl fmt::Display for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

impl WorkItem for Doc {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn equals_by_value(&self, other: &Self) -> bool {
        self.version == other.version
    }

    fn with_minimal_value(&self) -> Self {
        doc(&self.id, i64::MIN)
    }
}

/// Wraps the memory store and counts writes.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStateStore<Doc>,
    persists: AtomicUsize,
}

#[async_trait]
impl StateStore<Doc> for CountingStore {
    async fn persist(&self, state: &ItemState<Doc>) -> workers::Result<()> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(state).await
    }

    async fn load_by_key(&self, key: &String) -> workers::Result<Option<ItemState<Doc>>> {
        self.inner.load_by_key(key).await
    }

    async fn load_all_in_processing(&self) -> workers::Result<Vec<ItemState<Doc>>> {
        self.inner.load_all_in_processing().await
    }
}

/// Store that forgets everything it is told.
struct ForgetfulStore;

#[async_trait]
impl StateStore<Doc> for ForgetfulStore {
    async fn persist(&self, _state: &ItemState<Doc>) -> workers::Result<()> {
        Ok(())
    }

    async fn load_by_key(&self, _key: &String) -> workers::Result<Option<ItemState<Doc>>> {
        Ok(None)
    }

    async fn load_all_in_processing(&self) -> workers::Result<Vec<ItemState<Doc>>> {
        Ok(Vec::new())
    }
}

fn queue_over(store: Arc<dyn StateStore<Doc>>) -> StatefulQueue<Doc> {
    StatefulQueue::new("docs", store)
}

/// Pop `n` items from a fresh drain, failing the test if they don't arrive.
async fn take(queue: &StatefulQueue<Doc>, n: usize) -> Vec<Doc> {
    let cancel = CancellationToken::new();
    let stream = queue.drain(cancel.clone()).take(n);
    let items: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
        .await
        .expect("drain timed out");
    cancel.cancel();
    items.into_iter().map(|r| r.unwrap()).collect()
}

/// Whether the drain yields nothing within a short window.
async fn drain_is_empty(queue: &StatefulQueue<Doc>) -> bool {
    let cancel = CancellationToken::new();
    let mut stream = std::pin::pin!(queue.drain(cancel.clone()));
    let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    cancel.cancel();
    next.is_err()
}

#[tokio::test]
async fn enqueue_new_item_persists_and_queues() {
    let store = Arc::new(MemoryStateStore::<Doc>::new());
    let queue = queue_over(store.clone());

    assert_eq!(
        queue.enqueue(doc("A", 5)).await.unwrap(),
        EnqueueResult::Queued
    );

    let stored = store.load_by_key(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(stored, ItemState::pending(doc("A", 5)));
    assert_eq!(take(&queue, 1).await, vec![doc("A", 5)]);
}

#[tokio::test]
async fn enqueue_same_value_twice_is_idempotent() {
    let store = Arc::new(CountingStore::default());
    let queue = queue_over(store.clone());

    queue.enqueue(doc("A", 5)).await.unwrap();
    let second = queue.enqueue(doc("A", 5)).await.unwrap();

    assert_eq!(second, EnqueueResult::Unchanged);
    assert_eq!(store.persists.load(Ordering::SeqCst), 1);
    assert_eq!(take(&queue, 1).await.len(), 1);
    assert!(drain_is_empty(&queue).await);
}

#[tokio::test]
async fn changed_value_while_in_flight_updates_without_second_push() {
    let store = Arc::new(MemoryStateStore::<Doc>::new());
    let queue = queue_over(store.clone());

    queue.enqueue(doc("A", 5)).await.unwrap();
    queue.enqueue(doc("A", 5)).await.unwrap();
    let third = queue.enqueue(doc("A", 9)).await.unwrap();

    assert_eq!(third, EnqueueResult::Updated);
    let stored = store.load_by_key(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(stored, ItemState::pending(doc("A", 9)));

    // One push only, but the consumer sees the latest stored value.
    assert_eq!(take(&queue, 1).await, vec![doc("A", 9)]);
    assert!(drain_is_empty(&queue).await);
}

#[tokio::test]
async fn changed_value_after_finish_is_queued_again() {
    let store = Arc::new(MemoryStateStore::with_records([ItemState::finished(doc(
        "A", 5,
    ))]));
    let queue = queue_over(store.clone());

    assert_eq!(
        queue.enqueue(doc("A", 5)).await.unwrap(),
        EnqueueResult::Unchanged
    );
    assert_eq!(
        queue.enqueue(doc("A", 6)).await.unwrap(),
        EnqueueResult::Queued
    );
    assert_eq!(take(&queue, 1).await, vec![doc("A", 6)]);
}

#[tokio::test]
async fn recovery_replays_in_processing_records_before_new_work() {
    let store = Arc::new(MemoryStateStore::with_records([
        ItemState::pending(doc("A", 1)),
        ItemState::pending(doc("B", 2)),
        ItemState::finished(doc("C", 3)),
    ]));
    let queue = queue_over(store.clone());

    let recovered = queue.recover_from_storage().await.unwrap();
    assert_eq!(recovered, 2);

    queue.enqueue(doc("D", 4)).await.unwrap();

    let items = take(&queue, 3).await;
    let mut replayed: Vec<_> = items[..2].iter().map(|d| d.id.clone()).collect();
    replayed.sort();
    assert_eq!(replayed, vec!["A", "B"]);
    assert_eq!(items[2], doc("D", 4));
}

#[tokio::test]
async fn recovery_does_not_dedup() {
    let store = Arc::new(MemoryStateStore::with_records([ItemState::pending(doc(
        "A", 1,
    ))]));
    let queue = queue_over(store);

    queue.recover_from_storage().await.unwrap();
    queue.recover_from_storage().await.unwrap();

    assert_eq!(take(&queue, 2).await, vec![doc("A", 1), doc("A", 1)]);
}

#[tokio::test]
async fn drain_ends_when_cancelled() {
    let queue = queue_over(Arc::new(MemoryStateStore::<Doc>::new()));
    let cancel = CancellationToken::new();
    let mut stream = std::pin::pin!(queue.drain(cancel.clone()));

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn drain_without_stored_record_is_a_consistency_violation() {
    let queue = queue_over(Arc::new(ForgetfulStore));
    queue.enqueue(doc("A", 1)).await.unwrap();

    let cancel = CancellationToken::new();
    let mut stream = std::pin::pin!(queue.drain(cancel.clone()));
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(next, Err(Error::Consistency { ref key }) if key == "A"));
}

#[tokio::test]
async fn mark_started_writes_minimal_value_watermark() {
    let store = Arc::new(MemoryStateStore::<Doc>::new());
    let queue = queue_over(store.clone());
    queue.enqueue(doc("A", 7)).await.unwrap();

    let current = queue.mark_started(&doc("A", 7)).await.unwrap();
    assert_eq!(current, doc("A", 7));

    let stored = store.load_by_key(&"A".to_string()).await.unwrap().unwrap();
    assert!(stored.in_processing);
    assert_eq!(stored.item.version, i64::MIN);

    // A rescan with the real value is not mistaken for finished work.
    assert_eq!(
        queue.enqueue(doc("A", 7)).await.unwrap(),
        EnqueueResult::Updated
    );
}

#[tokio::test]
async fn mark_finished_clears_in_processing() {
    let store = Arc::new(MemoryStateStore::<Doc>::new());
    let queue = queue_over(store.clone());
    queue.enqueue(doc("A", 7)).await.unwrap();
    let item = queue.mark_started(&doc("A", 7)).await.unwrap();

    assert_eq!(
        queue.mark_finished(&item).await.unwrap(),
        FinishResult::Finished
    );

    let stored = store.load_by_key(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(stored, ItemState::finished(doc("A", 7)));
    assert_eq!(
        queue.enqueue(doc("A", 7)).await.unwrap(),
        EnqueueResult::Unchanged
    );
}

#[tokio::test]
async fn value_changed_during_processing_is_requeued() {
    let store = Arc::new(MemoryStateStore::<Doc>::new());
    let queue = queue_over(store.clone());
    queue.enqueue(doc("A", 1)).await.unwrap();
    assert_eq!(take(&queue, 1).await, vec![doc("A", 1)]);

    let item = queue.mark_started(&doc("A", 1)).await.unwrap();
    queue.enqueue(doc("A", 2)).await.unwrap();

    assert_eq!(
        queue.mark_finished(&item).await.unwrap(),
        FinishResult::Requeued
    );
    let stored = store.load_by_key(&"A".to_string()).await.unwrap().unwrap();
    assert_eq!(stored, ItemState::pending(doc("A", 2)));
    assert_eq!(take(&queue, 1).await, vec![doc("A", 2)]);
}

#[tokio::test]
async fn watermarks_without_stored_record_fail() {
    let queue = queue_over(Arc::new(MemoryStateStore::<Doc>::new()));

    assert!(matches!(
        queue.mark_started(&doc("X", 1)).await,
        Err(Error::Consistency { .. })
    ));
    assert!(matches!(
        queue.mark_finished(&doc("X", 1)).await,
        Err(Error::Consistency { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_of_one_value_push_once() {
    let store = Arc::new(CountingStore::default());
    let queue = Arc::new(queue_over(store.clone()));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let queue = Arc::clone(&queue);
        tasks.spawn(async move { queue.enqueue(doc("A", 3)).await.unwrap() });
    }
    let mut queued = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap() == EnqueueResult::Queued {
            queued += 1;
        }
    }

    assert_eq!(queued, 1);
    assert_eq!(store.persists.load(Ordering::SeqCst), 1);
    assert_eq!(take(&queue, 1).await.len(), 1);
    assert!(drain_is_empty(&queue).await);
}
