//! Core data model.
//!
//! A work item is something that needs doing again whenever its value
//! changes. It has identity (a domain key the framework never interprets)
//! and a comparison value. The in-processing flag lives beside the item in
//! [`ItemState`], which is what gets persisted.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// Contract every item flowing through a [`StatefulQueue`] implements.
///
/// [`StatefulQueue`]: crate::queue::StatefulQueue
pub trait WorkItem: Clone + Debug + Send + Sync + 'static {
    /// Identity. Two items with the same key describe the same logical work.
    type Key: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// True if the comparison-relevant fields match `other`.
    ///
    /// Must be reflexive and symmetric for items sharing a key.
    fn equals_by_value(&self, other: &Self) -> bool;

    /// Copy with the comparison fields reset to a "not yet known" sentinel.
    ///
    /// The result must never compare equal to a real completed value, so a
    /// crash between the started and finished watermarks stays visible.
    fn with_minimal_value(&self) -> Self;
}

// ---------------------------------------------------------------------------
// Item State
// ---------------------------------------------------------------------------

/// A work item as the state store sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState<T> {
    pub item: T,
    /// Set on enqueue, cleared once processing finishes. Survives restarts.
    pub in_processing: bool,
}

impl<T: WorkItem> ItemState<T> {
    /// State for an item that has been accepted but not yet finished.
    pub fn pending(item: T) -> Self {
        Self {
            item,
            in_processing: true,
        }
    }

    /// State for an item whose processing completed.
    pub fn finished(item: T) -> Self {
        Self {
            item,
            in_processing: false,
        }
    }

    /// The durable "started" watermark for this item.
    pub fn started(item: &T) -> Self {
        Self::pending(item.with_minimal_value())
    }

    pub fn key(&self) -> T::Key {
        self.item.key()
    }
}

// ---------------------------------------------------------------------------
// Enqueue outcome
// ---------------------------------------------------------------------------

/// What happened when an item was offered to a stateful queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Persisted in-processing and pushed for a consumer.
    Queued,
    /// Value changed while an earlier occurrence is still in flight. The
    /// record was updated; the in-flight consumer picks up the new value.
    Updated,
    /// Same value as the stored record. Nothing written, nothing pushed.
    Unchanged,
}

impl std::fmt::Display for EnqueueResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnqueueResult::Queued => "enqueued",
            EnqueueResult::Updated => "updated",
            EnqueueResult::Unchanged => "unchanged",
        };
        write!(f, "{s}")
    }
}

/// What happened when a consumer reported an item as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishResult {
    /// Finished watermark written.
    Finished,
    /// A newer value arrived while processing; the key was pushed back.
    Requeued,
}
