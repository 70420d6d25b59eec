//! # workers
//!
//! Background job processing for long-running hosts.
//!
//! Provides pull workers (fetch → dispatch → idle sessions with bounded
//! concurrency), stateful queues that deduplicate work against persisted
//! state and replay unfinished items after a crash, resumable workers that
//! drain those queues, and a named throttle shared across workers.

pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod throttle;
pub mod worker;

pub use error::{Error, Result};
pub use host::WorkerHost;
pub use model::{EnqueueResult, FinishResult, ItemState, WorkItem};
pub use queue::StatefulQueue;
pub use store::{MemoryStateStore, StateStore};
pub use throttle::{DEFAULT_GROUP, Throttle, ThrottlePermit};
pub use worker::{BackgroundService, PullJob, PullWorker, ResumableJob, ResumableWorker};
