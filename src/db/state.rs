//! Postgres-backed [`StateStore`].
//!
//! Items are stored as JSONB in `work_item_states`, keyed by
//! `(queue_name, item_key)` where the key is the item key's `Display` form.
//! Upserts are single statements, so concurrent writers to one key resolve
//! as last-write-wins.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::model::{ItemState, WorkItem};
use crate::store::StateStore;

use super::Db;

pub struct PgStateStore<T> {
    db: Db,
    queue_name: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> PgStateStore<T> {
    /// `queue_name` partitions the shared table between queues.
    pub fn new(db: Db, queue_name: impl Into<String>) -> Self {
        Self {
            db,
            queue_name: queue_name.into(),
            _item: PhantomData,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

type StateRow = (serde_json::Value, bool);

fn decode<T: DeserializeOwned>((item, in_processing): StateRow) -> Result<ItemState<T>> {
    Ok(ItemState {
        item: serde_json::from_value(item)?,
        in_processing,
    })
}

#[async_trait]
impl<T> StateStore<T> for PgStateStore<T>
where
    T: WorkItem + Serialize + DeserializeOwned,
{
    async fn persist(&self, state: &ItemState<T>) -> Result<()> {
        let item = serde_json::to_value(&state.item)?;
        sqlx::query(
            "INSERT INTO work_item_states (queue_name, item_key, item, in_processing, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (queue_name, item_key)
             DO UPDATE SET item = EXCLUDED.item,
                           in_processing = EXCLUDED.in_processing,
                           updated_at = EXCLUDED.updated_at",
        )
        .bind(&self.queue_name)
        .bind(state.key().to_string())
        .bind(item)
        .bind(state.in_processing)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn load_by_key(&self, key: &T::Key) -> Result<Option<ItemState<T>>> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT item, in_processing FROM work_item_states
             WHERE queue_name = $1 AND item_key = $2",
        )
        .bind(&self.queue_name)
        .bind(key.to_string())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(decode).transpose()
    }

    async fn load_all_in_processing(&self) -> Result<Vec<ItemState<T>>> {
        let rows: Vec<StateRow> = sqlx::query_as(
            "SELECT item, in_processing FROM work_item_states
             WHERE queue_name = $1 AND in_processing
             ORDER BY updated_at ASC",
        )
        .bind(&self.queue_name)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(decode).collect()
    }
}
