use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minecycle_core::CycleState;
use redis::AsyncCommands;
use std::sync::Arc;

use super::{CycleStore, StoreError};
use crate::storage::{cycle_key, RedisStorage};

/// Remote authoritative record. Every write is stamped with Redis server time.
pub struct RedisCycleStore {
    storage: Arc<RedisStorage>,
}

impl RedisCycleStore {
    pub fn new(storage: Arc<RedisStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CycleStore for RedisCycleStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn read(&self, user_id: &str) -> Result<Option<CycleState>, StoreError> {
        let mut conn = self.storage.connection().await?;
        let raw: Option<String> = conn.get(cycle_key(user_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, state: &CycleState) -> Result<Option<DateTime<Utc>>, StoreError> {
        let stamp = self.storage.server_time().await?;

        let mut stamped = state.clone();
        if stamped.source_timestamp.map_or(true, |cur| stamp > cur) {
            stamped.source_timestamp = Some(stamp);
        }
        let json = serde_json::to_string(&stamped)?;

        let mut conn = self.storage.connection().await?;
        conn.set::<_, _, ()>(cycle_key(&state.user_id), json).await?;

        tracing::debug!(user = %state.user_id, %stamp, "remote cycle record written");
        Ok(stamped.source_timestamp)
    }
}
