/// Shared Redis connection
///
/// One lazily created `ConnectionManager` is shared by the remote cycle
/// store, the balance sink, the notifier and the plan source. The manager
/// reconnects on its own, so a Redis outage surfaces as per-call errors rather
/// than a dead handle.
///
/// Keys:
/// - cycle:{user}                 remote cycle record (JSON)
/// - user:{user}:balance          coin balance (INCRBYFLOAT)
/// - user:{user}:plans            active boost plans (JSON array)
/// - user:{user}:notifications    latest milestone events (list, newest first)
/// - credit:{cycle_id}            idempotency marker for a credited cycle

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

pub fn cycle_key(user_id: &str) -> String {
    format!("cycle:{}", user_id)
}

pub fn balance_key(user_id: &str) -> String {
    format!("user:{}:balance", user_id)
}

pub fn plans_key(user_id: &str) -> String {
    format!("user:{}:plans", user_id)
}

pub fn notifications_key(user_id: &str) -> String {
    format!("user:{}:notifications", user_id)
}

pub fn credit_marker_key(cycle_id: &minecycle_core::CycleId) -> String {
    format!("credit:{}", cycle_id)
}

pub struct RedisStorage {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
}

impl RedisStorage {
    pub fn new(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    /// Get async connection (lazy initialization)
    pub async fn connection(&self) -> redis::RedisResult<redis::aio::ConnectionManager> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let manager = self.client.get_connection_manager().await?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    pub async fn ping(&self) -> redis::RedisResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Server clock via `TIME`. Used to stamp records so cooldowns are
    /// anchored to server time rather than the writer's clock.
    pub async fn server_time(&self) -> redis::RedisResult<DateTime<Utc>> {
        let mut conn = self.connection().await?;
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        let ts = Utc
            .timestamp_opt(secs, (micros * 1_000) as u32)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minecycle_core::CycleId;

    #[test]
    fn key_layout() {
        assert_eq!(cycle_key("alice"), "cycle:alice");
        assert_eq!(balance_key("alice"), "user:alice:balance");
        assert_eq!(plans_key("alice"), "user:alice:plans");
        let id = CycleId::new();
        assert_eq!(credit_marker_key(&id), format!("credit:{}", id));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_ping_and_time() {
        let storage = RedisStorage::new("redis://127.0.0.1/").unwrap();
        storage.ping().await.unwrap();
        let t = storage.server_time().await.unwrap();
        assert!((Utc::now() - t).num_seconds().abs() < 60);
    }
}
