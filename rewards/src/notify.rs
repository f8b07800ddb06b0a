//! Milestone notifications. Fire-and-forget: the driver logs failures and
//! moves on.

use async_trait::async_trait;
use minecycle_core::{MilestoneEvent, MilestoneKind};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::storage::{notifications_key, RedisStorage};

/// Entries kept per user in the notification list.
const NOTIFICATION_HISTORY: isize = 100;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_milestone(&self, event: &MilestoneEvent) -> anyhow::Result<()>;
}

/// Writes events to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn on_milestone(&self, event: &MilestoneEvent) -> anyhow::Result<()> {
        match &event.kind {
            MilestoneKind::Progress { percent, .. } => {
                tracing::info!(user = %event.user_id, percent, "mining milestone reached");
            }
            MilestoneKind::CycleCompleted { amount, .. } => {
                tracing::info!(user = %event.user_id, amount, "mining complete");
            }
            other => {
                tracing::info!(user = %event.user_id, event = ?other, "cycle event");
            }
        }
        Ok(())
    }
}

/// Pushes events as JSON onto a bounded per-user list, newest first.
pub struct RedisNotifier {
    storage: Arc<RedisStorage>,
}

impl RedisNotifier {
    pub fn new(storage: Arc<RedisStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn on_milestone(&self, event: &MilestoneEvent) -> anyhow::Result<()> {
        let key = notifications_key(&event.user_id);
        let payload = serde_json::to_string(event)?;
        let mut conn = self.storage.connection().await?;

        redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(NOTIFICATION_HISTORY - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<MilestoneEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<MilestoneEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn on_milestone(&self, event: &MilestoneEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
