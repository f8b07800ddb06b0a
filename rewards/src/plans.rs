//! Boost plan lookup for the rate calculator.

use async_trait::async_trait;
use minecycle_core::BoostPlan;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::storage::{plans_key, RedisStorage};

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Every plan the user holds. Expired plans may be included; the rate
    /// calculator filters them.
    async fn active_plans(&self, user_id: &str) -> anyhow::Result<Vec<BoostPlan>>;
}

/// Plans stored as a JSON array under `user:{id}:plans`, written by the
/// purchase flow.
pub struct RedisPlanSource {
    storage: Arc<RedisStorage>,
}

impl RedisPlanSource {
    pub fn new(storage: Arc<RedisStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RateSource for RedisPlanSource {
    async fn active_plans(&self, user_id: &str) -> anyhow::Result<Vec<BoostPlan>> {
        let mut conn = self.storage.connection().await?;
        let raw: Option<String> = conn.get(plans_key(user_id)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Fixed plans per user. Users without an entry get none.
#[derive(Default)]
pub struct StaticPlanSource {
    plans: RwLock<HashMap<String, Vec<BoostPlan>>>,
}

impl StaticPlanSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, user_id: &str, plans: Vec<BoostPlan>) {
        self.plans.write().await.insert(user_id.to_string(), plans);
    }
}

#[async_trait]
impl RateSource for StaticPlanSource {
    async fn active_plans(&self, user_id: &str) -> anyhow::Result<Vec<BoostPlan>> {
        Ok(self.plans.read().await.get(user_id).cloned().unwrap_or_default())
    }
}
