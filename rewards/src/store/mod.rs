//! Cycle record persistence.
//!
//! Two roles use the same trait: the local cache (advisory, offline fallback)
//! and the remote authoritative record. Only a remote store stamps
//! `source_timestamp`, and it reports the stamp back from `write`.

pub mod file;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minecycle_core::CycleState;
use thiserror::Error;

pub use file::FileCycleStore;
pub use memory::MemoryCycleStore;
pub use self::redis::RedisCycleStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
}

#[async_trait]
pub trait CycleStore: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn read(&self, user_id: &str) -> Result<Option<CycleState>, StoreError>;

    /// Overwrite the user's record. Returns the server stamp applied to it,
    /// if this store is authoritative.
    async fn write(&self, state: &CycleState) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Bound a store call; an elapsed timer becomes `StoreError::Timeout`.
pub async fn timed<T, F>(limit: std::time::Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout),
    }
}
