//! Balance sink: where completed cycles are paid.
//!
//! `credit` must be idempotent on `cycle_id`. The engine re-requests every
//! unacknowledged credit on each tick and after every reload, so the sink is
//! the last line against double payout.

use async_trait::async_trait;
use minecycle_core::CycleId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::storage::{balance_key, credit_marker_key, RedisStorage};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid credit amount {0}")]
    InvalidAmount(f64),
    #[error("balance sink unavailable: {0}")]
    Unavailable(String),
    #[error("balance sink call timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditReceipt {
    pub cycle_id: CycleId,
    /// False when the cycle had already been credited.
    pub applied: bool,
    /// Balance after the call, when the sink reports one.
    pub balance: Option<f64>,
}

#[async_trait]
pub trait BalanceSink: Send + Sync {
    async fn credit(&self, user_id: &str, cycle_id: CycleId, amount: f64) -> Result<CreditReceipt, SinkError>;
}

fn check_amount(amount: f64) -> Result<(), SinkError> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(SinkError::InvalidAmount(amount))
    }
}

/// Marker and increment in one script so a crash cannot leave one without
/// the other.
const CREDIT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  local balance = redis.call('INCRBYFLOAT', KEYS[2], ARGV[1])
  return {1, balance}
end
return {0, redis.call('GET', KEYS[2]) or '0'}
"#;

pub struct RedisBalanceSink {
    storage: Arc<RedisStorage>,
}

impl RedisBalanceSink {
    pub fn new(storage: Arc<RedisStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BalanceSink for RedisBalanceSink {
    async fn credit(&self, user_id: &str, cycle_id: CycleId, amount: f64) -> Result<CreditReceipt, SinkError> {
        check_amount(amount)?;
        let mut conn = self.storage.connection().await?;

        let (applied, balance): (i64, String) = redis::cmd("EVAL")
            .arg(CREDIT_SCRIPT)
            .arg(2)
            .arg(credit_marker_key(&cycle_id))
            .arg(balance_key(user_id))
            .arg(amount.to_string())
            .query_async(&mut conn)
            .await?;

        let applied = applied == 1;
        if applied {
            tracing::info!(user = %user_id, cycle = %cycle_id, amount, "balance credited");
        } else {
            tracing::debug!(user = %user_id, cycle = %cycle_id, "credit already applied");
        }

        Ok(CreditReceipt {
            cycle_id,
            applied,
            balance: balance.parse().ok(),
        })
    }
}

/// In-process sink keyed by cycle id. `set_failing` simulates an outage.
#[derive(Default)]
pub struct MemoryBalanceSink {
    inner: Mutex<MemoryLedger>,
    failing: AtomicBool,
}

#[derive(Default)]
struct MemoryLedger {
    balances: HashMap<String, f64>,
    credited: HashMap<CycleId, f64>,
    calls: usize,
}

impl MemoryBalanceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn balance(&self, user_id: &str) -> f64 {
        self.inner.lock().await.balances.get(user_id).copied().unwrap_or(0.0)
    }

    /// Distinct cycles credited.
    pub async fn credited_cycles(&self) -> usize {
        self.inner.lock().await.credited.len()
    }

    /// Every `credit` call that reached the ledger, duplicates included.
    pub async fn calls(&self) -> usize {
        self.inner.lock().await.calls
    }
}

#[async_trait]
impl BalanceSink for MemoryBalanceSink {
    async fn credit(&self, user_id: &str, cycle_id: CycleId, amount: f64) -> Result<CreditReceipt, SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("memory sink failing".to_string()));
        }
        check_amount(amount)?;

        let mut ledger = self.inner.lock().await;
        ledger.calls += 1;
        let applied = !ledger.credited.contains_key(&cycle_id);
        if applied {
            ledger.credited.insert(cycle_id, amount);
            *ledger.balances.entry(user_id.to_string()).or_insert(0.0) += amount;
        }
        let balance = ledger.balances.get(user_id).copied();

        Ok(CreditReceipt { cycle_id, applied, balance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_is_idempotent_per_cycle() {
        let sink = MemoryBalanceSink::new();
        let cycle = CycleId::new();

        let first = sink.credit("alice", cycle, 48.0).await.unwrap();
        let again = sink.credit("alice", cycle, 48.0).await.unwrap();

        assert!(first.applied);
        assert!(!again.applied);
        assert_eq!(again.balance, Some(48.0));
        assert_eq!(sink.balance("alice").await, 48.0);
        assert_eq!(sink.credited_cycles().await, 1);
        assert_eq!(sink.calls().await, 2);
    }

    #[tokio::test]
    async fn test_failing_sink_records_nothing() {
        let sink = MemoryBalanceSink::new();
        sink.set_failing(true);
        assert!(matches!(
            sink.credit("alice", CycleId::new(), 1.0).await,
            Err(SinkError::Unavailable(_))
        ));
        assert_eq!(sink.calls().await, 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_amounts() {
        let sink = MemoryBalanceSink::new();
        assert!(matches!(
            sink.credit("alice", CycleId::new(), f64::NAN).await,
            Err(SinkError::InvalidAmount(_))
        ));
        assert!(sink.credit("alice", CycleId::new(), -1.0).await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_sink_credits_once() {
        let storage = Arc::new(RedisStorage::new("redis://127.0.0.1/").unwrap());
        let sink = RedisBalanceSink::new(storage);
        let cycle = CycleId::new();
        let user = format!("sink-test-{}", cycle);

        let first = sink.credit(&user, cycle, 48.0).await.unwrap();
        let again = sink.credit(&user, cycle, 48.0).await.unwrap();
        assert!(first.applied);
        assert!(!again.applied);
        assert_eq!(again.balance, Some(48.0));
    }
}
