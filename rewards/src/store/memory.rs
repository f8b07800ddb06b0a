use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minecycle_core::{Clock, CycleState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CycleStore, StoreError};

/// In-process store for development and tests.
///
/// With a clock attached it behaves like an authoritative store and stamps
/// `source_timestamp` on every write. `set_offline` simulates an outage.
pub struct MemoryCycleStore {
    name: &'static str,
    records: RwLock<HashMap<String, CycleState>>,
    clock: Option<Arc<dyn Clock>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryCycleStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: RwLock::new(HashMap::new()),
            clock: None,
            offline: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Authoritative variant that stamps writes with `clock`.
    pub fn stamped(name: &'static str, clock: Arc<dyn Clock>) -> Self {
        Self { clock: Some(clock), ..Self::new(name) }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed or inspect a record directly, bypassing the offline switch.
    pub async fn insert(&self, state: CycleState) {
        self.records.write().await.insert(state.user_id.clone(), state);
    }

    pub async fn get(&self, user_id: &str) -> Option<CycleState> {
        self.records.read().await.get(user_id).cloned()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{} store offline", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CycleStore for MemoryCycleStore {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn read(&self, user_id: &str) -> Result<Option<CycleState>, StoreError> {
        self.check_online()?;
        Ok(self.get(user_id).await)
    }

    async fn write(&self, state: &CycleState) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check_online()?;
        let mut record = state.clone();
        if let Some(clock) = &self.clock {
            let stamp = clock.now();
            if record.source_timestamp.map_or(true, |cur| stamp > cur) {
                record.source_timestamp = Some(stamp);
            }
        }
        let stamp = if self.clock.is_some() { record.source_timestamp } else { None };
        self.records.write().await.insert(record.user_id.clone(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stamp)
    }
}
