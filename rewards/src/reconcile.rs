//! Load path: read both stores, merge remote-wins, write the result back.

use minecycle_core::{merge, Clock, CycleState, RecordOrigin};
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::store::{timed, CycleStore};

/// Result of [`Reconciler::load`].
#[derive(Debug, Clone)]
pub struct Loaded {
    pub state: CycleState,
    pub origin: RecordOrigin,
    /// The remote holds exactly `state`. False means the caller must push it.
    pub remote_synced: bool,
}

pub struct Reconciler {
    local: Arc<dyn CycleStore>,
    remote: Arc<dyn CycleStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn CycleStore>,
        remote: Arc<dyn CycleStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self { local, remote, clock, timeout }
    }

    /// Never fails: an unreachable store is treated as having no record, and
    /// a user with no record anywhere starts `Idle`.
    pub async fn load(&self, user_id: &str) -> Loaded {
        let local = match self.local.read(user_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(user = %user_id, store = self.local.name(), error = %e, "local cycle cache unreadable");
                metrics::inc_store_read_failures(self.local.name());
                None
            }
        };

        let (remote, remote_reachable) = match timed(self.timeout, self.remote.read(user_id)).await {
            Ok(record) => (record, true),
            Err(e) => {
                tracing::warn!(user = %user_id, store = self.remote.name(), error = %e, "remote cycle record unavailable, using local cache");
                metrics::inc_store_read_failures(self.remote.name());
                (None, false)
            }
        };

        let reconciled = merge(user_id, local, remote.clone(), self.clock.now());
        let mut state = reconciled.state;
        let mut remote_synced = remote.as_ref() == Some(&state);

        if !remote_synced && remote_reachable {
            match timed(self.timeout, self.remote.write(&state)).await {
                Ok(stamp) => {
                    if let Some(ts) = stamp {
                        if state.source_timestamp.map_or(true, |cur| ts > cur) {
                            state.source_timestamp = Some(ts);
                        }
                    }
                    remote_synced = true;
                }
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "could not push reconciled record to remote");
                    metrics::inc_store_write_failures(self.remote.name());
                }
            }
        }

        if let Err(e) = self.local.write(&state).await {
            tracing::warn!(user = %user_id, error = %e, "could not refresh local cycle cache");
            metrics::inc_store_write_failures(self.local.name());
        }

        tracing::debug!(
            user = %user_id,
            origin = ?reconciled.origin,
            remote_synced,
            pending = state.pending_credits.len(),
            "cycle record loaded"
        );

        Loaded { state, origin: reconciled.origin, remote_synced }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCycleStore;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use minecycle_core::{CycleId, ManualClock, PendingCredit, StoredPhase};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    struct Fixture {
        local: Arc<MemoryCycleStore>,
        remote: Arc<MemoryCycleStore>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let local = Arc::new(MemoryCycleStore::new("local"));
        let remote = Arc::new(MemoryCycleStore::stamped("remote", clock.clone()));
        let reconciler = Reconciler::new(local.clone(), remote.clone(), clock, Duration::from_millis(500));
        Fixture { local, remote, reconciler }
    }

    #[tokio::test]
    async fn test_fresh_user_is_idle_everywhere() {
        let f = fixture();
        let loaded = f.reconciler.load("alice").await;

        assert_eq!(loaded.origin, RecordOrigin::Fresh);
        assert!(loaded.remote_synced);
        assert_eq!(loaded.state.phase, StoredPhase::Idle);
        assert_eq!(loaded.state.source_timestamp, Some(t0()));
        assert!(f.local.get("alice").await.is_some());
        assert!(f.remote.get("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_remote_record_overwrites_local_cache() {
        let f = fixture();
        let mut local = CycleState::new_idle("alice", t0());
        local.lifetime_yield = 1_000.0;
        f.local.insert(local).await;

        let mut remote = CycleState::new_idle("alice", t0());
        remote.cycle_completed_at = Some(t0() - ChronoDuration::hours(2));
        remote.lifetime_yield = 48.0;
        remote.source_timestamp = Some(t0());
        f.remote.insert(remote.clone()).await;

        let loaded = f.reconciler.load("alice").await;
        assert_eq!(loaded.origin, RecordOrigin::Remote);
        assert!(loaded.remote_synced);
        assert_eq!(loaded.state, remote);
        assert_eq!(f.local.get("alice").await.unwrap(), remote);
        assert_eq!(f.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_remote_falls_back_to_local() {
        let f = fixture();
        let mut local = CycleState::new_idle("alice", t0());
        local.lifetime_yield = 48.0;
        f.local.insert(local.clone()).await;
        f.remote.set_offline(true);

        let loaded = f.reconciler.load("alice").await;
        assert_eq!(loaded.origin, RecordOrigin::Local);
        assert!(!loaded.remote_synced);
        assert_eq!(loaded.state, local);
    }

    #[tokio::test]
    async fn test_local_pending_credit_is_pushed_to_remote() {
        let f = fixture();
        let cycle_id = CycleId::new();

        let remote = CycleState::new_idle("alice", t0());
        f.remote.insert(remote).await;

        let mut local = CycleState::new_idle("alice", t0());
        local.pending_credits.push(PendingCredit {
            cycle_id,
            amount: 48.0,
            completed_at: t0(),
        });
        f.local.insert(local).await;

        let loaded = f.reconciler.load("alice").await;
        assert!(loaded.remote_synced);
        assert_eq!(loaded.state.pending_credits.len(), 1);
        assert_eq!(loaded.state.lifetime_yield, 48.0);
        let pushed = f.remote.get("alice").await.unwrap();
        assert_eq!(pushed.pending_credits[0].cycle_id, cycle_id);
    }
}
