/// Cycle driver: end-to-end behaviour against in-memory collaborators
///
/// Validates:
/// 1. The documented 24h/24h walk-through through the service
/// 2. Credits survive a sink outage and land exactly once
/// 3. A remote outage falls back to the local cache and re-syncs later
/// 4. A lost sink acknowledgement does not double-credit after reload
/// 5. A remote cooldown overrides a local idle record
/// 6. A rolled-back device clock cannot shorten a cooldown

use chrono::{DateTime, Duration, TimeZone, Utc};
use minecycle_core::{
    Clock, CycleConfig, CycleError, CycleSnapshot, CycleState, ManualClock, MilestoneKind, Phase,
    StoredPhase,
};
use minecycle_rewards::notify::MemoryNotifier;
use minecycle_rewards::plans::StaticPlanSource;
use minecycle_rewards::sink::{BalanceSink, MemoryBalanceSink};
use minecycle_rewards::store::MemoryCycleStore;
use minecycle_rewards::{Collaborators, CycleService, DriverError, DriverTimings};
use std::sync::Arc;
use std::time::Duration as StdDuration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 9, 0, 0).unwrap()
}

struct Fixture {
    clock: ManualClock,
    local: Arc<MemoryCycleStore>,
    remote: Arc<MemoryCycleStore>,
    sink: Arc<MemoryBalanceSink>,
    notifier: Arc<MemoryNotifier>,
    service: CycleService,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(t0());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let local = Arc::new(MemoryCycleStore::new("local"));
    let remote = Arc::new(MemoryCycleStore::stamped("remote", shared.clone()));
    let sink = Arc::new(MemoryBalanceSink::new());
    let notifier = Arc::new(MemoryNotifier::new());

    let service = CycleService::new(Collaborators {
        config: CycleConfig::default(),
        clock: shared,
        local: local.clone(),
        remote: remote.clone(),
        sink: sink.clone(),
        notifier: notifier.clone(),
        plans: Arc::new(StaticPlanSource::new()),
        timings: DriverTimings {
            remote_timeout: StdDuration::from_secs(1),
            retry_backoff: StdDuration::from_millis(10),
            ..DriverTimings::default()
        },
    });

    Fixture { clock, local, remote, sink, notifier, service }
}

/// Poll until the sink has acknowledged every pending credit.
async fn settle(service: &CycleService, user: &str) -> CycleSnapshot {
    let mut snap = service.snapshot(user).await.unwrap();
    for _ in 0..300 {
        if snap.pending_credits == 0 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        snap = service.snapshot(user).await.unwrap();
    }
    snap
}

fn cooldown_remaining(err: DriverError) -> Duration {
    match err {
        DriverError::Cycle(CycleError::CooldownActive { remaining }) => remaining,
        other => panic!("expected cooldown, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_documented_walkthrough() {
    let f = fixture();

    let started = f.service.start("alice").await.unwrap();
    assert_eq!(started.phase, Phase::Mining);
    assert_eq!(started.rate_per_hour, 2.0);

    f.clock.advance(Duration::hours(12));
    let half = f.service.snapshot("alice").await.unwrap();
    assert_eq!(half.phase, Phase::Mining);
    assert!((half.progress_percent - 50.0).abs() < 1e-9);
    assert!((half.session_yield - 24.0).abs() < 1e-9);

    f.clock.advance(Duration::hours(12));
    let done = settle(&f.service, "alice").await;
    assert_eq!(done.phase, Phase::Cooldown);
    assert_eq!(done.session_yield, 48.0);
    assert_eq!(done.lifetime_yield, 48.0);
    assert_eq!(done.pending_credits, 0);
    assert_eq!(f.sink.balance("alice").await, 48.0);

    f.clock.advance(Duration::hours(6));
    let err = f.service.start("alice").await.unwrap_err();
    assert_eq!(cooldown_remaining(err), Duration::hours(18));

    f.clock.advance(Duration::hours(18));
    let again = f.service.start("alice").await.unwrap();
    assert_eq!(again.phase, Phase::Mining);
    assert_ne!(again.cycle_id, started.cycle_id);
    assert_eq!(f.sink.credited_cycles().await, 1);

    let mut completed = false;
    for _ in 0..100 {
        completed = f
            .notifier
            .events()
            .await
            .iter()
            .any(|e| matches!(e.kind, MilestoneKind::CycleCompleted { amount, .. } if amount == 48.0));
        if completed {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(completed, "completion notification was not delivered");
}

#[tokio::test]
async fn test_sink_outage_keeps_credit_pending_until_it_recovers() {
    let f = fixture();
    f.sink.set_failing(true);

    f.service.start("bob").await.unwrap();
    f.clock.advance(Duration::hours(25));

    let snap = f.service.snapshot("bob").await.unwrap();
    assert_eq!(snap.phase, Phase::Cooldown);
    assert_eq!(snap.pending_credits, 1);
    assert_eq!(snap.pending_credit_total, 48.0);
    assert_eq!(snap.lifetime_yield, 48.0);

    f.sink.set_failing(false);
    let snap = settle(&f.service, "bob").await;
    assert_eq!(snap.pending_credits, 0);
    assert_eq!(snap.lifetime_yield, 48.0);
    assert_eq!(f.sink.balance("bob").await, 48.0);
    assert_eq!(f.sink.credited_cycles().await, 1);
}

#[tokio::test]
async fn test_remote_outage_falls_back_and_resyncs() {
    let f = fixture();
    f.remote.set_offline(true);

    let started = f.service.start("carol").await.unwrap();
    assert_eq!(started.phase, Phase::Mining);
    let cached = f.local.get("carol").await.unwrap();
    assert_eq!(cached.phase, StoredPhase::Mining);

    f.remote.set_offline(false);
    let mut synced = None;
    for _ in 0..300 {
        synced = f.remote.get("carol").await.filter(|s| s.phase == StoredPhase::Mining);
        if synced.is_some() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    let synced = synced.expect("remote record never caught up");
    assert_eq!(synced.cycle_id, started.cycle_id);
    assert!(synced.source_timestamp.is_some());
}

#[tokio::test]
async fn test_lost_acknowledgement_does_not_double_credit() {
    let f = fixture();
    f.sink.set_failing(true);

    f.service.start("dave").await.unwrap();
    f.clock.advance(Duration::hours(25));
    let snap = f.service.snapshot("dave").await.unwrap();
    let cycle_id = snap.cycle_id.unwrap();
    assert_eq!(snap.pending_credits, 1);

    // The session dies; the sink applied the credit but the ack never
    // reached the driver.
    f.service.release("dave").await;
    f.sink.set_failing(false);
    let receipt = f.sink.credit("dave", cycle_id, 48.0).await.unwrap();
    assert!(receipt.applied);

    let snap = settle(&f.service, "dave").await;
    assert_eq!(snap.pending_credits, 0);
    assert_eq!(snap.lifetime_yield, 48.0);
    assert_eq!(f.sink.balance("dave").await, 48.0);
    assert_eq!(f.sink.credited_cycles().await, 1);

    // A further reload is a no-op for the ledger.
    f.service.release("dave").await;
    let snap = settle(&f.service, "dave").await;
    assert_eq!(snap.lifetime_yield, 48.0);
    assert_eq!(f.sink.balance("dave").await, 48.0);
}

#[tokio::test]
async fn test_remote_cooldown_overrides_local_idle() {
    let f = fixture();

    let mut remote = CycleState::new_idle("erin", t0());
    remote.cycle_completed_at = Some(t0() - Duration::hours(2));
    remote.lifetime_yield = 48.0;
    remote.source_timestamp = Some(t0());
    f.remote.insert(remote).await;
    f.local.insert(CycleState::new_idle("erin", t0())).await;

    let err = f.service.start("erin").await.unwrap_err();
    assert_eq!(cooldown_remaining(err), Duration::hours(22));

    let snap = f.service.snapshot("erin").await.unwrap();
    assert_eq!(snap.phase, Phase::Cooldown);
    assert_eq!(f.local.get("erin").await.unwrap().cycle_completed_at, Some(t0() - Duration::hours(2)));
}

#[tokio::test]
async fn test_rolled_back_clock_cannot_shorten_cooldown() {
    let f = fixture();

    f.service.start("frank").await.unwrap();
    f.clock.advance(Duration::hours(25));
    settle(&f.service, "frank").await;
    f.service.release("frank").await;

    f.clock.set(t0() - Duration::hours(10));
    let err = f.service.start("frank").await.unwrap_err();
    assert_eq!(cooldown_remaining(err), Duration::hours(23));
    assert_eq!(f.sink.credited_cycles().await, 1);
}

#[tokio::test]
async fn test_stop_forfeits_and_allows_restart() {
    let f = fixture();

    let first = f.service.start("gina").await.unwrap();
    f.clock.advance(Duration::hours(6));
    let stopped = f.service.stop("gina").await.unwrap();
    assert_eq!(stopped.phase, Phase::Idle);
    assert_eq!(stopped.session_yield, 0.0);
    assert_eq!(stopped.lifetime_yield, 0.0);

    let second = f.service.start("gina").await.unwrap();
    assert_ne!(second.cycle_id, first.cycle_id);
    assert_eq!(f.sink.calls().await, 0);
}

#[tokio::test]
async fn test_admin_reset_clears_cooldown() {
    let f = fixture();

    f.service.start("hana").await.unwrap();
    f.clock.advance(Duration::hours(24));
    settle(&f.service, "hana").await;
    assert!(f.service.start("hana").await.is_err());

    let reset = f.service.reset_cooldown("hana").await.unwrap();
    assert_eq!(reset.phase, Phase::Idle);
    assert_eq!(reset.cooldown_remaining_secs, None);
    assert!(f.service.start("hana").await.is_ok());
}
