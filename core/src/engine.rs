//! Mining cycle state machine.
//!
//! `MiningEngine` is synchronous and deterministic: every operation takes the
//! current time, mutates the owned `CycleState`, and returns the side effects
//! the caller must carry out as a list of [`Action`]s. The engine performs no
//! I/O, so a persistence or payout failure can never leave it half-updated.
//!
//! Progress is derived from `cycle_started_at` on every tick rather than
//! accumulated, so a missed tick (closed client, suspended task) only delays
//! the completion edge; it never changes the payout.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CycleConfig;
use crate::error::CycleError;
use crate::rate::{BoostPlan, RateCalculator};
use crate::state::{CycleId, CycleState, PendingCredit, Phase, StoredPhase};

/// Side effect requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write the record to the local cache and the remote store.
    Persist(CycleState),
    /// Credit a completed cycle. Must be idempotent on `cycle_id`.
    Credit { user_id: String, cycle_id: CycleId, amount: f64 },
    /// Fire-and-forget user notification.
    Notify(MilestoneEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneEvent {
    pub user_id: String,
    pub at: DateTime<Utc>,
    pub kind: MilestoneKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MilestoneKind {
    CycleStarted { cycle_id: CycleId },
    Progress { cycle_id: CycleId, percent: u8 },
    CycleCompleted { cycle_id: CycleId, amount: f64 },
    CycleStopped { cycle_id: CycleId, forfeited: f64 },
    CreditConfirmed { cycle_id: CycleId, amount: f64 },
    CooldownCleared,
    CooldownReset,
}

/// Read-only view handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub user_id: String,
    pub phase: Phase,
    pub progress_percent: f64,
    pub cycle_id: Option<CycleId>,
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub cycle_ends_at: Option<DateTime<Utc>>,
    pub cycle_completed_at: Option<DateTime<Utc>>,
    pub session_yield: f64,
    pub lifetime_yield: f64,
    pub rate_per_hour: f64,
    pub cooldown_remaining_secs: Option<i64>,
    pub pending_credits: usize,
    pub pending_credit_total: f64,
    pub observed_at: DateTime<Utc>,
}

impl CycleSnapshot {
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.cooldown_remaining_secs.map(Duration::seconds)
    }
}

pub struct MiningEngine {
    config: CycleConfig,
    rate: RateCalculator,
    state: CycleState,
    /// Plans from the latest tick; used when `start` or `stop` lands after
    /// the running cycle has already ended.
    plans: Vec<BoostPlan>,
    /// Set while this instance has seen an active cooldown; used to emit
    /// `CooldownCleared` exactly once without touching stored fields.
    cooldown_observed: bool,
}

impl MiningEngine {
    pub fn new(config: CycleConfig, state: CycleState) -> Self {
        Self {
            rate: RateCalculator::new(config.base_rate_per_hour),
            config,
            state,
            plans: Vec::new(),
            cooldown_observed: false,
        }
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn phase(&self, now: DateTime<Utc>) -> Phase {
        self.state.derived_phase(now, self.config.cooldown_duration())
    }

    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.state.cooldown_remaining(now, self.config.cooldown_duration())
    }

    /// Server-stamped time of the last remote write.
    pub fn set_source_timestamp(&mut self, ts: DateTime<Utc>) {
        if self.state.source_timestamp.map_or(true, |cur| ts > cur) {
            self.state.source_timestamp = Some(ts);
        }
    }

    /// End of the running cycle once `now` has reached it.
    fn overdue_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.state.is_mining() {
            return None;
        }
        let end = self.state.cycle_started_at? + self.config.cycle_duration();
        (self.state.effective_now(now) >= end).then_some(end)
    }

    /// Complete a cycle that ran past its end without being ticked.
    fn settle_overdue(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let plans = self.plans.clone();
        self.tick_mining(now, &plans, actions);
        actions.extend(self.credit_actions());
    }

    /// `Idle → Mining`. A cycle already past its end counts as completed,
    /// so the cooldown it started applies.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<Vec<Action>, CycleError> {
        let mut actions = Vec::new();
        if let Some(end) = self.overdue_end(now) {
            let ready_at = end + self.config.cooldown_duration();
            let effective = self.state.effective_now(now);
            if effective < ready_at {
                return Err(CycleError::CooldownActive { remaining: ready_at - effective });
            }
            self.settle_overdue(now, &mut actions);
        }
        if self.state.is_mining() {
            return Err(CycleError::AlreadyMining);
        }
        if let Some(remaining) = self.cooldown_remaining(now) {
            return Err(CycleError::CooldownActive { remaining });
        }

        let now = self.state.effective_now(now);
        let cycle_id = CycleId::new();
        let s = &mut self.state;
        s.phase = StoredPhase::Mining;
        s.cycle_id = Some(cycle_id);
        s.cycle_started_at = Some(now);
        s.cycle_completed_at = None;
        s.progress_percent = 0.0;
        s.session_yield = 0.0;
        s.updated_at = now;
        self.cooldown_observed = false;

        info!(user = %s.user_id, cycle = %cycle_id, "mining cycle started");

        actions.push(Action::Persist(self.state.clone()));
        actions.push(self.notify(now, MilestoneKind::CycleStarted { cycle_id }));
        Ok(actions)
    }

    /// Manual cancellation. The in-progress session yield is forfeited and no
    /// cooldown starts. No-op unless mining; a cycle already past its end is
    /// completed and paid instead.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        if !self.state.is_mining() {
            return Vec::new();
        }
        if self.overdue_end(now).is_some() {
            let mut actions = Vec::new();
            self.settle_overdue(now, &mut actions);
            return actions;
        }

        let now = self.state.effective_now(now);
        let s = &mut self.state;
        let forfeited = s.session_yield;
        let cycle_id = s.cycle_id.unwrap_or_default();
        s.phase = StoredPhase::Idle;
        s.cycle_started_at = None;
        s.progress_percent = 0.0;
        s.session_yield = 0.0;
        s.updated_at = now;

        info!(user = %s.user_id, cycle = %cycle_id, forfeited, "mining cycle stopped");

        vec![
            Action::Persist(self.state.clone()),
            self.notify(now, MilestoneKind::CycleStopped { cycle_id, forfeited }),
        ]
    }

    /// Privileged: clear the cooldown anchor regardless of elapsed time.
    /// Authorization is the caller's concern.
    pub fn reset_cooldown(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        let now = self.state.effective_now(now);
        self.state.cycle_completed_at = None;
        self.state.updated_at = now;
        self.cooldown_observed = false;

        info!(user = %self.state.user_id, "cooldown reset");

        vec![
            Action::Persist(self.state.clone()),
            self.notify(now, MilestoneKind::CooldownReset),
        ]
    }

    /// Advance the state machine to `now`.
    ///
    /// While mining this recomputes progress and yield, and on reaching 100%
    /// completes the cycle in the same call. While idle it only re-derives the
    /// cooldown. Every unacknowledged credit is re-requested on each tick.
    pub fn tick(&mut self, now: DateTime<Utc>, plans: &[BoostPlan]) -> Vec<Action> {
        let mut actions = Vec::new();
        self.plans = plans.to_vec();

        if self.state.is_mining() {
            self.tick_mining(now, plans, &mut actions);
        } else {
            self.tick_idle(now, &mut actions);
        }

        actions.extend(self.credit_actions());
        actions
    }

    fn tick_mining(&mut self, now: DateTime<Utc>, plans: &[BoostPlan], actions: &mut Vec<Action>) {
        let now = self.state.effective_now(now);
        let Some(started_at) = self.state.cycle_started_at else {
            return;
        };
        let cycle_id = match self.state.cycle_id {
            Some(id) => id,
            None => {
                let id = CycleId::new();
                self.state.cycle_id = Some(id);
                id
            }
        };

        let duration = self.config.cycle_duration();
        let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
        let fraction = elapsed_ms / duration.num_milliseconds().max(1) as f64;

        if fraction >= 1.0 {
            self.complete(cycle_id, started_at + duration, plans, actions);
            return;
        }

        let previous = self.state.progress_percent;
        let progress = (fraction * 100.0).max(previous);
        let rate = self.rate.compute_rate(plans, now);

        self.state.progress_percent = progress;
        self.state.session_yield = rate * (progress / 100.0) * self.config.cycle_duration_hours;
        self.state.updated_at = now;

        debug!(
            user = %self.state.user_id,
            progress,
            session_yield = self.state.session_yield,
            "mining tick"
        );

        actions.push(Action::Persist(self.state.clone()));
        if let Some(percent) = crossed_milestone(previous, progress, self.config.milestone_step_percent) {
            actions.push(self.notify(now, MilestoneKind::Progress { cycle_id, percent }));
        }
    }

    /// `Mining → Idle` with payout. The yield is exactly
    /// `rate × cycle_duration_hours`, using the rate in force when the cycle
    /// ended rather than when the tick happened to observe it.
    fn complete(
        &mut self,
        cycle_id: CycleId,
        completed_at: DateTime<Utc>,
        plans: &[BoostPlan],
        actions: &mut Vec<Action>,
    ) {
        let rate = self.rate.compute_rate(plans, completed_at);
        let amount = rate * self.config.cycle_duration_hours;
        let already_settled = self.state.is_settled(cycle_id);

        let s = &mut self.state;
        s.phase = StoredPhase::Idle;
        s.cycle_started_at = None;
        s.cycle_completed_at = Some(completed_at);
        s.progress_percent = 0.0;
        s.session_yield = amount;
        s.updated_at = completed_at;
        if !already_settled {
            s.lifetime_yield += amount;
            s.pending_credits.push(PendingCredit { cycle_id, amount, completed_at });
        }
        self.cooldown_observed = true;

        info!(
            user = %s.user_id,
            cycle = %cycle_id,
            amount,
            lifetime = s.lifetime_yield,
            already_settled,
            "mining cycle completed"
        );

        actions.push(Action::Persist(self.state.clone()));
        actions.push(self.notify(completed_at, MilestoneKind::CycleCompleted { cycle_id, amount }));
    }

    fn tick_idle(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        if self.cooldown_remaining(now).is_some() {
            self.cooldown_observed = true;
        } else if self.cooldown_observed {
            self.cooldown_observed = false;
            let now = self.state.effective_now(now);
            debug!(user = %self.state.user_id, "cooldown elapsed");
            actions.push(self.notify(now, MilestoneKind::CooldownCleared));
        }
    }

    /// The sink acknowledged `cycle_id`. Unknown ids are ignored.
    pub fn confirm_credit(&mut self, cycle_id: CycleId, now: DateTime<Utc>) -> Vec<Action> {
        let Some(pos) = self.state.pending_credits.iter().position(|p| p.cycle_id == cycle_id) else {
            return Vec::new();
        };

        let now = self.state.effective_now(now);
        let credit = self.state.pending_credits.remove(pos);
        self.state.mark_credited(cycle_id);
        self.state.updated_at = now;

        info!(user = %self.state.user_id, cycle = %cycle_id, amount = credit.amount, "credit confirmed");

        vec![
            Action::Persist(self.state.clone()),
            self.notify(now, MilestoneKind::CreditConfirmed { cycle_id, amount: credit.amount }),
        ]
    }

    /// A `Credit` for every unacknowledged cycle.
    pub fn credit_actions(&self) -> Vec<Action> {
        self.state
            .pending_credits
            .iter()
            .map(|p| Action::Credit {
                user_id: self.state.user_id.clone(),
                cycle_id: p.cycle_id,
                amount: p.amount,
            })
            .collect()
    }

    /// Tick to `now`, then describe the result.
    pub fn get_snapshot(&mut self, now: DateTime<Utc>, plans: &[BoostPlan]) -> (CycleSnapshot, Vec<Action>) {
        let actions = self.tick(now, plans);
        (self.snapshot(now, plans), actions)
    }

    /// View of the current record. Call after `tick` so a due completion has
    /// already been applied.
    pub fn snapshot(&self, now: DateTime<Utc>, plans: &[BoostPlan]) -> CycleSnapshot {
        let s = &self.state;
        let observed_at = s.effective_now(now);
        CycleSnapshot {
            user_id: s.user_id.clone(),
            phase: self.phase(now),
            progress_percent: s.progress_percent,
            cycle_id: s.cycle_id,
            cycle_started_at: s.cycle_started_at,
            cycle_ends_at: s.cycle_started_at.map(|t| t + self.config.cycle_duration()),
            cycle_completed_at: s.cycle_completed_at,
            session_yield: s.session_yield,
            lifetime_yield: s.lifetime_yield,
            rate_per_hour: self.rate.compute_rate(plans, observed_at),
            cooldown_remaining_secs: self.cooldown_remaining(now).map(ceil_secs),
            pending_credits: s.pending_credits.len(),
            pending_credit_total: s.pending_credit_total(),
            observed_at,
        }
    }

    /// Delay until the next tick is useful, or `None` when nothing is
    /// time-dependent.
    pub fn next_tick_in(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        if let Some(started_at) = self.state.cycle_started_at.filter(|_| self.state.is_mining()) {
            let until_end = started_at + self.config.cycle_duration() - self.state.effective_now(now);
            let until_end = until_end.to_std().unwrap_or_default();
            return Some(until_end.min(self.config.tick_interval()));
        }
        if self.cooldown_remaining(now).is_some() {
            return Some(self.config.cooldown_tick());
        }
        if !self.state.pending_credits.is_empty() || self.cooldown_observed {
            return Some(self.config.tick_interval());
        }
        None
    }

    fn notify(&self, at: DateTime<Utc>, kind: MilestoneKind) -> Action {
        Action::Notify(MilestoneEvent {
            user_id: self.state.user_id.clone(),
            at,
            kind,
        })
    }
}

/// Highest multiple of `step` crossed going from `previous` to `current`,
/// excluding 0 and 100.
fn crossed_milestone(previous: f64, current: f64, step: u8) -> Option<u8> {
    if step == 0 {
        return None;
    }
    let step = f64::from(step);
    let before = (previous / step).floor();
    let after = (current / step).floor();
    if after > before {
        let percent = after * step;
        if percent > 0.0 && percent < 100.0 {
            return Some(percent as u8);
        }
    }
    None
}

fn ceil_secs(d: Duration) -> i64 {
    let ms = d.num_milliseconds();
    (ms + 999).div_euclid(1000)
}
