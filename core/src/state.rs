/// Persisted cycle record and its derived views.
///
/// Only `Idle` and `Mining` are stored. `Cooldown` is always derived from
/// `cycle_completed_at` and the configured cooldown duration, so there is a
/// single source of truth for when the next cycle may begin.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Idempotency key for one cycle; every credit is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Phase as written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredPhase {
    #[default]
    Idle,
    Mining,
}

/// Phase as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Mining,
    Cooldown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Mining => "mining",
            Phase::Cooldown => "cooldown",
        };
        f.write_str(s)
    }
}

/// Confirmed cycle ids kept on the record for merge decisions.
pub const RECENT_CREDITS: usize = 32;

/// A completed cycle whose credit has not been acknowledged by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingCredit {
    pub cycle_id: CycleId,
    pub amount: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub user_id: String,
    #[serde(default)]
    pub phase: StoredPhase,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub cycle_id: Option<CycleId>,
    #[serde(default)]
    pub cycle_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycle_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_yield: f64,
    #[serde(default)]
    pub lifetime_yield: f64,
    /// Server time of the last remote write. Never set from the local clock.
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_credits: Vec<PendingCredit>,
    #[serde(default)]
    pub last_credited_cycle: Option<CycleId>,
    /// Latest confirmations, oldest first, at most `RECENT_CREDITS`.
    #[serde(default)]
    pub recent_credits: Vec<CycleId>,
    pub updated_at: DateTime<Utc>,
}

impl CycleState {
    /// Fresh record for a user that has never mined.
    pub fn new_idle(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            phase: StoredPhase::Idle,
            progress_percent: 0.0,
            cycle_id: None,
            cycle_started_at: None,
            cycle_completed_at: None,
            session_yield: 0.0,
            lifetime_yield: 0.0,
            source_timestamp: None,
            pending_credits: Vec::new(),
            last_credited_cycle: None,
            recent_credits: Vec::new(),
            updated_at: now,
        }
    }

    pub fn is_mining(&self) -> bool {
        self.phase == StoredPhase::Mining
    }

    /// `now` raised to the last server stamp, so a rolled-back local clock
    /// cannot move the cycle backwards.
    pub fn effective_now(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.source_timestamp {
            Some(ts) if ts > now => ts,
            _ => now,
        }
    }

    /// Remaining cooldown at `now`, `None` once elapsed or when no cycle has
    /// completed.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>, cooldown: Duration) -> Option<Duration> {
        if self.is_mining() {
            return None;
        }
        let completed_at = self.cycle_completed_at?;
        let elapsed = self.effective_now(now) - completed_at;
        let remaining = cooldown - elapsed;
        if remaining > Duration::zero() {
            Some(remaining)
        } else {
            None
        }
    }

    pub fn derived_phase(&self, now: DateTime<Utc>, cooldown: Duration) -> Phase {
        match self.phase {
            StoredPhase::Mining => Phase::Mining,
            StoredPhase::Idle if self.cooldown_remaining(now, cooldown).is_some() => Phase::Cooldown,
            StoredPhase::Idle => Phase::Idle,
        }
    }

    pub fn pending_credit_total(&self) -> f64 {
        self.pending_credits.iter().map(|p| p.amount).sum()
    }

    pub fn was_credited(&self, cycle_id: CycleId) -> bool {
        self.last_credited_cycle == Some(cycle_id) || self.recent_credits.contains(&cycle_id)
    }

    /// True once `cycle_id` has been paid or queued for payment.
    pub fn is_settled(&self, cycle_id: CycleId) -> bool {
        self.was_credited(cycle_id) || self.pending_credits.iter().any(|p| p.cycle_id == cycle_id)
    }

    /// Record a sink confirmation.
    pub fn mark_credited(&mut self, cycle_id: CycleId) {
        self.last_credited_cycle = Some(cycle_id);
        self.recent_credits.retain(|id| *id != cycle_id);
        self.recent_credits.push(cycle_id);
        if self.recent_credits.len() > RECENT_CREDITS {
            let excess = self.recent_credits.len() - RECENT_CREDITS;
            self.recent_credits.drain(..excess);
        }
    }

    /// Structural invariants of a stored record.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.phase {
            StoredPhase::Mining => {
                if self.cycle_started_at.is_none() {
                    return Err("mining without cycle_started_at".into());
                }
                if self.cycle_completed_at.is_some() {
                    return Err("mining with cycle_completed_at set".into());
                }
                if self.cycle_id.is_none() {
                    return Err("mining without cycle_id".into());
                }
                if !(0.0..100.0).contains(&self.progress_percent) {
                    return Err(format!("mining progress out of range: {}", self.progress_percent));
                }
            }
            StoredPhase::Idle => {
                if self.cycle_started_at.is_some() {
                    return Err("idle with cycle_started_at set".into());
                }
                if self.progress_percent != 0.0 {
                    return Err(format!("idle with progress {}", self.progress_percent));
                }
            }
        }
        if self.session_yield < 0.0 || self.lifetime_yield < 0.0 {
            return Err("negative yield".into());
        }
        for (i, p) in self.pending_credits.iter().enumerate() {
            if self.was_credited(p.cycle_id) {
                return Err(format!("cycle {} both pending and credited", p.cycle_id));
            }
            if self.pending_credits[..i].iter().any(|q| q.cycle_id == p.cycle_id) {
                return Err(format!("cycle {} pending twice", p.cycle_id));
            }
        }
        Ok(())
    }
}
