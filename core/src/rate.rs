/// Accrual rate from active boost plans.
///
/// Rate = base × max(1, highest multiplier among plans that have not expired).
/// Only the single best plan counts; multipliers do not stack.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A purchased boost ("arbitrage plan") as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostPlan {
    pub multiplier: f64,
    pub expires_at: DateTime<Utc>,
}

impl BoostPlan {
    pub fn new(multiplier: f64, expires_at: DateTime<Utc>) -> Self {
        Self { multiplier, expires_at }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Coins per hour for `plans` at `now`.
pub fn compute_rate(base_rate_per_hour: f64, plans: &[BoostPlan], now: DateTime<Utc>) -> f64 {
    let best = plans
        .iter()
        .filter(|p| p.is_active(now) && p.multiplier.is_finite())
        .map(|p| p.multiplier)
        .fold(1.0_f64, f64::max);
    base_rate_per_hour * best
}

#[derive(Debug, Clone, Copy)]
pub struct RateCalculator {
    base_rate_per_hour: f64,
}

impl RateCalculator {
    pub fn new(base_rate_per_hour: f64) -> Self {
        Self { base_rate_per_hour }
    }

    pub fn compute_rate(&self, plans: &[BoostPlan], now: DateTime<Utc>) -> f64 {
        compute_rate(self.base_rate_per_hour, plans, now)
    }
}
