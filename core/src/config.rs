use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global cycle policy. Durations are not stored per record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Coins per hour before boost multipliers.
    #[serde(default = "default_base_rate")]
    pub base_rate_per_hour: f64,
    /// Length of one mining cycle.
    #[serde(default = "default_cycle_hours")]
    pub cycle_duration_hours: f64,
    /// Mandatory wait after a completed cycle.
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_duration_hours: f64,
    /// Progress notifications fire every `milestone_step_percent` (0 disables).
    #[serde(default = "default_milestone_step")]
    pub milestone_step_percent: u8,
    /// Tick cadence while mining.
    #[serde(default = "default_tick_secs")]
    pub tick_interval_secs: u64,
    /// Tick cadence while a cooldown countdown is running.
    #[serde(default = "default_cooldown_tick_secs")]
    pub cooldown_tick_secs: u64,
}

fn default_base_rate() -> f64 { 2.0 }
fn default_cycle_hours() -> f64 { 24.0 }
fn default_cooldown_hours() -> f64 { 24.0 }
fn default_milestone_step() -> u8 { 25 }
fn default_tick_secs() -> u64 { 60 }
fn default_cooldown_tick_secs() -> u64 { 1 }

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            base_rate_per_hour: default_base_rate(),
            cycle_duration_hours: default_cycle_hours(),
            cooldown_duration_hours: default_cooldown_hours(),
            milestone_step_percent: default_milestone_step(),
            tick_interval_secs: default_tick_secs(),
            cooldown_tick_secs: default_cooldown_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be a finite positive number, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("milestone_step_percent must be below 100, got {0}")]
    MilestoneStep(u8),
    #[error("{0} must be at least 1 second")]
    ZeroInterval(&'static str),
}

impl CycleConfig {
    /// Optional env overrides:
    /// - MINECYCLE_BASE_RATE
    /// - MINECYCLE_CYCLE_HOURS
    /// - MINECYCLE_COOLDOWN_HOURS
    /// - MINECYCLE_MILESTONE_STEP
    /// - MINECYCLE_TICK_SECS
    /// - MINECYCLE_COOLDOWN_TICK_SECS
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env_or_default() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Override fields from whichever of the variables above are set.
    pub fn apply_env(&mut self) {
        let cfg = self;

        if let Some(n) = env_f64("MINECYCLE_BASE_RATE") {
            cfg.base_rate_per_hour = n;
        }
        if let Some(n) = env_f64("MINECYCLE_CYCLE_HOURS") {
            cfg.cycle_duration_hours = n;
        }
        if let Some(n) = env_f64("MINECYCLE_COOLDOWN_HOURS") {
            cfg.cooldown_duration_hours = n;
        }
        if let Ok(v) = std::env::var("MINECYCLE_MILESTONE_STEP") {
            if let Ok(n) = v.parse::<u8>() {
                cfg.milestone_step_percent = n;
            }
        }
        if let Ok(v) = std::env::var("MINECYCLE_TICK_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.tick_interval_secs = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("MINECYCLE_COOLDOWN_TICK_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.cooldown_tick_secs = n.max(1);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("base_rate_per_hour", self.base_rate_per_hour)?;
        check_positive("cycle_duration_hours", self.cycle_duration_hours)?;
        check_positive("cooldown_duration_hours", self.cooldown_duration_hours)?;
        if self.milestone_step_percent >= 100 {
            return Err(ConfigError::MilestoneStep(self.milestone_step_percent));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("tick_interval_secs"));
        }
        if self.cooldown_tick_secs == 0 {
            return Err(ConfigError::ZeroInterval("cooldown_tick_secs"));
        }
        Ok(())
    }

    pub fn cycle_duration(&self) -> Duration {
        hours_to_duration(self.cycle_duration_hours)
    }

    pub fn cooldown_duration(&self) -> Duration {
        hours_to_duration(self.cooldown_duration_hours)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn cooldown_tick(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cooldown_tick_secs.max(1))
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|n| n.is_finite() && *n > 0.0)
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

/// Millisecond resolution is plenty for hour-scale policy.
fn hours_to_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}
