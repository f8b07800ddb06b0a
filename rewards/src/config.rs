use minecycle_core::CycleConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default = "default_api_listen")]
    pub api_listen: String,
    /// Remote store, sink, notifier and plan source. Empty runs fully
    /// in-memory (development only).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Local cycle cache directory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// Minimum wait between credit attempts for the same cycle after a failure.
    #[serde(default = "default_credit_retry_secs")]
    pub credit_retry_secs: u64,
    /// How often cached boost plans are refreshed per user.
    #[serde(default = "default_plan_refresh_secs")]
    pub plan_refresh_secs: u64,
    /// Bearer token for the admin routes. Unset leaves them open.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_api_listen() -> String { "0.0.0.0:8090".to_string() }
fn default_redis_url() -> String { "redis://127.0.0.1/".to_string() }
fn default_cache_dir() -> PathBuf { PathBuf::from("data/cycles") }
fn default_remote_timeout_ms() -> u64 { 5000 }
fn default_credit_retry_secs() -> u64 { 30 }
fn default_plan_refresh_secs() -> u64 { 300 }

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            api_listen: default_api_listen(),
            redis_url: default_redis_url(),
            cache_dir: default_cache_dir(),
            remote_timeout_ms: default_remote_timeout_ms(),
            credit_retry_secs: default_credit_retry_secs(),
            plan_refresh_secs: default_plan_refresh_secs(),
            admin_token: None,
        }
    }
}

impl Config {
    /// Defaults, then the JSON file (`MINECYCLE_CONFIG` or `minecycle.json`),
    /// then environment overrides.
    pub fn load() -> Self {
        let path = std::env::var("MINECYCLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("minecycle.json"));
        let mut cfg = Self::from_file(&path).unwrap_or_default();
        cfg.apply_env();
        cfg.sanitize();
        cfg
    }

    /// `None` when the file is missing or unreadable.
    pub fn from_file(path: &Path) -> Option<Self> {
        let txt = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Config>(&txt) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Some(cfg)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
                None
            }
        }
    }

    fn apply_env(&mut self) {
        self.cycle.apply_env();

        if let Ok(l) = std::env::var("MINECYCLE_API_LISTEN") { self.api_listen = l; }
        if let Ok(r) = std::env::var("MINECYCLE_REDIS_URL") {
            self.redis_url = r;
        } else if let Ok(r) = std::env::var("REDIS_URL") {
            self.redis_url = r;
        }
        if let Ok(d) = std::env::var("MINECYCLE_CACHE_DIR") { self.cache_dir = PathBuf::from(d); }
        if let Ok(t) = std::env::var("MINECYCLE_REMOTE_TIMEOUT_MS") {
            self.remote_timeout_ms = t.parse().unwrap_or(default_remote_timeout_ms());
        }
        if let Ok(t) = std::env::var("MINECYCLE_CREDIT_RETRY_SECS") {
            self.credit_retry_secs = t.parse().unwrap_or(default_credit_retry_secs());
        }
        if let Ok(t) = std::env::var("MINECYCLE_PLAN_REFRESH_SECS") {
            self.plan_refresh_secs = t.parse().unwrap_or(default_plan_refresh_secs());
        }
        if let Ok(t) = std::env::var("MINECYCLE_ADMIN_TOKEN") {
            self.admin_token = Some(t);
        }
    }

    /// Replace zero or invalid values with defaults.
    pub fn sanitize(&mut self) {
        if self.cycle.validate().is_err() {
            let fallback = CycleConfig::default();
            if !(self.cycle.base_rate_per_hour.is_finite() && self.cycle.base_rate_per_hour > 0.0) {
                self.cycle.base_rate_per_hour = fallback.base_rate_per_hour;
            }
            if !(self.cycle.cycle_duration_hours.is_finite() && self.cycle.cycle_duration_hours > 0.0) {
                self.cycle.cycle_duration_hours = fallback.cycle_duration_hours;
            }
            if !(self.cycle.cooldown_duration_hours.is_finite() && self.cycle.cooldown_duration_hours > 0.0) {
                self.cycle.cooldown_duration_hours = fallback.cooldown_duration_hours;
            }
            if self.cycle.milestone_step_percent >= 100 {
                self.cycle.milestone_step_percent = fallback.milestone_step_percent;
            }
            if self.cycle.tick_interval_secs == 0 {
                self.cycle.tick_interval_secs = fallback.tick_interval_secs;
            }
            if self.cycle.cooldown_tick_secs == 0 {
                self.cycle.cooldown_tick_secs = fallback.cooldown_tick_secs;
            }
        }
        if self.remote_timeout_ms == 0 {
            self.remote_timeout_ms = default_remote_timeout_ms();
        }
        if self.credit_retry_secs == 0 {
            self.credit_retry_secs = default_credit_retry_secs();
        }
        if self.plan_refresh_secs == 0 {
            self.plan_refresh_secs = default_plan_refresh_secs();
        }
        if self.admin_token.as_deref().map_or(false, |t| t.trim().is_empty()) {
            self.admin_token = None;
        }
    }

    pub fn remote_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn credit_retry(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.credit_retry_secs)
    }

    pub fn plan_refresh(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.plan_refresh_secs)
    }
}
