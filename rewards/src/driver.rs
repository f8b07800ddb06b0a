//! Per-user cycle driver.
//!
//! One task owns one `MiningEngine` and is the only writer of that user's
//! record. Callers talk to it through a [`CycleHandle`]. The task ticks the
//! engine on the cadence it asks for, and executes the engine's actions:
//! the local cache is written inline, while remote writes, credits, plan
//! lookups and notifications run as spawned tasks whose results come back
//! over an event channel. A slow Redis therefore never holds up a tick.

use chrono::{DateTime, Utc};
use minecycle_core::{
    Action, BoostPlan, Clock, CycleConfig, CycleError, CycleId, CycleSnapshot, MilestoneEvent,
    MilestoneKind, MiningEngine,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::metrics;
use crate::notify::Notifier;
use crate::plans::RateSource;
use crate::reconcile::Reconciler;
use crate::sink::{BalanceSink, CreditReceipt, SinkError};
use crate::store::{timed, CycleStore, StoreError};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("cycle driver is not running")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct DriverTimings {
    /// Bound on every remote store, sink and plan call.
    pub remote_timeout: Duration,
    /// Wait before re-trying a failed credit or remote write.
    pub retry_backoff: Duration,
    pub plan_refresh: Duration,
    /// An idle driver with nothing scheduled exits after this long.
    pub idle_linger: Duration,
}

impl Default for DriverTimings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(30),
            plan_refresh: Duration::from_secs(300),
            idle_linger: Duration::from_secs(600),
        }
    }
}

impl From<&Config> for DriverTimings {
    fn from(cfg: &Config) -> Self {
        Self {
            remote_timeout: cfg.remote_timeout(),
            retry_backoff: cfg.credit_retry(),
            plan_refresh: cfg.plan_refresh(),
            ..Self::default()
        }
    }
}

/// Everything a driver talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub config: CycleConfig,
    pub clock: Arc<dyn Clock>,
    pub local: Arc<dyn CycleStore>,
    pub remote: Arc<dyn CycleStore>,
    pub sink: Arc<dyn BalanceSink>,
    pub notifier: Arc<dyn Notifier>,
    pub plans: Arc<dyn RateSource>,
    pub timings: DriverTimings,
}

enum Command {
    Start(oneshot::Sender<Result<CycleSnapshot, CycleError>>),
    Stop(oneshot::Sender<CycleSnapshot>),
    ResetCooldown(oneshot::Sender<CycleSnapshot>),
    Snapshot(oneshot::Sender<CycleSnapshot>),
    Shutdown,
}

enum Event {
    RemoteWritten {
        generation: u64,
        result: Result<Option<DateTime<Utc>>, StoreError>,
    },
    Credited {
        cycle_id: CycleId,
        result: Result<CreditReceipt, SinkError>,
    },
    Plans(anyhow::Result<Vec<BoostPlan>>),
}

/// Cheap, cloneable access to one user's driver.
#[derive(Clone)]
pub struct CycleHandle {
    user_id: String,
    tx: mpsc::Sender<Command>,
}

impl CycleHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// True once the driver task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn start(&self) -> Result<CycleSnapshot, DriverError> {
        Ok(self.request(Command::Start).await??)
    }

    pub async fn stop(&self) -> Result<CycleSnapshot, DriverError> {
        self.request(Command::Stop).await
    }

    pub async fn reset_cooldown(&self) -> Result<CycleSnapshot, DriverError> {
        self.request(Command::ResetCooldown).await
    }

    pub async fn snapshot(&self) -> Result<CycleSnapshot, DriverError> {
        self.request(Command::Snapshot).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, DriverError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| DriverError::Closed)?;
        reply_rx.await.map_err(|_| DriverError::Closed)
    }
}

pub struct CycleDriver {
    user_id: String,
    deps: Collaborators,
    engine: MiningEngine,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    plans: Vec<BoostPlan>,
    plans_fetched_at: Option<Instant>,
    plans_in_flight: bool,

    /// Bumped on every local persist; a remote write only clears `remote_dirty`
    /// if it carried the latest generation.
    generation: u64,
    remote_dirty: bool,
    remote_in_flight: bool,
    remote_retry_at: Option<Instant>,

    credits_in_flight: HashSet<CycleId>,
    credit_retry_at: HashMap<CycleId, Instant>,
}

impl CycleDriver {
    /// Spawn a driver for `user_id`. The record is loaded inside the task;
    /// commands sent meanwhile queue up.
    pub fn spawn(user_id: impl Into<String>, deps: Collaborators) -> (CycleHandle, JoinHandle<()>) {
        let user_id = user_id.into();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = CycleHandle { user_id: user_id.clone(), tx };

        let task = tokio::spawn(async move {
            metrics::inc_active_drivers();
            let driver = CycleDriver::load(user_id, deps, rx).await;
            driver.run().await;
            metrics::dec_active_drivers();
        });

        (handle, task)
    }

    async fn load(user_id: String, deps: Collaborators, commands: mpsc::Receiver<Command>) -> Self {
        let reconciler = Reconciler::new(
            deps.local.clone(),
            deps.remote.clone(),
            deps.clock.clone(),
            deps.timings.remote_timeout,
        );
        let loaded = reconciler.load(&user_id).await;

        let plans = match tokio::time::timeout(deps.timings.remote_timeout, deps.plans.active_plans(&user_id)).await {
            Ok(Ok(plans)) => plans,
            Ok(Err(e)) => {
                tracing::warn!(user = %user_id, error = %e, "boost plans unavailable, using base rate");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(user = %user_id, "boost plan lookup timed out, using base rate");
                Vec::new()
            }
        };

        tracing::info!(
            user = %user_id,
            origin = ?loaded.origin,
            phase = ?loaded.state.phase,
            plans = plans.len(),
            "cycle driver started"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            engine: MiningEngine::new(deps.config, loaded.state),
            user_id,
            deps,
            commands,
            events_tx,
            events_rx,
            plans,
            plans_fetched_at: Some(Instant::now()),
            plans_in_flight: false,
            generation: 0,
            remote_dirty: !loaded.remote_synced,
            remote_in_flight: false,
            remote_retry_at: None,
            credits_in_flight: HashSet::new(),
            credit_retry_at: HashMap::new(),
        }
    }

    async fn run(mut self) {
        // Catch up first: a cycle that ended while nobody was watching
        // completes here, and any unacknowledged credits are re-sent.
        self.tick().await;

        loop {
            let (delay, idle) = match self.next_wake() {
                Some(d) => (d, false),
                None => (self.deps.timings.idle_linger, true),
            };

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = tokio::time::sleep(delay) => {
                    if idle && self.is_quiescent() {
                        tracing::debug!(user = %self.user_id, "idle cycle driver exiting");
                        break;
                    }
                    self.tick().await;
                }
            }
        }

        self.finish().await;
    }

    fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    fn next_wake(&self) -> Option<Duration> {
        let mut wake = self.engine.next_tick_in(self.now());
        if self.remote_dirty && !self.remote_in_flight {
            let retry = self
                .remote_retry_at
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            wake = Some(wake.map_or(retry, |w| w.min(retry)));
        }
        wake
    }

    fn is_quiescent(&self) -> bool {
        !self.remote_dirty
            && !self.remote_in_flight
            && self.credits_in_flight.is_empty()
            && self.engine.state().pending_credits.is_empty()
    }

    async fn tick(&mut self) {
        self.refresh_plans_if_stale();
        let actions = self.engine.tick(self.now(), &self.plans);
        self.execute(actions).await;
        self.flush_remote();
    }

    async fn handle_command(&mut self, cmd: Command) {
        self.refresh_plans_if_stale();
        let now = self.now();

        match cmd {
            Command::Snapshot(reply) => {
                let (snapshot, actions) = self.engine.get_snapshot(now, &self.plans);
                self.execute(actions).await;
                let _ = reply.send(snapshot);
            }
            Command::Start(reply) => {
                let mut actions = self.engine.tick(now, &self.plans);
                let result = match self.engine.start(now) {
                    Ok(started) => {
                        actions.extend(started);
                        Ok(())
                    }
                    Err(e) => {
                        let reason = match e {
                            CycleError::AlreadyMining => "already_mining",
                            CycleError::CooldownActive { .. } => "cooldown",
                        };
                        metrics::inc_start_rejected(reason);
                        tracing::debug!(user = %self.user_id, error = %e, "start rejected");
                        Err(e)
                    }
                };
                self.execute(actions).await;
                let _ = reply.send(result.map(|()| self.engine.snapshot(now, &self.plans)));
            }
            Command::Stop(reply) => {
                let mut actions = self.engine.tick(now, &self.plans);
                actions.extend(self.engine.stop(now));
                self.execute(actions).await;
                let _ = reply.send(self.engine.snapshot(now, &self.plans));
            }
            Command::ResetCooldown(reply) => {
                let mut actions = self.engine.tick(now, &self.plans);
                actions.extend(self.engine.reset_cooldown(now));
                self.execute(actions).await;
                let _ = reply.send(self.engine.snapshot(now, &self.plans));
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::RemoteWritten { generation, result } => {
                self.remote_in_flight = false;
                match result {
                    Ok(stamp) => {
                        if let Some(ts) = stamp {
                            self.engine.set_source_timestamp(ts);
                        }
                        self.remote_retry_at = None;
                        if generation == self.generation {
                            self.remote_dirty = false;
                        } else {
                            self.flush_remote();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(user = %self.user_id, error = %e, "remote cycle write failed, will retry");
                        metrics::inc_store_write_failures(self.deps.remote.name());
                        self.remote_retry_at = Some(Instant::now() + self.deps.timings.retry_backoff);
                    }
                }
            }
            Event::Credited { cycle_id, result } => {
                self.credits_in_flight.remove(&cycle_id);
                metrics::dec_credits_in_flight();
                match result {
                    Ok(receipt) => {
                        self.credit_retry_at.remove(&cycle_id);
                        metrics::inc_credits_confirmed();
                        if !receipt.applied {
                            tracing::debug!(user = %self.user_id, cycle = %cycle_id, "sink reported cycle already credited");
                        }
                        let actions = self.engine.confirm_credit(cycle_id, self.now());
                        self.execute(actions).await;
                    }
                    Err(e) => {
                        tracing::warn!(user = %self.user_id, cycle = %cycle_id, error = %e, "credit failed, will retry");
                        metrics::inc_credits_failed();
                        self.credit_retry_at
                            .insert(cycle_id, Instant::now() + self.deps.timings.retry_backoff);
                    }
                }
            }
            Event::Plans(result) => {
                self.plans_in_flight = false;
                self.plans_fetched_at = Some(Instant::now());
                match result {
                    Ok(plans) => self.plans = plans,
                    Err(e) => {
                        tracing::warn!(user = %self.user_id, error = %e, "boost plan refresh failed, keeping cached plans");
                    }
                }
            }
        }
    }

    /// Persist first so a pending credit is on disk before the sink sees it.
    async fn execute(&mut self, actions: Vec<Action>) {
        if actions.iter().any(|a| matches!(a, Action::Persist(_))) {
            self.persist().await;
        }
        for action in actions {
            match action {
                Action::Persist(_) => {}
                Action::Credit { user_id, cycle_id, amount } => self.credit(user_id, cycle_id, amount),
                Action::Notify(event) => self.notify(event),
            }
        }
    }

    async fn persist(&mut self) {
        let state = self.engine.state().clone();
        if let Err(e) = self.deps.local.write(&state).await {
            tracing::warn!(user = %self.user_id, error = %e, "local cycle cache write failed");
            metrics::inc_store_write_failures(self.deps.local.name());
        }
        self.generation += 1;
        self.remote_dirty = true;
        self.remote_retry_at = None;
        self.flush_remote();
    }

    fn flush_remote(&mut self) {
        if !self.remote_dirty || self.remote_in_flight {
            return;
        }
        if self.remote_retry_at.map_or(false, |at| Instant::now() < at) {
            return;
        }

        self.remote_in_flight = true;
        let state = self.engine.state().clone();
        let generation = self.generation;
        let remote = self.deps.remote.clone();
        let limit = self.deps.timings.remote_timeout;
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let result = timed(limit, remote.write(&state)).await;
            let _ = events.send(Event::RemoteWritten { generation, result });
        });
    }

    fn credit(&mut self, user_id: String, cycle_id: CycleId, amount: f64) {
        if self.credits_in_flight.contains(&cycle_id) {
            return;
        }
        if self.credit_retry_at.get(&cycle_id).map_or(false, |at| Instant::now() < *at) {
            return;
        }

        self.credits_in_flight.insert(cycle_id);
        metrics::inc_credits_in_flight();
        let sink = self.deps.sink.clone();
        let limit = self.deps.timings.remote_timeout;
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, sink.credit(&user_id, cycle_id, amount)).await {
                Ok(res) => res,
                Err(_) => Err(SinkError::Timeout),
            };
            let _ = events.send(Event::Credited { cycle_id, result });
        });
    }

    fn notify(&self, event: MilestoneEvent) {
        match event.kind {
            MilestoneKind::CycleStarted { .. } => metrics::inc_cycles_started(),
            MilestoneKind::CycleCompleted { .. } => metrics::inc_cycles_completed(),
            MilestoneKind::CycleStopped { .. } => metrics::inc_cycles_stopped(),
            MilestoneKind::CooldownReset => metrics::inc_cooldown_resets(),
            _ => {}
        }

        let notifier = self.deps.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.on_milestone(&event).await {
                tracing::warn!(user = %event.user_id, error = %e, "milestone notification failed");
                metrics::inc_notify_failures();
            }
        });
    }

    fn refresh_plans_if_stale(&mut self) {
        if self.plans_in_flight {
            return;
        }
        let refresh = self.deps.timings.plan_refresh;
        if self.plans_fetched_at.map_or(false, |at| at.elapsed() < refresh) {
            return;
        }

        self.plans_in_flight = true;
        let source = self.deps.plans.clone();
        let user_id = self.user_id.clone();
        let limit = self.deps.timings.remote_timeout;
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, source.active_plans(&user_id)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!("boost plan lookup timed out")),
            };
            let _ = events.send(Event::Plans(result));
        });
    }

    /// Last chance to land an unsynced record before the task ends.
    async fn finish(&mut self) {
        // Let an in-flight write land first so it cannot overwrite ours.
        let deadline = Instant::now() + self.deps.timings.remote_timeout;
        while self.remote_in_flight {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                _ => break,
            }
        }

        if self.remote_dirty {
            let state = self.engine.state().clone();
            if let Err(e) = timed(self.deps.timings.remote_timeout, self.deps.remote.write(&state)).await {
                tracing::warn!(user = %self.user_id, error = %e, "remote cycle record left stale at shutdown");
                metrics::inc_store_write_failures(self.deps.remote.name());
            }
        }
        for _ in &self.credits_in_flight {
            metrics::dec_credits_in_flight();
        }
        tracing::info!(user = %self.user_id, "cycle driver stopped");
    }
}
