// Mining cycle service
//
// HTTP API over per-user cycle drivers. Redis holds the authoritative cycle
// records, balances, boost plans and notification lists; the local cache
// directory keeps a copy of every record for offline fallback.

use anyhow::Context;
use minecycle_core::{Clock, SystemClock};
use minecycle_rewards::api::{self, ApiState};
use minecycle_rewards::config::Config;
use minecycle_rewards::notify::{LogNotifier, Notifier, RedisNotifier};
use minecycle_rewards::plans::{RateSource, RedisPlanSource, StaticPlanSource};
use minecycle_rewards::sink::{BalanceSink, MemoryBalanceSink, RedisBalanceSink};
use minecycle_rewards::storage::RedisStorage;
use minecycle_rewards::store::{CycleStore, FileCycleStore, MemoryCycleStore, RedisCycleStore};
use minecycle_rewards::{Collaborators, CycleService, DriverTimings};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cfg = Config::load();
    cfg.cycle.validate().context("invalid cycle configuration")?;

    tracing::info!(
        base_rate = cfg.cycle.base_rate_per_hour,
        cycle_hours = cfg.cycle.cycle_duration_hours,
        cooldown_hours = cfg.cycle.cooldown_duration_hours,
        "mining cycle service starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let local: Arc<dyn CycleStore> = Arc::new(FileCycleStore::new(cfg.cache_dir.clone()));

    let storage = if cfg.redis_url.is_empty() {
        tracing::warn!("no redis url configured, running with in-memory remote store and sink");
        None
    } else {
        let storage = Arc::new(RedisStorage::new(&cfg.redis_url).context("invalid redis url")?);
        if let Err(e) = storage.ping().await {
            // Drivers fall back to the local cache until Redis comes back.
            tracing::warn!(error = %e, "redis not reachable at startup");
        }
        Some(storage)
    };

    let remote: Arc<dyn CycleStore> = match &storage {
        Some(s) => Arc::new(RedisCycleStore::new(s.clone())),
        None => Arc::new(MemoryCycleStore::stamped("remote", clock.clone())),
    };
    let sink: Arc<dyn BalanceSink> = match &storage {
        Some(s) => Arc::new(RedisBalanceSink::new(s.clone())),
        None => Arc::new(MemoryBalanceSink::new()),
    };
    let notifier: Arc<dyn Notifier> = match &storage {
        Some(s) => Arc::new(RedisNotifier::new(s.clone())),
        None => Arc::new(LogNotifier),
    };
    let plans: Arc<dyn RateSource> = match &storage {
        Some(s) => Arc::new(RedisPlanSource::new(s.clone())),
        None => Arc::new(StaticPlanSource::new()),
    };

    let service = Arc::new(CycleService::new(Collaborators {
        config: cfg.cycle,
        clock,
        local,
        remote,
        sink,
        notifier,
        plans,
        timings: DriverTimings::from(&cfg),
    }));

    let app = api::router(ApiState {
        service: service.clone(),
        storage,
        admin_token: cfg.admin_token.as_deref().map(Arc::from),
    });
    if cfg.admin_token.is_none() {
        tracing::warn!("MINECYCLE_ADMIN_TOKEN not set, admin routes are open");
    }

    let listener = tokio::net::TcpListener::bind(&cfg.api_listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.api_listen))?;
    tracing::info!("cycle API listening on {}", cfg.api_listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    service.shutdown_all().await;
    tracing::info!("mining cycle service shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}
