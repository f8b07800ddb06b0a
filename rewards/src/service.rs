/// Cycle service
///
/// Registry of per-user drivers:
/// - one driver (and so one engine) per user at a time
/// - drivers are spawned on first use and respawned after they exit
/// - a request that races a driver's idle exit is retried once on a fresh one

use minecycle_core::CycleSnapshot;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::driver::{Collaborators, CycleDriver, CycleHandle, DriverError};

struct DriverEntry {
    handle: CycleHandle,
    task: JoinHandle<()>,
}

impl DriverEntry {
    fn live(&self) -> Option<CycleHandle> {
        (!self.handle.is_closed()).then(|| self.handle.clone())
    }

    /// Ask the driver to stop and wait for its final flush.
    async fn stop(self) {
        self.handle.shutdown().await;
        if let Err(e) = self.task.await {
            tracing::warn!(user = %self.handle.user_id(), error = %e, "cycle driver task failed");
        }
    }
}

pub struct CycleService {
    deps: Collaborators,
    drivers: RwLock<HashMap<String, DriverEntry>>,
}

impl CycleService {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps, drivers: RwLock::new(HashMap::new()) }
    }

    /// Live handle for `user_id`, spawning a driver when needed.
    pub async fn handle(&self, user_id: &str) -> CycleHandle {
        {
            let drivers = self.drivers.read().await;
            if let Some(handle) = drivers.get(user_id).and_then(DriverEntry::live) {
                return handle;
            }
        }

        let mut drivers = self.drivers.write().await;
        if let Some(handle) = drivers.get(user_id).and_then(DriverEntry::live) {
            return handle;
        }
        let (handle, task) = CycleDriver::spawn(user_id, self.deps.clone());
        drivers.insert(user_id.to_string(), DriverEntry { handle: handle.clone(), task });
        handle
    }

    pub async fn start(&self, user_id: &str) -> Result<CycleSnapshot, DriverError> {
        match self.handle(user_id).await.start().await {
            Err(DriverError::Closed) => self.handle(user_id).await.start().await,
            other => other,
        }
    }

    pub async fn stop(&self, user_id: &str) -> Result<CycleSnapshot, DriverError> {
        match self.handle(user_id).await.stop().await {
            Err(DriverError::Closed) => self.handle(user_id).await.stop().await,
            other => other,
        }
    }

    pub async fn reset_cooldown(&self, user_id: &str) -> Result<CycleSnapshot, DriverError> {
        match self.handle(user_id).await.reset_cooldown().await {
            Err(DriverError::Closed) => self.handle(user_id).await.reset_cooldown().await,
            other => other,
        }
    }

    pub async fn snapshot(&self, user_id: &str) -> Result<CycleSnapshot, DriverError> {
        match self.handle(user_id).await.snapshot().await {
            Err(DriverError::Closed) => self.handle(user_id).await.snapshot().await,
            other => other,
        }
    }

    /// Stop the user's driver, e.g. when their session closes. A running
    /// cycle keeps its stored start time and completes on the next load.
    pub async fn release(&self, user_id: &str) {
        let entry = self.drivers.write().await.remove(user_id);
        if let Some(entry) = entry {
            entry.stop().await;
        }
    }

    /// Running drivers, after pruning exited ones.
    pub async fn active_count(&self) -> usize {
        let mut drivers = self.drivers.write().await;
        drivers.retain(|_, e| !e.handle.is_closed());
        drivers.len()
    }

    pub async fn shutdown_all(&self) {
        let entries: Vec<DriverEntry> = self.drivers.write().await.drain().map(|(_, e)| e).collect();
        tracing::info!(drivers = entries.len(), "stopping cycle drivers");
        for entry in entries {
            entry.stop().await;
        }
    }
}
