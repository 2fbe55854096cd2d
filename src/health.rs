//! Periodic relay liveness sweep.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::connection::{ConnectionManager, RelayStatus};
use crate::scheduler::{Scheduler, TaskHandle};

/// Reconnects relays that are not connected on a fixed interval.
pub struct HealthManager {
    connections: Arc<ConnectionManager>,
    interval: Duration,
    scheduler: Scheduler,
    ticker: Mutex<Option<TaskHandle>>,
}

impl HealthManager {
    /// Create a manager. Nothing runs until [`HealthManager::start`].
    pub fn new(config: &HealthConfig, connections: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            connections,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            scheduler: Scheduler::new(),
            ticker: Mutex::new(None),
        })
    }

    /// Start the sweep. Calling it twice keeps the existing timer.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = self.scheduler.every("health-check", self.interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    manager.run_health_check().await;
                }
            }
        });
        *ticker = Some(handle);
        info!("Health checks every {:?}", self.interval);
    }

    /// Reconnect every known relay that is not connected or connecting.
    /// Returns how many came back.
    pub async fn run_health_check(&self) -> usize {
        if !self.connections.is_online() {
            debug!("Offline, skipping health check");
            return 0;
        }

        let stale: Vec<String> = self
            .connections
            .relay_records()
            .into_iter()
            .filter(|r| !matches!(r.status, RelayStatus::Connected | RelayStatus::Connecting))
            .map(|r| r.url)
            .collect();

        if stale.is_empty() {
            debug!("Health check: all relays connected");
            return 0;
        }

        let recovered = self.connections.connect_to_relays(&stale).await;
        info!(
            "Health check: {}/{} disconnected relays recovered",
            recovered,
            stale.len()
        );
        recovered
    }

    /// Whether the sweep timer is running.
    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the sweep.
    pub fn cleanup(&self) {
        self.ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.scheduler.shutdown();
    }
}
