//! Relay connection management.
//!
//! Owns one [`RelayRecord`] per normalized relay URL and the open socket for
//! each connected relay. Every connect outcome is fed to the circuit breaker
//! and the performance tracker. Unexpected closes trigger reconnects with
//! exponential backoff through the manager's [`Scheduler`], so
//! [`ConnectionManager::cleanup`] cancels all of them at once.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::SharedClock;
use crate::config::ConnectionConfig;
use crate::metrics::{MetricsService, Timer};
use crate::performance::PerformanceTracker;
use crate::persistence::{keys, load_json, save_json, Store};
use crate::relay_url::normalize_relay_url;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::transport::{Socket, Transport};

/// Connection status of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    /// A connection attempt is in flight.
    Connecting,
    /// Socket open.
    Connected,
    /// Not connected; may be retried.
    Disconnected,
    /// Reconnect attempts exhausted.
    Failed,
}

/// Read/write usage of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMode {
    /// Read from the relay.
    pub read: bool,
    /// Publish to the relay.
    pub write: bool,
}

impl RelayMode {
    /// Read and write.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
    /// Read only.
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    /// Write only.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
}

impl Default for RelayMode {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// State of one known relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Normalized relay URL.
    pub url: String,
    /// Read from the relay.
    pub read: bool,
    /// Publish to the relay.
    pub write: bool,
    /// Connection status.
    pub status: RelayStatus,
    /// Performance score (0-100), 0 until observed.
    pub score: f64,
    /// Consecutive failed connection attempts.
    pub failure_count: u32,
}

impl RelayRecord {
    fn new(url: String, mode: RelayMode) -> Self {
        Self {
            url,
            read: mode.read,
            write: mode.write,
            status: RelayStatus::Disconnected,
            score: 0.0,
            failure_count: 0,
        }
    }
}

/// Relays connected at a point in time, persisted for fast restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Connected relay URLs.
    pub urls: Vec<String>,
    /// When the snapshot was taken (ms since epoch).
    pub timestamp: u64,
}

/// Feed one request outcome to both the circuit breaker and the tracker.
///
/// `latency_ms` is `Some` on success.
pub fn record_outcome(
    breakers: &CircuitBreakerRegistry,
    tracker: &PerformanceTracker,
    url: &str,
    latency_ms: Option<u64>,
) {
    match latency_ms {
        Some(ms) => {
            breakers.record_success(url);
            tracker.record_success(url, ms);
        }
        None => {
            breakers.record_failure(url);
            tracker.record_failure(url);
        }
    }
}

/// Opens, monitors and reconnects relay sockets.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    tracker: Arc<PerformanceTracker>,
    store: Arc<dyn Store>,
    clock: SharedClock,
    metrics: Arc<MetricsService>,
    scheduler: Scheduler,
    records: RwLock<HashMap<String, RelayRecord>>,
    sockets: RwLock<HashMap<String, Arc<dyn Socket>>>,
    reconnects: Mutex<HashMap<String, TaskHandle>>,
    online: AtomicBool,
    closed: AtomicBool,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager. It starts online with no relays.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        breakers: Arc<CircuitBreakerRegistry>,
        tracker: Arc<PerformanceTracker>,
        store: Arc<dyn Store>,
        clock: SharedClock,
        metrics: Arc<MetricsService>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            transport,
            breakers,
            tracker,
            store,
            clock,
            metrics,
            scheduler: Scheduler::new(),
            records: RwLock::new(HashMap::new()),
            sockets: RwLock::new(HashMap::new()),
            reconnects: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Whether the host reported connectivity.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Ensure a record exists for `url` with the given mode. Adding an
    /// existing relay only updates its mode. Returns the normalized URL.
    pub fn register_relay(&self, url: &str, mode: RelayMode) -> Option<String> {
        let url = match normalize_relay_url(url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Rejecting relay {}: {}", url, e);
                return None;
            }
        };

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(url.clone())
            .and_modify(|r| {
                r.read = mode.read;
                r.write = mode.write;
            })
            .or_insert_with(|| RelayRecord::new(url.clone(), mode));
        Some(url)
    }

    /// Open a socket to `url`. Returns true once it is open within the
    /// connect timeout.
    ///
    /// `retry_count` is the number of reconnect attempts already made for the
    /// current outage; a failed reconnect schedules the next one.
    pub async fn connect_to_relay(&self, url: &str, retry_count: u32) -> bool {
        let Ok(url) = normalize_relay_url(url) else {
            warn!("Invalid relay URL: {}", url);
            return false;
        };

        if self.is_closed() {
            debug!("Connection manager closed, not dialling {}", url);
            return false;
        }

        self.ensure_record(&url);

        if !self.is_online() {
            debug!("Offline, not dialling {}", url);
            self.set_status(&url, RelayStatus::Disconnected);
            return false;
        }

        if let Some(socket) = self.socket(&url) {
            if socket.is_open() {
                self.set_status(&url, RelayStatus::Connected);
                return true;
            }
        }

        if !self.breakers.can_request(&url) {
            debug!("Circuit open for {}, skipping connect", url);
            self.set_status(&url, RelayStatus::Disconnected);
            if retry_count > 0 {
                self.schedule_reconnect(&url, retry_count);
            }
            return false;
        }

        self.set_status(&url, RelayStatus::Connecting);
        let timer = Timer::start();

        let result = timeout(self.config.connect_timeout(), self.transport.connect(&url)).await;

        match result {
            // cleanup() ran while the dial was in flight.
            Ok(Ok(socket)) if self.is_closed() => {
                debug!("Discarding connection to {} opened after cleanup", url);
                socket.close().await;
                self.set_status(&url, RelayStatus::Disconnected);
                false
            }
            Ok(Ok(socket)) => {
                let latency = timer.elapsed_ms();
                record_outcome(&self.breakers, &self.tracker, &url, Some(latency));
                self.metrics
                    .relay_connect(&url, true, timer.elapsed_secs());
                self.on_connected(&url, socket);
                info!("Connected to relay {} in {}ms", url, latency);
                true
            }
            Ok(Err(e)) => {
                debug!("Connection to {} failed: {}", url, e);
                self.on_connect_failed(&url, retry_count);
                false
            }
            Err(_) => {
                debug!(
                    "Connection to {} timed out after {:?}",
                    url,
                    self.config.connect_timeout()
                );
                self.on_connect_failed(&url, retry_count);
                false
            }
        }
    }

    /// Connect to several relays concurrently. Returns how many succeeded.
    pub async fn connect_to_relays(&self, urls: &[String]) -> usize {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = urls.iter().filter(|u| seen.insert(u.as_str())).collect();
        if unique.is_empty() {
            return 0;
        }

        let timer = Timer::start();
        let attempts = unique.iter().map(|url| self.connect_to_relay(url, 0));
        let results = futures::future::join_all(attempts).await;
        let connected = results.into_iter().filter(|ok| *ok).count();

        info!(
            "Connected to {}/{} relays in {:.2}s",
            connected,
            unique.len(),
            timer.elapsed_secs()
        );
        connected
    }

    /// Push a connectivity change from the host.
    ///
    /// Going offline marks every relay Disconnected without closing sockets
    /// and cancels pending reconnects. Coming online resumes relays whose
    /// socket is still open and re-dials every other relay with fewer than
    /// `online_failure_limit` consecutive failures. Returns relays connected.
    pub async fn set_connectivity(&self, online: bool) -> usize {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return self.connected_urls().len();
        }

        if !online {
            info!("Connectivity lost, suspending relay connections");
            self.cancel_reconnects();
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            for record in records.values_mut() {
                record.status = RelayStatus::Disconnected;
            }
            drop(records);
            self.metrics.relays_connected(0);
            return 0;
        }

        info!("Connectivity restored, resuming relay connections");
        let candidates: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.failure_count < self.config.online_failure_limit)
            .map(|r| r.url.clone())
            .collect();

        let connected = self.connect_to_relays(&candidates).await;
        self.save_snapshot();
        connected
    }

    /// Reconnect to the relays of the last-connected snapshot if it is
    /// younger than the restore window. Returns relays connected.
    pub async fn restore_connections(&self) -> usize {
        let Some(snapshot) = load_json::<ConnectionSnapshot>(&*self.store, keys::LAST_CONNECTED)
        else {
            debug!("No connection snapshot to restore");
            return 0;
        };

        let age = self.clock.now_ms().saturating_sub(snapshot.timestamp);
        if age > self.config.restore_window_ms {
            debug!("Connection snapshot is {}ms old, not restoring", age);
            return 0;
        }

        info!(
            "Restoring {} connections from snapshot ({}ms old)",
            snapshot.urls.len(),
            age
        );
        self.connect_to_relays(&snapshot.urls).await
    }

    /// Close the connection to `url` and cancel its reconnects.
    pub async fn disconnect_relay(&self, url: &str) {
        let Ok(url) = normalize_relay_url(url) else {
            return;
        };
        self.cancel_reconnect(&url);

        let socket = self
            .sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&url);
        if let Some(socket) = socket {
            socket.close().await;
        }

        self.set_status(&url, RelayStatus::Disconnected);
        self.save_snapshot();
    }

    /// Disconnect and forget `url`.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let Ok(normalized) = normalize_relay_url(url) else {
            return false;
        };
        self.disconnect_relay(&normalized).await;
        let removed = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalized)
            .is_some();
        if removed {
            info!("Removed relay {}", normalized);
        }
        removed
    }

    /// All relay records, sorted by URL, with current scores.
    pub fn relay_records(&self) -> Vec<RelayRecord> {
        let mut records: Vec<RelayRecord> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for record in &mut records {
            if let Some(perf) = self.tracker.get_relay_performance(&record.url) {
                record.score = perf.score;
            }
        }
        records.sort_by(|a, b| a.url.cmp(&b.url));
        records
    }

    /// Record for `url`, if known.
    pub fn relay_record(&self, url: &str) -> Option<RelayRecord> {
        let url = normalize_relay_url(url).ok()?;
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&url)
            .cloned()
    }

    /// URLs of connected relays, sorted and unique.
    pub fn connected_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.status == RelayStatus::Connected)
            .map(|r| r.url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Whether `url` is connected.
    pub fn is_connected(&self, url: &str) -> bool {
        self.relay_record(url)
            .map(|r| r.status == RelayStatus::Connected)
            .unwrap_or(false)
    }

    /// Open socket for `url`, if any.
    pub fn socket(&self, url: &str) -> Option<Arc<dyn Socket>> {
        self.sockets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// Pending reconnect timers.
    pub fn pending_reconnects(&self) -> usize {
        let mut reconnects = self.reconnects.lock().unwrap_or_else(|e| e.into_inner());
        reconnects.retain(|_, handle| !handle.is_finished());
        reconnects.len()
    }

    /// Close every socket and cancel every timer.
    ///
    /// The manager stays closed afterwards: dials still in flight discard
    /// their socket and no further connects or reconnects are made.
    pub async fn cleanup(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.scheduler.shutdown();
        self.reconnects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let sockets: Vec<Arc<dyn Socket>> = self
            .sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        let closed = sockets.len();
        for socket in sockets {
            socket.close().await;
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        for record in records.values_mut() {
            record.status = RelayStatus::Disconnected;
        }
        drop(records);

        self.metrics.relays_connected(0);
        info!(
            "Connection manager cleaned up: {} sockets closed, {} tasks cancelled",
            closed, cancelled
        );
    }

    // ========== Internal Methods ==========

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_record(&self, url: &str) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(url.to_string())
            .or_insert_with(|| RelayRecord::new(url.to_string(), RelayMode::default()));
    }

    fn set_status(&self, url: &str, status: RelayStatus) {
        if let Some(record) = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(url)
        {
            record.status = status;
        }
    }

    fn on_connected(&self, url: &str, socket: Arc<dyn Socket>) {
        self.cancel_reconnect(url);

        if let Some(record) = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(url)
        {
            record.status = RelayStatus::Connected;
            record.failure_count = 0;
        }

        self.sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), socket.clone());

        let weak = self.weak_self.clone();
        let relay = url.to_string();
        self.scheduler
            .spawn(&format!("monitor:{}", url), async move {
                socket.closed().await;
                if let Some(manager) = weak.upgrade() {
                    manager.on_socket_closed(&relay, &socket);
                }
            });

        self.metrics.relays_connected(self.connected_urls().len());
        self.save_snapshot();
    }

    fn on_connect_failed(&self, url: &str, retry_count: u32) {
        record_outcome(&self.breakers, &self.tracker, url, None);
        self.metrics.relay_connect(url, false, 0.0);

        if let Some(record) = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(url)
        {
            record.failure_count = record.failure_count.saturating_add(1);
            record.status = RelayStatus::Disconnected;
        }

        if retry_count > 0 {
            self.schedule_reconnect(url, retry_count);
        }
    }

    fn on_socket_closed(&self, url: &str, socket: &Arc<dyn Socket>) {
        let current = {
            let mut sockets = self.sockets.write().unwrap_or_else(|e| e.into_inner());
            let is_current = sockets
                .get(url)
                .map(|s| std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(socket)))
                .unwrap_or(false);
            if is_current {
                sockets.remove(url);
            }
            is_current
        };

        // Closed on purpose or already replaced.
        if !current {
            return;
        }

        warn!("Connection to {} closed unexpectedly", url);
        self.set_status(url, RelayStatus::Disconnected);
        self.metrics.relays_connected(self.connected_urls().len());
        self.save_snapshot();

        if self.is_online() {
            self.schedule_reconnect(url, 0);
        }
    }

    fn schedule_reconnect(&self, url: &str, retry_count: u32) {
        if self.is_closed() {
            return;
        }
        if retry_count >= self.config.max_retries {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                url, retry_count
            );
            self.set_status(url, RelayStatus::Failed);
            return;
        }
        if !self.is_online() {
            return;
        }

        let delay = self.config.backoff_delay(retry_count);
        debug!(
            "Reconnecting to {} in {:?} (attempt {})",
            url,
            delay,
            retry_count + 1
        );

        let weak = self.weak_self.clone();
        let relay = url.to_string();
        let handle = self
            .scheduler
            .after(&format!("reconnect:{}", url), delay, async move {
                if let Some(manager) = weak.upgrade() {
                    manager.connect_to_relay(&relay, retry_count + 1).await;
                }
            });

        let previous = self
            .reconnects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), handle);
        // A reconnect task replacing itself must not cancel itself.
        if let Some(previous) = previous {
            if !previous.is_finished() && retry_count == 0 {
                previous.cancel();
            }
        }
    }

    fn cancel_reconnect(&self, url: &str) {
        let handle = self
            .reconnects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    fn cancel_reconnects(&self) {
        let handles: Vec<TaskHandle> = self
            .reconnects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            handle.cancel();
        }
    }

    fn save_snapshot(&self) {
        let snapshot = ConnectionSnapshot {
            urls: self.connected_urls(),
            timestamp: self.clock.now_ms(),
        };
        if let Err(e) = save_json(&*self.store, keys::LAST_CONNECTED, &snapshot) {
            warn!("Failed to save connection snapshot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::clock::ManualClock;
    use crate::persistence::MemoryStore;
    use crate::transport::MemoryTransport;
    use std::time::Duration;

    const A: &str = "wss://a.example.com";
    const B: &str = "wss://b.example.com";

    struct Fixture {
        clock: Arc<ManualClock>,
        transport: Arc<MemoryTransport>,
        breakers: Arc<CircuitBreakerRegistry>,
        tracker: Arc<PerformanceTracker>,
        store: Arc<MemoryStore>,
        manager: Arc<ConnectionManager>,
    }

    fn fixture_with(transport: MemoryTransport, store: Arc<MemoryStore>) -> Fixture {
        let (clock, shared) = ManualClock::shared(1_700_000_000_000);
        let transport = Arc::new(transport);
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            shared.clone(),
        ));
        let tracker = Arc::new(PerformanceTracker::new(shared.clone()));
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            transport.clone(),
            breakers.clone(),
            tracker.clone(),
            store.clone(),
            shared,
            Arc::new(MetricsService::disabled()),
        );
        Fixture {
            clock,
            transport,
            breakers,
            tracker,
            store,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            MemoryTransport::with_relays(&[A, B]),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_connect_success_feeds_breaker_and_tracker() {
        let f = fixture();

        assert!(f.manager.connect_to_relay(A, 0).await);

        assert!(f.manager.is_connected(A));
        assert_eq!(f.manager.connected_urls(), vec![A.to_string()]);
        assert!(f.tracker.get_relay_performance(A).is_some());
        assert_eq!(f.breakers.get_state(A), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let f = fixture();
        f.transport.set_reachable(A, false);

        assert!(!f.manager.connect_to_relay(A, 0).await);

        let record = f.manager.relay_record(A).unwrap();
        assert_eq!(record.status, RelayStatus::Disconnected);
        assert_eq!(record.failure_count, 1);
        assert!(f.tracker.get_relay_performance(A).unwrap().success_rate < 1.0);
        // Initial failures do not schedule reconnects.
        assert_eq!(f.manager.pending_reconnects(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_dialled() {
        let f = fixture();
        for _ in 0..3 {
            f.breakers.record_failure(A);
        }

        assert!(!f.manager.connect_to_relay(A, 0).await);
        assert_eq!(f.transport.connect_attempts(A), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let f = fixture();
        f.transport.set_latency(A, Duration::from_secs(10));

        assert!(!f.manager.connect_to_relay(A, 0).await);
        assert_eq!(f.manager.relay_record(A).unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_connect_to_relays_counts_successes_and_dedupes() {
        let f = fixture();
        f.transport.set_reachable(B, false);

        let urls = vec![A.to_string(), A.to_string(), B.to_string()];
        assert_eq!(f.manager.connect_to_relays(&urls).await, 1);
        assert_eq!(f.manager.relay_records().len(), 2);
    }

    #[test]
    fn test_register_relay_is_idempotent() {
        let f = fixture();
        f.manager.register_relay(A, RelayMode::READ_WRITE);
        f.manager.register_relay("wss://A.example.com/", RelayMode::READ);

        let records = f.manager.relay_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].read);
        assert!(!records[0].write);
        assert!(f.manager.register_relay("https://x", RelayMode::READ).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_with_backoff() {
        let f = fixture();
        assert!(f.manager.connect_to_relay(A, 0).await);

        f.transport.drop_connection(A);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!f.manager.is_connected(A));
        assert_eq!(f.manager.pending_reconnects(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(f.manager.is_connected(A));
        assert_eq!(f.transport.connect_attempts(A), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_give_up_after_max_retries() {
        let f = fixture();
        assert!(f.manager.connect_to_relay(A, 0).await);

        f.transport.set_reachable(A, false);
        // 1 + 2 + 4 + 8 + 16 + 32 seconds of backoff.
        tokio::time::sleep(Duration::from_secs(70)).await;

        let record = f.manager.relay_record(A).unwrap();
        assert_eq!(record.status, RelayStatus::Failed);
        // Initial connect plus six reconnect attempts; circuit-open attempts
        // are skipped without dialling.
        assert!(f.transport.connect_attempts(A) <= 7);
        assert_eq!(f.manager.pending_reconnects(), 0);
    }

    #[tokio::test]
    async fn test_offline_keeps_sockets_and_online_resumes() {
        let f = fixture();
        f.manager.connect_to_relays(&[A.to_string(), B.to_string()]).await;

        assert_eq!(f.manager.set_connectivity(false).await, 0);
        assert!(f.manager.connected_urls().is_empty());
        assert!(f.manager.socket(A).unwrap().is_open());
        assert!(!f.manager.connect_to_relay(A, 0).await);

        assert_eq!(f.manager.set_connectivity(true).await, 2);
        // Open sockets resume without a new dial.
        assert_eq!(f.transport.connect_attempts(A), 1);
    }

    #[tokio::test]
    async fn test_online_skips_relays_with_repeated_failures() {
        let f = fixture();
        f.transport.set_reachable(B, false);
        for _ in 0..3 {
            f.manager.connect_to_relay(B, 0).await;
        }
        f.breakers.reset(B);
        f.transport.set_reachable(B, true);
        f.manager.connect_to_relay(A, 0).await;

        f.manager.set_connectivity(false).await;
        f.manager.set_connectivity(true).await;

        assert!(f.manager.is_connected(A));
        assert!(!f.manager.is_connected(B));
    }

    #[tokio::test]
    async fn test_snapshot_restore_within_window() {
        let store = Arc::new(MemoryStore::new());
        let first = fixture_with(MemoryTransport::with_relays(&[A, B]), store.clone());
        first.manager.connect_to_relays(&[A.to_string(), B.to_string()]).await;

        let snapshot: ConnectionSnapshot =
            load_json(&*first.store, keys::LAST_CONNECTED).unwrap();
        assert_eq!(snapshot.urls, vec![A.to_string(), B.to_string()]);

        let second = fixture_with(MemoryTransport::with_relays(&[A, B]), store.clone());
        second.clock.set(snapshot.timestamp + 10_000);
        assert_eq!(second.manager.restore_connections().await, 2);

        let snapshot: ConnectionSnapshot = load_json(&*store, keys::LAST_CONNECTED).unwrap();
        let third = fixture_with(MemoryTransport::with_relays(&[A, B]), store);
        third.clock.set(snapshot.timestamp + 31_000);
        assert_eq!(third.manager.restore_connections().await, 0);
    }

    #[tokio::test]
    async fn test_restore_ignores_missing_or_corrupt_snapshot() {
        let f = fixture();
        assert_eq!(f.manager.restore_connections().await, 0);

        f.store.put(keys::LAST_CONNECTED, b"garbage").unwrap();
        assert_eq!(f.manager.restore_connections().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_trigger_reconnect() {
        let f = fixture();
        f.manager.connect_to_relay(A, 0).await;

        f.manager.disconnect_relay(A).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!f.manager.is_connected(A));
        assert_eq!(f.manager.pending_reconnects(), 0);
        assert!(f.manager.remove_relay(A).await);
        assert!(f.manager.relay_records().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_closes_everything() {
        let f = fixture();
        f.manager.connect_to_relays(&[A.to_string(), B.to_string()]).await;
        let socket = f.manager.socket(A).unwrap();

        f.manager.cleanup().await;

        assert!(!socket.is_open());
        assert!(f.manager.connected_urls().is_empty());
        assert_eq!(f.manager.pending_reconnects(), 0);
    }

    #[tokio::test]
    async fn test_dial_in_flight_during_cleanup_is_discarded() {
        let f = fixture();
        f.transport.set_latency(A, Duration::from_millis(200));

        let manager = f.manager.clone();
        let dial = tokio::spawn(async move { manager.connect_to_relay(A, 0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.manager.cleanup().await;
        assert!(!dial.await.unwrap());

        assert!(f.manager.connected_urls().is_empty());
        assert!(f.manager.socket(A).is_none());
        assert_ne!(f.manager.relay_record(A).unwrap().status, RelayStatus::Connected);
        assert_eq!(f.manager.pending_reconnects(), 0);

        // Closed managers stay closed.
        assert!(!f.manager.connect_to_relay(B, 0).await);
        assert_eq!(f.transport.connect_attempts(B), 0);
    }
}
