//! Relay client.
//!
//! [`RelayClient`] owns every component and wires them together:
//!
//! ```text
//!            ┌──────────────┐
//!            │ RelayClient  │
//!            └──────┬───────┘
//!     ┌─────────┬───┴──────┬──────────────┬─────────────┐
//!     ▼         ▼          ▼              ▼             ▼
//! Selector  Connection  HealthManager  ContentCache  Discoverer
//!     │      Manager
//!     ▼         ▼
//! CircuitBreakerRegistry + PerformanceTracker
//! ```
//!
//! The publish and fetch pipelines select relays, talk to them through the
//! [`Transport`], and feed every per-relay outcome back into the breaker and
//! tracker. Fetched data lands in the cache, which is also the fallback
//! when the network cannot answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::cache::{ContentCache, EventQuery, ProfileFetcher};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::clock::{SharedClock, SystemClock};
use crate::config::ClientConfig;
use crate::connection::{record_outcome, ConnectionManager, RelayMode, RelayRecord};
use crate::discovery::RelayDiscoverer;
use crate::error::Result;
use crate::event::{Event, Filter, Profile, KIND_METADATA, KIND_RELAY_LIST};
use crate::health::HealthManager;
use crate::metrics::{MetricsService, Timer};
use crate::performance::{PerformanceTracker, RelayInfo};
use crate::persistence::{keys, load_json, open_store, save_json, Store};
use crate::relay_url::{normalize_relay_url, normalize_relay_urls};
use crate::scheduler::Scheduler;
use crate::selector::{RelaySelector, RelaySets, SelectionParams};
use crate::transport::{SubscriptionEvent, Transport, WsTransport, WsTransportConfig};

/// Relays used per publish.
pub const PUBLISH_RELAY_COUNT: usize = 3;

/// Relays queried per fetch.
pub const FETCH_RELAY_COUNT: usize = 3;

/// Default window a fetch waits for results.
pub const DEFAULT_FETCH_WAIT: Duration = Duration::from_secs(3);

/// Interval between performance snapshots.
pub const PERFORMANCE_SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A relay the user added, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRelay {
    /// Normalized relay URL.
    pub url: String,
    /// Read from the relay.
    pub read: bool,
    /// Publish to the relay.
    pub write: bool,
}

impl UserRelay {
    fn mode(&self) -> RelayMode {
        RelayMode {
            read: self.read,
            write: self.write,
        }
    }
}

/// Entry point of the crate.
pub struct RelayClient {
    config: ClientConfig,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsService>,
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    tracker: Arc<PerformanceTracker>,
    selector: RelaySelector,
    discoverer: RelayDiscoverer,
    connections: Arc<ConnectionManager>,
    health: Arc<HealthManager>,
    cache: Arc<ContentCache>,
    default_relays: Vec<String>,
    user_relays: RwLock<Vec<UserRelay>>,
    scheduler: Scheduler,
    started: AtomicBool,
    weak_self: Weak<RelayClient>,
}

impl RelayClient {
    /// Build a client from its collaborators.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        clock: SharedClock,
        metrics: Arc<MetricsService>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let default_relays = normalize_relay_urls(&config.relays.default_relays);
        let breakers = Arc::new(CircuitBreakerRegistry::with_metrics(
            CircuitBreakerConfig::from(&config.circuit),
            clock.clone(),
            metrics.clone(),
        ));
        let tracker = Arc::new(PerformanceTracker::new(clock.clone()));
        let connections = ConnectionManager::new(
            config.connection.clone(),
            transport.clone(),
            breakers.clone(),
            tracker.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let health = HealthManager::new(&config.health, connections.clone());
        let cache = ContentCache::new(config.cache.clone(), store.clone(), clock, metrics.clone());

        Ok(Arc::new_cyclic(|weak| Self {
            selector: RelaySelector::new(breakers.clone(), tracker.clone(), default_relays.clone()),
            discoverer: RelayDiscoverer::with_transport(&default_relays, transport.clone()),
            config,
            store,
            metrics,
            transport,
            breakers,
            tracker,
            connections,
            health,
            cache,
            default_relays,
            user_relays: RwLock::new(Vec::new()),
            scheduler: Scheduler::new(),
            started: AtomicBool::new(false),
            weak_self: weak.clone(),
        }))
    }

    /// Build a client with the WebSocket transport, the configured store,
    /// the system clock and a Prometheus recorder unless `[metrics]` turns it
    /// off.
    pub fn from_config(config: ClientConfig) -> Result<Arc<Self>> {
        let store = open_store(&config.persistence)?;
        let transport = Arc::new(WsTransport::new(WsTransportConfig {
            connect_timeout: config.connection.connect_timeout(),
            ..Default::default()
        }));
        let metrics = Arc::new(MetricsService::from_config(config.metrics.clone()));
        Self::new(config, transport, store, SystemClock::shared(), metrics)
    }

    // ========== Lifecycle ==========

    /// Load persisted state, reconnect and start background timers.
    /// Returns the number of connected relays.
    pub async fn start(&self) -> usize {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.connections.connected_urls().len();
        }

        let metrics = self.tracker.load(&*self.store);
        let cached = self.cache.load_from_storage();
        let user = self.load_user_relays();
        info!(
            "Loaded {} relay metrics, {} cached entries, {} user relays",
            metrics, cached, user
        );

        for relay in self.user_relays_snapshot() {
            self.connections.register_relay(&relay.url, relay.mode());
        }

        let mut connected = self.connections.restore_connections().await;
        if connected == 0 {
            connected = self.connect_to_user_relays().await;
        }

        self.health.start();
        let fetcher: Arc<dyn ProfileFetcher> = Arc::new(ClientProfileFetcher {
            client: self.weak_self.clone(),
        });
        self.cache.start(Some(fetcher));

        let tracker = self.tracker.clone();
        let store = self.store.clone();
        self.scheduler
            .every("performance-save", PERFORMANCE_SAVE_INTERVAL, move || {
                let tracker = tracker.clone();
                let store = store.clone();
                async move {
                    if let Err(e) = tracker.save(&*store) {
                        warn!("Failed to save relay metrics: {}", e);
                    }
                }
            });

        info!("Relay client started with {} connected relays", connected);
        connected
    }

    /// Push a connectivity change from the host. Returns connected relays.
    pub async fn set_connectivity(&self, online: bool) -> usize {
        self.cache.set_connectivity(online);
        self.connections.set_connectivity(online).await
    }

    /// Whether the host reported connectivity.
    pub fn is_online(&self) -> bool {
        self.connections.is_online()
    }

    /// Persist state, stop every timer and close every socket.
    pub async fn shutdown(&self) {
        if let Err(e) = self.tracker.save(&*self.store) {
            warn!("Failed to save relay metrics: {}", e);
        }
        self.cache.persist_to_storage();

        self.scheduler.shutdown();
        self.health.cleanup();
        self.cache.shutdown();
        self.connections.cleanup().await;
        self.started.store(false, Ordering::SeqCst);
        info!("Relay client shut down");
    }

    // ========== Relay Management ==========

    /// Add a relay, reset its circuit and connect. Adding a relay that is
    /// already known only updates its mode. Returns whether it is connected.
    pub async fn add_relay(&self, url: &str, mode: RelayMode) -> bool {
        let Some(url) = self.connections.register_relay(url, mode) else {
            return false;
        };
        self.breakers.reset(&url);
        self.discoverer.add_candidates(&[url.as_str()]);
        self.remember_user_relay(&url, mode);
        self.connections.connect_to_relay(&url, 0).await
    }

    /// Add several read/write relays and connect to them concurrently.
    /// Returns how many connected.
    pub async fn add_multiple_relays(&self, urls: &[String]) -> usize {
        let mut added = Vec::new();
        for raw in urls {
            if let Some(url) = self.connections.register_relay(raw, RelayMode::READ_WRITE) {
                self.breakers.reset(&url);
                self.remember_user_relay(&url, RelayMode::READ_WRITE);
                added.push(url);
            }
        }
        self.discoverer.add_candidates(added.as_slice());
        self.connections.connect_to_relays(&added).await
    }

    /// Disconnect and forget a relay, resetting its circuit.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let Ok(url) = normalize_relay_url(url) else {
            return false;
        };
        let removed = self.connections.remove_relay(&url).await;
        self.breakers.reset(&url);

        let changed = {
            let mut relays = self.user_relays.write().unwrap_or_else(|e| e.into_inner());
            let before = relays.len();
            relays.retain(|r| r.url != url);
            relays.len() != before
        };
        if changed {
            self.save_user_relays();
        }
        removed
    }

    /// Every known relay with its status and score.
    pub fn get_relay_status(&self) -> Vec<RelayRecord> {
        self.connections.relay_records()
    }

    /// URLs of connected relays.
    pub fn get_connected_relay_urls(&self) -> Vec<String> {
        self.connections.connected_urls()
    }

    /// Connect to the default relays. Returns how many connected.
    pub async fn connect_to_default_relays(&self) -> usize {
        for url in &self.default_relays {
            self.connections.register_relay(url, RelayMode::READ_WRITE);
        }
        self.connections.connect_to_relays(&self.default_relays).await
    }

    /// Connect to the user's relays, or to the defaults when the user has
    /// none. Returns how many connected.
    pub async fn connect_to_user_relays(&self) -> usize {
        for url in normalize_relay_urls(&self.config.relays.user_relays) {
            let known = self
                .user_relays
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .any(|r| r.url == url);
            if !known {
                self.remember_user_relay(&url, RelayMode::READ_WRITE);
            }
        }

        let relays = self.user_relays_snapshot();
        if relays.is_empty() {
            debug!("No user relays, using defaults");
            return self.connect_to_default_relays().await;
        }

        let urls: Vec<String> = relays
            .iter()
            .filter_map(|r| self.connections.register_relay(&r.url, r.mode()))
            .collect();
        self.connections.connect_to_relays(&urls).await
    }

    /// Relays the user added.
    pub fn user_relays(&self) -> Vec<UserRelay> {
        self.user_relays_snapshot()
    }

    // ========== Selection ==========

    /// See [`RelaySelector::select_best_relays`].
    pub fn select_best_relays(&self, candidates: &[String], params: &SelectionParams) -> Vec<String> {
        self.selector.select_best_relays(candidates, params)
    }

    /// See [`RelaySelector::select_relays_by_operation_type`].
    pub fn select_relays_by_operation_type(
        &self,
        candidates: &[String],
        read_count: usize,
        write_count: usize,
    ) -> RelaySets {
        self.selector
            .select_relays_by_operation_type(candidates, read_count, write_count)
    }

    /// See [`RelaySelector::find_fastest_relay`].
    pub fn find_fastest_relay(&self, candidates: &[String]) -> Option<String> {
        self.selector.find_fastest_relay(candidates)
    }

    /// See [`RelaySelector::get_balanced_relay_set`].
    pub fn get_balanced_relay_set(&self, candidates: &[String], count: usize) -> Vec<String> {
        self.selector.get_balanced_relay_set(candidates, count)
    }

    // ========== Circuit Control ==========

    /// Circuit state of `url`.
    pub fn get_state(&self, url: &str) -> CircuitState {
        self.breakers.get_state(url)
    }

    /// Record a success for `url`.
    pub fn record_success(&self, url: &str) -> CircuitState {
        self.breakers.record_success(url)
    }

    /// Record a failure for `url`.
    pub fn record_failure(&self, url: &str) -> CircuitState {
        self.breakers.record_failure(url)
    }

    /// Close the circuit of `url`.
    pub fn reset(&self, url: &str) {
        self.breakers.reset(url)
    }

    // ========== Components ==========

    /// Content cache.
    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Performance tracker.
    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    /// Relay discoverer.
    pub fn discoverer(&self) -> &RelayDiscoverer {
        &self.discoverer
    }

    /// Metrics service.
    pub fn metrics(&self) -> &Arc<MetricsService> {
        &self.metrics
    }

    // ========== Network Pipeline ==========

    /// Publish `event` to the best write relays. Returns whether at least
    /// one relay accepted it.
    pub async fn publish(&self, event: &Event) -> bool {
        if let Err(e) = event.validate() {
            warn!("Refusing to publish invalid event: {}", e);
            return false;
        }
        if !self.is_online() {
            debug!("Offline, not publishing {}", event.id);
            return false;
        }

        let candidates = self.candidates(|r| r.write);
        let relays = self
            .selector
            .select_best_relays(&candidates, &SelectionParams::write(PUBLISH_RELAY_COUNT));
        if relays.is_empty() {
            warn!("No relay available to publish {}", event.id);
            return false;
        }

        let outcomes = match self.transport.publish(&relays, event).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("Publish of {} failed: {}", event.id, e);
                for relay in &relays {
                    self.record_relay_outcome(relay, None);
                }
                return false;
            }
        };

        let mut accepted = 0;
        for outcome in &outcomes {
            self.metrics.publish(&outcome.relay, outcome.accepted);
            if outcome.accepted {
                accepted += 1;
                self.record_relay_outcome(&outcome.relay, Some(outcome.latency_ms));
            } else if outcome.message.starts_with("restricted") {
                // The relay answered; it just does not take our writes.
                self.record_relay_outcome(&outcome.relay, Some(outcome.latency_ms));
                self.mark_restricted(&outcome.relay);
            } else {
                debug!("{} rejected {}: {}", outcome.relay, event.id, outcome.message);
                self.record_relay_outcome(&outcome.relay, None);
            }
        }

        info!(
            "Published {} to {}/{} relays",
            event.id,
            accepted,
            outcomes.len()
        );
        if accepted > 0 {
            self.cache.cache_event(event.clone(), true);
        }
        accepted > 0
    }

    /// Fetch events matching `filter` from the best read relays, waiting at
    /// most `wait`. Results are cached. When no relay answers, matching
    /// cached events are returned instead.
    pub async fn fetch_events(&self, filter: &Filter, wait: Duration) -> Vec<Event> {
        if !self.is_online() {
            debug!("Offline, serving fetch from cache");
            return self.from_cache(filter);
        }

        let candidates = self.candidates(|r| r.read);
        let relays = self
            .selector
            .select_best_relays(&candidates, &SelectionParams::read(FETCH_RELAY_COUNT));
        if relays.is_empty() {
            return self.from_cache(filter);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = Timer::start();
        let id = match self.transport.subscribe(&relays, filter, tx).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Subscription failed on {:?}: {}", relays, e);
                for relay in &relays {
                    self.record_relay_outcome(relay, None);
                }
                return self.from_cache(filter);
            }
        };

        let deadline = Instant::now() + wait;
        let mut events: HashMap<String, Event> = HashMap::new();
        let mut received: HashMap<String, usize> = HashMap::new();
        let mut progress: HashMap<String, FetchProgress> = relays
            .iter()
            .map(|r| (r.clone(), FetchProgress::Waiting))
            .collect();

        while progress.values().any(|p| p.is_pending()) {
            let message = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) | Err(_) => break,
            };
            match message {
                SubscriptionEvent::Event { relay, event } => {
                    let Some(state) = progress.get_mut(&relay) else {
                        continue;
                    };
                    if *state == FetchProgress::Waiting {
                        *state = FetchProgress::Streaming(timer.elapsed_ms());
                    }
                    if event.validate().is_err() {
                        debug!("Skipping malformed event from {}", relay);
                        continue;
                    }
                    *received.entry(relay).or_insert(0) += 1;
                    events.entry(event.id.clone()).or_insert(event);
                }
                SubscriptionEvent::Eose { relay } => {
                    if let Some(state) = progress.get_mut(&relay) {
                        *state = match *state {
                            FetchProgress::Waiting => FetchProgress::Finished(timer.elapsed_ms()),
                            FetchProgress::Streaming(first) => FetchProgress::Finished(first),
                            done => done,
                        };
                    }
                }
                SubscriptionEvent::Closed { relay, reason } => {
                    debug!("{} closed subscription {}: {}", relay, id, reason);
                    // A close after EOSE is the relay ending a completed query.
                    if let Some(state) = progress.get_mut(&relay).filter(|s| s.is_pending()) {
                        *state = FetchProgress::Closed;
                    }
                }
            }
        }

        if let Err(e) = self.transport.unsubscribe(&id).await {
            debug!("Failed to close subscription {}: {}", id, e);
        }

        let mut answered = 0;
        for relay in &relays {
            let latency = progress.get(relay).and_then(|p| p.latency_ms());
            if latency.is_some() {
                answered += 1;
            }
            self.record_relay_outcome(relay, latency);
            if let Some(&count) = received.get(relay) {
                self.metrics.events_fetched(relay, count);
            }
        }

        if answered == 0 {
            warn!("No relay answered within {:?}, serving from cache", wait);
            return self.from_cache(filter);
        }

        let mut events: Vec<Event> = events.into_values().collect();
        sort_newest_first(&mut events);
        if let Some(limit) = filter.limit {
            events.truncate(limit as usize);
        }
        self.absorb(&events);

        debug!(
            "Fetched {} events from {}/{} relays in {}ms",
            events.len(),
            answered,
            relays.len(),
            timer.elapsed_ms()
        );
        events
    }

    // ========== Internal Methods ==========

    fn candidates(&self, wanted: impl Fn(&RelayRecord) -> bool) -> Vec<String> {
        let records = self.connections.relay_records();
        let mut candidates: Vec<String> = records
            .iter()
            .filter(|r| wanted(*r))
            .map(|r| r.url.clone())
            .collect();
        if candidates.is_empty() {
            candidates = self.default_relays.clone();
        }
        candidates
    }

    fn record_relay_outcome(&self, relay: &str, latency_ms: Option<u64>) {
        record_outcome(&self.breakers, &self.tracker, relay, latency_ms);
        match latency_ms {
            Some(_) => self.discoverer.record_success(relay),
            None => self.discoverer.record_failure(relay),
        }
    }

    fn mark_restricted(&self, relay: &str) {
        let mut info = self.tracker.relay_info(relay).unwrap_or_default();
        if !info.restricted_writes {
            info!("{} restricts writes", relay);
            info.restricted_writes = true;
            self.tracker.set_relay_info(relay, info);
        }
    }

    /// Cache fetched events and learn from profile and relay list events.
    fn absorb(&self, events: &[Event]) {
        self.cache.cache_events(events.to_vec(), false);
        for event in events {
            match event.kind {
                KIND_METADATA => match Profile::from_metadata_event(event) {
                    Ok(profile) => {
                        self.cache.cache_profile(profile, false);
                    }
                    Err(e) => debug!("Skipping profile {}: {}", event.id, e),
                },
                KIND_RELAY_LIST => {
                    self.discoverer.discover_from_event(event);
                }
                _ => {}
            }
        }
    }

    fn from_cache(&self, filter: &Filter) -> Vec<Event> {
        let mut events: Vec<Event> = match &filter.ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.cache.get_event(id))
                .collect(),
            None => self.cache.get_filtered_events(&EventQuery {
                authors: filter.authors.clone(),
                kinds: filter.kinds.clone(),
                since: filter.since,
                until: filter.until,
                ..Default::default()
            }),
        };
        events.retain(|e| filter.matches(e));
        sort_newest_first(&mut events);
        if let Some(limit) = filter.limit {
            events.truncate(limit as usize);
        }
        events
    }

    fn user_relays_snapshot(&self) -> Vec<UserRelay> {
        self.user_relays
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember_user_relay(&self, url: &str, mode: RelayMode) {
        {
            let mut relays = self.user_relays.write().unwrap_or_else(|e| e.into_inner());
            match relays.iter_mut().find(|r| r.url == url) {
                Some(existing) if existing.mode() == mode => return,
                Some(existing) => {
                    existing.read = mode.read;
                    existing.write = mode.write;
                }
                None => relays.push(UserRelay {
                    url: url.to_string(),
                    read: mode.read,
                    write: mode.write,
                }),
            }
        }
        self.save_user_relays();
    }

    fn load_user_relays(&self) -> usize {
        let Some(stored) = load_json::<Vec<UserRelay>>(&*self.store, keys::USER_RELAYS) else {
            return 0;
        };
        let mut relays = self.user_relays.write().unwrap_or_else(|e| e.into_inner());
        for relay in stored {
            let Ok(url) = normalize_relay_url(&relay.url) else {
                continue;
            };
            if !relays.iter().any(|r| r.url == url) {
                relays.push(UserRelay { url, ..relay });
            }
        }
        relays.len()
    }

    fn save_user_relays(&self) {
        let relays = self.user_relays_snapshot();
        if let Err(e) = save_json(&*self.store, keys::USER_RELAYS, &relays) {
            warn!("Failed to save user relays: {}", e);
        }
    }
}

/// Where one relay stands in a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchProgress {
    Waiting,
    /// Events arriving; first response after this many ms.
    Streaming(u64),
    /// EOSE received.
    Finished(u64),
    /// Closed before EOSE.
    Closed,
}

impl FetchProgress {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Streaming(_))
    }

    /// First-response latency if the relay answered without failing.
    fn latency_ms(&self) -> Option<u64> {
        match self {
            Self::Streaming(ms) | Self::Finished(ms) => Some(*ms),
            Self::Waiting | Self::Closed => None,
        }
    }
}

fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Profile prefetch through the client's fetch pipeline.
struct ClientProfileFetcher {
    client: Weak<RelayClient>,
}

#[async_trait]
impl ProfileFetcher for ClientProfileFetcher {
    async fn fetch_profiles(&self, pubkeys: &[String]) -> Vec<Profile> {
        let Some(client) = self.client.upgrade() else {
            return Vec::new();
        };
        let filter = Filter::new()
            .authors(pubkeys.to_vec())
            .kinds(vec![KIND_METADATA]);

        let mut latest: HashMap<String, Profile> = HashMap::new();
        for event in client.fetch_events(&filter, DEFAULT_FETCH_WAIT).await {
            let Ok(profile) = Profile::from_metadata_event(&event) else {
                continue;
            };
            let newer = latest
                .get(&profile.pubkey)
                .map_or(true, |p| p.created_at < profile.created_at);
            if newer {
                latest.insert(profile.pubkey.clone(), profile);
            }
        }
        latest.into_values().collect()
    }
}
