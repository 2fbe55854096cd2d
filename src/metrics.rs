//! Prometheus metrics for relay-mesh observability.
//!
//! This module provides metrics collection for monitoring:
//! - Relay connection attempts, latency and live connection count
//! - Circuit breaker state and trips
//! - Cache hits, misses and evictions per tier
//! - Storage quota pressure
//! - Publish and fetch outcomes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_mesh::metrics::{MetricsService, MetricsConfig};
//!
//! let metrics = Arc::new(MetricsService::from_config(MetricsConfig::default()));
//! metrics.relay_connect("wss://nos.lol", true, 0.120);
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9464").await?;
//! relay_mesh::metrics::serve(listener, metrics).await?;
//! ```
//!
//! `serve` answers `GET /metrics` with the Prometheus exposition text.
//!
//! ## Exposed Metrics
//!
//! All metrics are prefixed with `relay_mesh_`:
//!
//! - `relay_mesh_relay_connects_total` - Connection attempts by outcome (counter)
//! - `relay_mesh_relay_connect_duration_seconds` - Connect latency (histogram)
//! - `relay_mesh_relays_connected` - Currently connected relays (gauge)
//! - `relay_mesh_circuit_breaker_state` - Circuit breaker state (gauge)
//! - `relay_mesh_circuit_breaker_trips_total` - Circuit trips (counter)
//! - `relay_mesh_cache_lookups_total` - Cache lookups by tier and result (counter)
//! - `relay_mesh_cache_evictions_total` - Cache evictions by tier and reason (counter)
//! - `relay_mesh_storage_quota_ratio` - Storage usage relative to quota (gauge)
//! - `relay_mesh_publish_total` - Publish attempts by outcome (counter)
//! - `relay_mesh_events_fetched_total` - Events received from relays (counter)

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install a Prometheus recorder (default: true)
    pub enabled: bool,
    /// Prefix for all metric names (default: "relay_mesh")
    pub prefix: String,
    /// Record per-tier cache lookup counters
    pub enable_cache_metrics: bool,
    /// Address the `run` command serves `/metrics` on, e.g. "127.0.0.1:9464"
    pub listen_address: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "relay_mesh".to_string(),
            enable_cache_metrics: true,
            listen_address: None,
        }
    }
}

/// Metric names with configurable prefix.
#[derive(Debug, Clone)]
pub struct MetricNames {
    pub relay_connects_total: String,
    pub relay_connect_duration: String,
    pub relays_connected: String,
    pub circuit_breaker_state: String,
    pub circuit_breaker_trips: String,
    pub cache_lookups: String,
    pub cache_evictions: String,
    pub storage_quota_ratio: String,
    pub publish_total: String,
    pub events_fetched: String,
}

impl MetricNames {
    /// Create metric names with the given prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            relay_connects_total: format!("{}_relay_connects_total", prefix),
            relay_connect_duration: format!("{}_relay_connect_duration_seconds", prefix),
            relays_connected: format!("{}_relays_connected", prefix),
            circuit_breaker_state: format!("{}_circuit_breaker_state", prefix),
            circuit_breaker_trips: format!("{}_circuit_breaker_trips_total", prefix),
            cache_lookups: format!("{}_cache_lookups_total", prefix),
            cache_evictions: format!("{}_cache_evictions_total", prefix),
            storage_quota_ratio: format!("{}_storage_quota_ratio", prefix),
            publish_total: format!("{}_publish_total", prefix),
            events_fetched: format!("{}_events_fetched_total", prefix),
        }
    }
}

impl Default for MetricNames {
    fn default() -> Self {
        Self::with_prefix("relay_mesh")
    }
}

/// Prometheus metrics service.
///
/// Recording goes through the global `metrics` recorder; when none is
/// installed every call is a no-op.
pub struct MetricsService {
    config: MetricsConfig,
    names: MetricNames,
    handle: Option<PrometheusHandle>,
}

impl MetricsService {
    /// Create a new metrics service with the given configuration.
    ///
    /// This installs a global Prometheus recorder. Only one can be installed
    /// per process, so subsequent calls will reuse the existing recorder.
    pub fn new(config: MetricsConfig) -> Self {
        let names = MetricNames::with_prefix(&config.prefix);

        let handle = PrometheusBuilder::new().install_recorder().ok();

        let service = Self {
            config,
            names,
            handle,
        };

        service.register_descriptions();

        service
    }

    /// Create a service honoring `config.enabled`.
    pub fn from_config(config: MetricsConfig) -> Self {
        if config.enabled {
            Self::new(config)
        } else {
            Self {
                names: MetricNames::with_prefix(&config.prefix),
                config,
                handle: None,
            }
        }
    }

    /// Create a disabled metrics service (for testing).
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            names: MetricNames::default(),
            handle: None,
        }
    }

    /// Render through `handle` instead of the global recorder.
    #[cfg(test)]
    pub(crate) fn with_handle(config: MetricsConfig, handle: PrometheusHandle) -> Self {
        Self {
            names: MetricNames::with_prefix(&config.prefix),
            config,
            handle: Some(handle),
        }
    }

    /// Check if metrics recording is enabled.
    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// Render metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
    }

    /// Get metric names.
    pub fn names(&self) -> &MetricNames {
        &self.names
    }

    fn register_descriptions(&self) {
        describe_counter!(
            self.names.relay_connects_total.clone(),
            "Total relay connection attempts"
        );
        describe_histogram!(
            self.names.relay_connect_duration.clone(),
            "Relay connect latency in seconds"
        );
        describe_gauge!(
            self.names.relays_connected.clone(),
            "Number of currently connected relays"
        );
        describe_gauge!(
            self.names.circuit_breaker_state.clone(),
            "Circuit breaker state (0=closed, 1=open, 2=half-open)"
        );
        describe_counter!(
            self.names.circuit_breaker_trips.clone(),
            "Total number of circuit breaker trips"
        );
        describe_gauge!(
            self.names.storage_quota_ratio.clone(),
            "Persistent storage usage relative to quota"
        );
        describe_counter!(
            self.names.publish_total.clone(),
            "Total publish attempts per relay"
        );
        describe_counter!(
            self.names.events_fetched.clone(),
            "Total events received from relays"
        );

        if self.config.enable_cache_metrics {
            describe_counter!(
                self.names.cache_lookups.clone(),
                "Total cache lookups by tier and result"
            );
            describe_counter!(
                self.names.cache_evictions.clone(),
                "Total cache entries evicted by tier and reason"
            );
        }
    }

    // ========== Relay Metrics ==========

    /// Record a connection attempt and, on success, its latency.
    pub fn relay_connect(&self, url: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "failure" };
        let labels = [("relay", url.to_string()), ("outcome", outcome.to_string())];
        counter!(self.names.relay_connects_total.clone(), &labels).increment(1);

        if success {
            let labels = [("relay", url.to_string())];
            histogram!(self.names.relay_connect_duration.clone(), &labels).record(duration_secs);
        }
    }

    /// Update the connected relay count.
    pub fn relays_connected(&self, count: usize) {
        gauge!(self.names.relays_connected.clone()).set(count as f64);
    }

    // ========== Circuit Breaker Metrics ==========

    /// Record circuit breaker state change.
    ///
    /// # Arguments
    /// * `relay` - Relay URL the breaker guards
    /// * `state` - State: 0=closed, 1=open, 2=half-open
    pub fn circuit_breaker_state(&self, relay: &str, state: u8) {
        let labels = [("relay", relay.to_string())];
        gauge!(self.names.circuit_breaker_state.clone(), &labels).set(state as f64);
    }

    /// Record a circuit breaker trip (transition to open).
    pub fn circuit_breaker_trip(&self, relay: &str) {
        let labels = [("relay", relay.to_string())];
        counter!(self.names.circuit_breaker_trips.clone(), &labels).increment(1);
    }

    // ========== Cache Metrics ==========

    /// Record a cache lookup.
    pub fn cache_lookup(&self, tier: &str, hit: bool) {
        if self.config.enable_cache_metrics {
            let labels = [
                ("tier", tier.to_string()),
                ("result", if hit { "hit" } else { "miss" }.to_string()),
            ];
            counter!(self.names.cache_lookups.clone(), &labels).increment(1);
        }
    }

    /// Record evicted cache entries.
    pub fn cache_evicted(&self, tier: &str, reason: &str, count: usize) {
        if self.config.enable_cache_metrics && count > 0 {
            let labels = [("tier", tier.to_string()), ("reason", reason.to_string())];
            counter!(self.names.cache_evictions.clone(), &labels).increment(count as u64);
        }
    }

    /// Update the storage usage ratio.
    pub fn storage_quota(&self, ratio: f64) {
        gauge!(self.names.storage_quota_ratio.clone()).set(ratio);
    }

    // ========== Pipeline Metrics ==========

    /// Record a publish attempt to one relay.
    pub fn publish(&self, relay: &str, accepted: bool) {
        let labels = [
            ("relay", relay.to_string()),
            (
                "outcome",
                if accepted { "accepted" } else { "rejected" }.to_string(),
            ),
        ];
        counter!(self.names.publish_total.clone(), &labels).increment(1);
    }

    /// Record events received from a relay.
    pub fn events_fetched(&self, relay: &str, count: usize) {
        let labels = [("relay", relay.to_string())];
        counter!(self.names.events_fetched.clone(), &labels).increment(count as u64);
    }
}

// ========== Exposition ==========

/// Router answering `GET /metrics` with the rendered metrics.
pub fn router(service: Arc<MetricsService>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(service)
}

/// Serve [`router`] on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, service: Arc<MetricsService>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics listening on http://{}/metrics", addr);
    }
    axum::serve(listener, router(service)).await?;
    Ok(())
}

async fn metrics_handler(State(service): State<Arc<MetricsService>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        service.render(),
    )
}

/// Timer for measuring operation duration.
///
/// Use this to measure how long operations take. Get the elapsed time
/// with `elapsed_secs()` and then record it using the MetricsService.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Create a new timer starting now.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Get elapsed time in whole milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests never install the global Prometheus recorder; enabled
    // services record through a local one.

    #[test]
    fn test_default_config_has_relay_mesh_prefix() {
        let config = MetricsConfig::default();
        assert_eq!(config.prefix, "relay_mesh");
        assert!(config.enable_cache_metrics);
    }

    #[test]
    fn test_metric_names_with_custom_prefix() {
        let names = MetricNames::with_prefix("client");
        assert_eq!(names.relay_connects_total, "client_relay_connects_total");
        assert_eq!(names.circuit_breaker_state, "client_circuit_breaker_state");
        assert_eq!(names.storage_quota_ratio, "client_storage_quota_ratio");
    }

    #[test]
    fn test_all_metric_names_have_prefix() {
        let names = MetricNames::default();
        let all = [
            &names.relay_connects_total,
            &names.relay_connect_duration,
            &names.relays_connected,
            &names.circuit_breaker_state,
            &names.circuit_breaker_trips,
            &names.cache_lookups,
            &names.cache_evictions,
            &names.storage_quota_ratio,
            &names.publish_total,
            &names.events_fetched,
        ];
        for name in all {
            assert!(name.starts_with("relay_mesh_"), "{} lacks prefix", name);
        }
    }

    #[test]
    fn test_disabled_service() {
        let service = MetricsService::disabled();
        assert!(!service.is_enabled());
        assert!(service.render().is_empty());
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        let service = MetricsService::disabled();

        service.relay_connect("wss://nos.lol", true, 0.1);
        service.relay_connect("wss://nos.lol", false, 0.0);
        service.relays_connected(3);
        service.circuit_breaker_state("wss://nos.lol", 1);
        service.circuit_breaker_trip("wss://nos.lol");
        service.cache_lookup("events", true);
        service.cache_evicted("feeds", "emergency", 4);
        service.storage_quota(0.72);
        service.publish("wss://nos.lol", true);
        service.events_fetched("wss://nos.lol", 10);
    }

    #[test]
    fn test_disabled_config_installs_no_recorder() {
        let config = MetricsConfig {
            enabled: false,
            prefix: "client".to_string(),
            ..Default::default()
        };
        let service = MetricsService::from_config(config);
        assert!(!service.is_enabled());
        assert_eq!(service.names().relays_connected, "client_relays_connected");
    }

    #[test]
    fn test_enabled_service_renders_recorded_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let service = MetricsService::with_handle(MetricsConfig::default(), recorder.handle());

        metrics::with_local_recorder(&recorder, || {
            service.relay_connect("wss://nos.lol", true, 0.12);
            service.relays_connected(2);
            service.circuit_breaker_trip("wss://nos.lol");
        });

        assert!(service.is_enabled());
        let body = service.render();
        assert!(body.contains("relay_mesh_relay_connects_total"));
        assert!(body.contains(&service.names().relays_connected));
        assert!(body.contains(&service.names().circuit_breaker_trips));
    }

    #[test]
    fn test_cache_metrics_can_be_switched_off() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let config = MetricsConfig {
            enable_cache_metrics: false,
            ..Default::default()
        };
        let service = MetricsService::with_handle(config, recorder.handle());

        metrics::with_local_recorder(&recorder, || {
            service.cache_lookup("events", true);
            service.publish("wss://nos.lol", true);
        });

        let body = service.render();
        assert!(!body.contains(&service.names().cache_lookups));
        assert!(body.contains(&service.names().publish_total));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_exposition() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let recorder = PrometheusBuilder::new().build_recorder();
        let service = Arc::new(MetricsService::with_handle(
            MetricsConfig::default(),
            recorder.handle(),
        ));
        metrics::with_local_recorder(&recorder, || {
            service.relay_connect("wss://nos.lol", false, 0.0);
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, service));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        server.abort();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("text/plain; version=0.0.4"));
        assert!(response.contains("relay_mesh_relay_connects_total"));
        assert!(response.contains("outcome=\"failure\""));
    }

    #[test]
    fn test_timer_tracks_elapsed_time() {
        let timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.005);
        assert!(timer.elapsed_ms() >= 5);
    }
}
