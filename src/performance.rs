//! Per-relay performance tracking.
//!
//! Each relay keeps a rolling window of recent response times, an
//! exponentially weighted success rate and a derived score:
//!
//! ```text
//! score = success_rate * 60
//!       + clamp(1 - avg_response_ms / 5000, 0, 1) * 30
//!       + recency * 10
//! ```
//!
//! where `recency` decays linearly from 1 to 0 over the hour following the
//! last successful use. An empty window contributes a neutral 0.5 response
//! factor. The score therefore always lies in `[0, 100]`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::persistence::{keys, load_json, save_json, Store};

/// Capacity of the response-time window.
pub const RESPONSE_WINDOW: usize = 10;

/// Capacity of the failure timestamp history.
pub const FAILURE_HISTORY: usize = 10;

const SUCCESS_WEIGHT: f64 = 60.0;
const RESPONSE_WEIGHT: f64 = 30.0;
const RECENCY_WEIGHT: f64 = 10.0;
const RESPONSE_CEILING_MS: f64 = 5_000.0;
const RECENCY_HORIZON_MS: f64 = 3_600_000.0;
const NEUTRAL_RESPONSE_FACTOR: f64 = 0.5;

/// Capabilities advertised by a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// NIPs the relay reports supporting.
    #[serde(default)]
    pub supported_nips: Vec<u16>,
    /// Whether the relay restricts who may write.
    #[serde(default)]
    pub restricted_writes: bool,
}

/// Rolling performance record for one relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    response_times: VecDeque<u64>,
    success_rate: f64,
    last_used: u64,
    score: f64,
    #[serde(default)]
    failures: VecDeque<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<RelayInfo>,
}

impl Default for PerformanceMetric {
    fn default() -> Self {
        Self {
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
            success_rate: 1.0,
            last_used: 0,
            score: 0.0,
            failures: VecDeque::with_capacity(FAILURE_HISTORY),
            info: None,
        }
    }
}

impl PerformanceMetric {
    /// Mean of the response-time window, if any samples exist.
    pub fn avg_response_time(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        let sum: u64 = self.response_times.iter().sum();
        Some(sum as f64 / self.response_times.len() as f64)
    }

    fn record_success(&mut self, response_ms: u64, now: u64) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(response_ms);
        self.success_rate = self.success_rate * 0.9 + 0.1;
        self.last_used = now;
        self.recompute(now);
    }

    fn record_failure(&mut self, now: u64) {
        self.success_rate = (self.success_rate * 0.8 - 0.1).max(0.0);
        if self.failures.len() == FAILURE_HISTORY {
            self.failures.pop_front();
        }
        self.failures.push_back(now);
        self.recompute(now);
    }

    fn recompute(&mut self, now: u64) {
        let response_factor = self
            .avg_response_time()
            .map(|avg| (1.0 - avg / RESPONSE_CEILING_MS).clamp(0.0, 1.0))
            .unwrap_or(NEUTRAL_RESPONSE_FACTOR);

        let recency = if self.response_times.is_empty() {
            0.0
        } else {
            let age = now.saturating_sub(self.last_used) as f64;
            (1.0 - age / RECENCY_HORIZON_MS).clamp(0.0, 1.0)
        };

        self.score = self.success_rate * SUCCESS_WEIGHT
            + response_factor * RESPONSE_WEIGHT
            + recency * RECENCY_WEIGHT;
    }

    /// Whether any success or failure has been recorded.
    pub fn is_observed(&self) -> bool {
        !self.response_times.is_empty() || !self.failures.is_empty()
    }

    fn failures_since(&self, cutoff: u64) -> usize {
        self.failures.iter().filter(|&&t| t >= cutoff).count()
    }
}

/// Read-only view returned by [`PerformanceTracker::get_relay_performance`].
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPerformance {
    /// Mean response time over the window (ms), if any samples exist.
    pub avg_response_time: Option<f64>,
    /// Exponentially weighted success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Derived score in `[0, 100]`.
    pub score: f64,
    /// Last successful use (ms since epoch), 0 if never.
    pub last_used: u64,
}

/// Tracks performance metrics for every observed relay.
pub struct PerformanceTracker {
    clock: SharedClock,
    metrics: RwLock<HashMap<String, PerformanceMetric>>,
}

impl PerformanceTracker {
    /// Create an empty tracker.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Record a successful exchange and its response time.
    pub fn record_success(&self, url: &str, response_ms: u64) {
        let now = self.clock.now_ms();
        let mut guard = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        let metric = guard.entry(url.to_string()).or_default();
        metric.record_success(response_ms, now);
        debug!(
            "Relay {} success in {}ms (score {:.1})",
            url, response_ms, metric.score
        );
    }

    /// Record a failed exchange.
    pub fn record_failure(&self, url: &str) {
        let now = self.clock.now_ms();
        let mut guard = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        let metric = guard.entry(url.to_string()).or_default();
        metric.record_failure(now);
        debug!(
            "Relay {} failure (success rate {:.2}, score {:.1})",
            url, metric.success_rate, metric.score
        );
    }

    /// Performance summary for `url`, or `None` if never observed.
    pub fn get_relay_performance(&self, url: &str) -> Option<RelayPerformance> {
        let guard = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        guard.get(url).filter(|m| m.is_observed()).map(|m| RelayPerformance {
            avg_response_time: m.avg_response_time(),
            success_rate: m.success_rate,
            score: m.score,
            last_used: m.last_used,
        })
    }

    /// Top `n` observed relays by score, best first.
    pub fn get_best_relays(&self, n: usize) -> Vec<String> {
        let guard = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<(&String, f64)> = guard
            .iter()
            .filter(|(_, m)| m.is_observed())
            .map(|(k, m)| (k, m.score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        ranked
            .into_iter()
            .take(n)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Failures recorded for `url` within the last `window`.
    pub fn recent_failures(&self, url: &str, window: Duration) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(window.as_millis() as u64);
        let guard = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        guard.get(url).map(|m| m.failures_since(cutoff)).unwrap_or(0)
    }

    /// Attach capability info (e.g. from a relay information document).
    pub fn set_relay_info(&self, url: &str, info: RelayInfo) {
        let mut guard = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        guard.entry(url.to_string()).or_default().info = Some(info);
    }

    /// Capability info for `url`, if known.
    pub fn relay_info(&self, url: &str) -> Option<RelayInfo> {
        let guard = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        guard.get(url).and_then(|m| m.info.clone())
    }

    /// Number of relays with recorded metrics.
    pub fn len(&self) -> usize {
        self.metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no relay has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist all metrics under [`keys::PERFORMANCE`].
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let snapshot = self
            .metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        save_json(store, keys::PERFORMANCE, &snapshot)?;
        info!("Saved performance metrics for {} relays", snapshot.len());
        Ok(())
    }

    /// Restore metrics saved by [`PerformanceTracker::save`]. A missing or
    /// corrupt snapshot leaves the tracker empty. Returns relays loaded.
    pub fn load(&self, store: &dyn Store) -> usize {
        let Some(snapshot) =
            load_json::<HashMap<String, PerformanceMetric>>(store, keys::PERFORMANCE)
        else {
            return 0;
        };

        let count = snapshot.len();
        *self.metrics.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        info!("Loaded performance metrics for {} relays", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryStore;
    use std::sync::Arc;

    const A: &str = "wss://a.example.com";
    const B: &str = "wss://b.example.com";

    fn new_tracker() -> (Arc<ManualClock>, PerformanceTracker) {
        let (clock, shared) = ManualClock::shared(10_000_000);
        (clock, PerformanceTracker::new(shared))
    }

    #[test]
    fn test_unknown_relay_has_no_performance() {
        let (_, tracker) = new_tracker();
        assert!(tracker.get_relay_performance(A).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_success_updates_rate_and_score() {
        let (_, tracker) = new_tracker();
        tracker.record_success(A, 1_000);

        let perf = tracker.get_relay_performance(A).unwrap();
        assert_eq!(perf.avg_response_time, Some(1_000.0));
        assert!((perf.success_rate - 1.0).abs() < 1e-9);
        // 60 + (1 - 0.2) * 30 + 10
        assert!((perf.score - 94.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_decays_success_rate_with_floor() {
        let (_, tracker) = new_tracker();
        tracker.record_failure(A);
        let perf = tracker.get_relay_performance(A).unwrap();
        assert!((perf.success_rate - 0.7).abs() < 1e-9);

        for _ in 0..20 {
            tracker.record_failure(A);
        }
        let perf = tracker.get_relay_performance(A).unwrap();
        assert_eq!(perf.success_rate, 0.0);
        // No samples and never used: neutral response factor only.
        assert!((perf.score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_keeps_last_ten_samples() {
        let (_, tracker) = new_tracker();
        for _ in 0..5 {
            tracker.record_success(A, 4_000);
        }
        for _ in 0..10 {
            tracker.record_success(A, 100);
        }

        let perf = tracker.get_relay_performance(A).unwrap();
        assert_eq!(perf.avg_response_time, Some(100.0));
    }

    #[test]
    fn test_failure_keeps_stale_window_and_recency_decays() {
        let (clock, tracker) = new_tracker();
        tracker.record_success(A, 500);

        clock.advance(Duration::from_secs(1_800));
        tracker.record_failure(A);

        let perf = tracker.get_relay_performance(A).unwrap();
        assert_eq!(perf.avg_response_time, Some(500.0));
        // 0.7 * 60 + 0.9 * 30 + 0.5 * 10
        assert!((perf.score - 74.0).abs() < 1e-9);
    }

    #[test]
    fn test_get_best_relays_orders_by_score() {
        let (_, tracker) = new_tracker();
        tracker.record_success(A, 3_000);
        tracker.record_success(B, 200);
        tracker.record_failure("wss://c.example.com");

        assert_eq!(tracker.get_best_relays(2), vec![B.to_string(), A.to_string()]);
        assert_eq!(tracker.get_best_relays(10).len(), 3);
    }

    #[test]
    fn test_recent_failures_respects_window() {
        let (clock, tracker) = new_tracker();
        tracker.record_failure(A);
        clock.advance(Duration::from_secs(11 * 60));
        tracker.record_failure(A);
        tracker.record_failure(A);

        assert_eq!(tracker.recent_failures(A, Duration::from_secs(600)), 2);
        assert_eq!(tracker.recent_failures(B, Duration::from_secs(600)), 0);
    }

    #[test]
    fn test_relay_info_round_trip() {
        let (_, tracker) = new_tracker();
        let info = RelayInfo {
            supported_nips: vec![1, 11, 50],
            restricted_writes: true,
        };
        tracker.set_relay_info(A, info.clone());
        assert_eq!(tracker.relay_info(A), Some(info));
        assert!(tracker.relay_info(B).is_none());
        // Capability info alone is not an observation.
        assert!(tracker.get_relay_performance(A).is_none());
        assert!(tracker.get_best_relays(5).is_empty());
    }

    #[test]
    fn test_save_and_load_survive_restart() {
        let store = MemoryStore::new();
        let (_, tracker) = new_tracker();
        tracker.record_success(A, 250);
        tracker.record_failure(B);
        tracker.save(&store).unwrap();

        let (_, restarted) = new_tracker();
        assert_eq!(restarted.load(&store), 2);
        let before = tracker.get_relay_performance(A).unwrap();
        let after = restarted.get_relay_performance(A).unwrap();
        assert_eq!(after.avg_response_time, before.avg_response_time);
        assert_eq!(after.last_used, before.last_used);
        assert!((after.score - before.score).abs() < 1e-6);
    }

    #[test]
    fn test_load_ignores_corrupt_snapshot() {
        let store = MemoryStore::new();
        store.put(keys::PERFORMANCE, b"[1, 2").unwrap();

        let (_, tracker) = new_tracker();
        assert_eq!(tracker.load(&store), 0);
        assert!(tracker.is_empty());
    }
}
