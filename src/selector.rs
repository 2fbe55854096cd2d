//! Relay selection.
//!
//! Ranks candidate relays for an operation using circuit state and observed
//! performance. Relays with an Open circuit are never selected, except by the
//! empty-pool fallback, which only ever returns the configured default relays
//! after resetting their circuits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::performance::PerformanceTracker;

/// Base score for a default relay without performance data.
pub const DEFAULT_RELAY_BASE_SCORE: f64 = 70.0;
/// Base score for any other relay without performance data.
pub const UNKNOWN_RELAY_BASE_SCORE: f64 = 50.0;

const PREFERRED_NIP_BONUS: f64 = 20.0;
const FAST_RESPONSE_MS: f64 = 500.0;
const FAST_RESPONSE_BONUS: f64 = 10.0;
const SLOW_RESPONSE_MS: f64 = 2_000.0;
const SLOW_RESPONSE_PENALTY: f64 = 20.0;
const FAILURE_PENALTY: f64 = 10.0;
const MAX_FAILURE_PENALTY: f64 = 40.0;
const FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60);
const HALF_OPEN_PENALTY: f64 = 30.0;

/// Minimum score for write relays chosen by
/// [`RelaySelector::select_relays_by_operation_type`].
pub const WRITE_MIN_SCORE: f64 = 40.0;

/// Kind of operation relays are selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    /// Subscriptions and queries.
    #[default]
    Read,
    /// Publishing events.
    Write,
}

/// Parameters for [`RelaySelector::select_best_relays`].
#[derive(Debug, Clone)]
pub struct SelectionParams {
    /// Operation the relays are for.
    pub operation: Operation,
    /// Maximum number of relays returned.
    pub count: usize,
    /// Exclude relays known to restrict writes.
    pub require_write_support: bool,
    /// NIPs that earn a bonus when supported.
    pub preferred_nips: Vec<u16>,
    /// NIPs a relay must not be known to lack.
    pub require_nips: Vec<u16>,
    /// Minimum final score.
    pub min_score: f64,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            operation: Operation::Read,
            count: 3,
            require_write_support: false,
            preferred_nips: Vec::new(),
            require_nips: Vec::new(),
            min_score: 0.0,
        }
    }
}

impl SelectionParams {
    /// Parameters for reading.
    pub fn read(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    /// Parameters for writing: write support required, minimum score 40.
    pub fn write(count: usize) -> Self {
        Self {
            operation: Operation::Write,
            count,
            require_write_support: true,
            min_score: WRITE_MIN_SCORE,
            ..Default::default()
        }
    }

    /// Add preferred NIPs.
    pub fn prefer_nips(mut self, nips: &[u16]) -> Self {
        self.preferred_nips.extend_from_slice(nips);
        self
    }

    /// Add required NIPs.
    pub fn require_nips(mut self, nips: &[u16]) -> Self {
        self.require_nips.extend_from_slice(nips);
        self
    }

    /// Set the minimum score.
    pub fn min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }
}

/// Disjoint read and write relay sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySets {
    /// Relays to read from.
    pub read: Vec<String>,
    /// Relays to publish to.
    pub write: Vec<String>,
}

/// Produces ranked relay sets from circuit state and performance data.
pub struct RelaySelector {
    breakers: Arc<CircuitBreakerRegistry>,
    tracker: Arc<PerformanceTracker>,
    default_relays: Vec<String>,
}

impl RelaySelector {
    /// Create a selector. `default_relays` are the known-good relays used for
    /// the heuristic base score and the empty-pool fallback.
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        tracker: Arc<PerformanceTracker>,
        default_relays: Vec<String>,
    ) -> Self {
        Self {
            breakers,
            tracker,
            default_relays,
        }
    }

    /// Known-good default relays.
    pub fn default_relays(&self) -> &[String] {
        &self.default_relays
    }

    /// Whether `url` is one of the default relays.
    pub fn is_default(&self, url: &str) -> bool {
        self.default_relays.iter().any(|d| d == url)
    }

    /// Rank `candidates` and return the best `params.count`.
    ///
    /// Candidates with an Open circuit are dropped. If none remain, the
    /// circuits of the default relays are reset and up to `count` defaults
    /// are returned instead.
    pub fn select_best_relays(&self, candidates: &[String], params: &SelectionParams) -> Vec<String> {
        let available: Vec<&String> = dedup(candidates)
            .into_iter()
            .filter(|url| self.breakers.get_state(url) != CircuitState::Open)
            .collect();

        if available.is_empty() {
            return self.fallback(params.count);
        }

        let mut scored: Vec<(&String, f64)> = available
            .into_iter()
            .filter_map(|url| self.score_relay(url, params).map(|score| (url, score)))
            .filter(|(_, score)| *score >= params.min_score)
            .collect();

        // Stable sort keeps candidate order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let selected: Vec<String> = scored
            .into_iter()
            .take(params.count)
            .map(|(url, _)| url.clone())
            .collect();

        debug!(
            "Selected {} relays for {:?}: {:?}",
            selected.len(),
            params.operation,
            selected
        );
        selected
    }

    /// Choose write relays first (write support required, minimum score 40),
    /// then read relays from the remaining pool. No relay appears in both.
    pub fn select_relays_by_operation_type(
        &self,
        candidates: &[String],
        read_count: usize,
        write_count: usize,
    ) -> RelaySets {
        let write = self.select_best_relays(candidates, &SelectionParams::write(write_count));

        let remaining: Vec<String> = candidates
            .iter()
            .filter(|url| !write.contains(url))
            .cloned()
            .collect();

        let mut read = self.select_best_relays(&remaining, &SelectionParams::read(read_count));
        // The empty-pool fallback may hand back relays already chosen for writing.
        read.retain(|url| !write.contains(url));

        RelaySets { read, write }
    }

    /// Non-Open candidate with the lowest average response time.
    ///
    /// Without any performance data, the first default relay among the
    /// candidates is returned, else the first available candidate.
    pub fn find_fastest_relay(&self, candidates: &[String]) -> Option<String> {
        let available: Vec<&String> = dedup(candidates)
            .into_iter()
            .filter(|url| self.breakers.get_state(url) != CircuitState::Open)
            .collect();

        let fastest = available
            .iter()
            .filter_map(|url| {
                self.tracker
                    .get_relay_performance(url)
                    .and_then(|p| p.avg_response_time)
                    .map(|avg| (*url, avg))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((url, _)) = fastest {
            return Some(url.clone());
        }

        available
            .iter()
            .find(|url| self.is_default(url))
            .or_else(|| available.first())
            .map(|url| (*url).clone())
    }

    /// Default relays present among the candidates first, then the
    /// best-scoring others, up to `count` distinct relays.
    pub fn get_balanced_relay_set(&self, candidates: &[String], count: usize) -> Vec<String> {
        let unique = dedup(candidates);

        let mut result: Vec<String> = unique
            .iter()
            .filter(|url| self.is_default(url))
            .filter(|url| self.breakers.get_state(url) != CircuitState::Open)
            .map(|url| (*url).clone())
            .take(count)
            .collect();

        let others: Vec<String> = unique
            .iter()
            .filter(|url| !self.is_default(url))
            .map(|url| (*url).clone())
            .collect();

        let remaining = count.saturating_sub(result.len());
        let has_available_other = others
            .iter()
            .any(|url| self.breakers.get_state(url) != CircuitState::Open);

        if remaining > 0 && has_available_other {
            for url in self.select_best_relays(&others, &SelectionParams::read(remaining)) {
                if !result.contains(&url) {
                    result.push(url);
                }
            }
        }

        result.truncate(count);
        result
    }

    /// Score for `url`, or `None` when it is hard-excluded.
    pub fn score_relay(&self, url: &str, params: &SelectionParams) -> Option<f64> {
        let perf = self.tracker.get_relay_performance(url);
        let info = self.tracker.relay_info(url);

        let mut score = match &perf {
            Some(p) => p.score,
            None if self.is_default(url) => DEFAULT_RELAY_BASE_SCORE,
            None => UNKNOWN_RELAY_BASE_SCORE,
        };

        if let Some(info) = &info {
            if params
                .require_nips
                .iter()
                .any(|nip| !info.supported_nips.contains(nip))
            {
                return None;
            }
            if params.require_write_support && info.restricted_writes {
                return None;
            }
            if !params.preferred_nips.is_empty() {
                let supported = params
                    .preferred_nips
                    .iter()
                    .filter(|nip| info.supported_nips.contains(nip))
                    .count();
                score +=
                    PREFERRED_NIP_BONUS * supported as f64 / params.preferred_nips.len() as f64;
            }
        }

        if let Some(avg) = perf.as_ref().and_then(|p| p.avg_response_time) {
            if avg > SLOW_RESPONSE_MS {
                score -= SLOW_RESPONSE_PENALTY;
            } else if avg < FAST_RESPONSE_MS {
                score += FAST_RESPONSE_BONUS;
            }
        }

        let failures = self.tracker.recent_failures(url, FAILURE_WINDOW) as f64;
        score -= (failures * FAILURE_PENALTY).min(MAX_FAILURE_PENALTY);

        if self.breakers.get_state(url) == CircuitState::HalfOpen {
            score -= HALF_OPEN_PENALTY;
        }

        Some(score.clamp(0.0, 100.0))
    }

    fn fallback(&self, count: usize) -> Vec<String> {
        warn!(
            "No relay candidates available, falling back to {} default relays",
            self.default_relays.len().min(count)
        );
        self.default_relays
            .iter()
            .take(count)
            .map(|url| {
                self.breakers.reset(url);
                url.clone()
            })
            .collect()
    }
}

fn dedup(urls: &[String]) -> Vec<&String> {
    let mut seen = HashSet::new();
    urls.iter().filter(|url| seen.insert(url.as_str())).collect()
}
