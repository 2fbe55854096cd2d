//! Relay discovery.
//!
//! This module handles:
//! - The pool of candidate relay URLs, seeded with well-known relays
//! - Per-relay found/success/failure counters
//! - Learning new relays from relay list events (kind 10002)
//! - Reachability probes that do not keep a connection open

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::event::{Event, KIND_RELAY_LIST};
use crate::relay_url::normalize_relay_url;
use crate::transport::Transport;

/// Deadline for a reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters kept for every candidate relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCounters {
    /// Times the relay was discovered.
    pub found: u64,
    /// Successful contacts.
    pub success: u64,
    /// Failed contacts.
    pub failure: u64,
}

impl RelayCounters {
    /// `success / (success + failure)`, or 0.5 for a relay never tried.
    pub fn success_ratio(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            return 0.5;
        }
        self.success as f64 / total as f64
    }
}

/// Tracks candidate relays and how reliably they have answered.
pub struct RelayDiscoverer {
    relays: RwLock<HashMap<String, RelayCounters>>,
    transport: Option<Arc<dyn Transport>>,
    probe_timeout: Duration,
}

impl RelayDiscoverer {
    /// Create a discoverer seeded with `seeds`.
    pub fn new(seeds: &[String]) -> Self {
        let discoverer = Self {
            relays: RwLock::new(HashMap::new()),
            transport: None,
            probe_timeout: PROBE_TIMEOUT,
        };
        discoverer.add_candidates(seeds);
        discoverer
    }

    /// Create a discoverer that can probe relays through `transport`.
    pub fn with_transport(seeds: &[String], transport: Arc<dyn Transport>) -> Self {
        let mut discoverer = Self::new(seeds);
        discoverer.transport = Some(transport);
        discoverer
    }

    /// Add candidate URLs. Invalid URLs are skipped. Returns how many were new.
    pub fn add_candidates<S: AsRef<str>>(&self, urls: &[S]) -> usize {
        let mut guard = self.relays.write().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for raw in urls {
            let url = match normalize_relay_url(raw.as_ref()) {
                Ok(url) => url,
                Err(e) => {
                    debug!("Skipping candidate relay {}: {}", raw.as_ref(), e);
                    continue;
                }
            };
            let counters = guard.entry(url).or_default();
            if counters.found == 0 {
                added += 1;
            }
            counters.found += 1;
        }
        added
    }

    /// Learn relays from the `r` tags of a relay list event.
    pub fn discover_from_event(&self, event: &Event) -> usize {
        if event.kind != KIND_RELAY_LIST {
            return 0;
        }
        let urls: Vec<&str> = event
            .tags
            .iter()
            .filter(|t| t.len() >= 2 && t[0] == "r")
            .map(|t| t[1].as_str())
            .collect();
        let added = self.add_candidates(urls.as_slice());
        if added > 0 {
            info!("Discovered {} new relays from {}", added, event.pubkey);
        }
        added
    }

    /// Record a successful contact, registering the relay if unseen.
    pub fn record_success(&self, url: &str) {
        self.update(url, |c| c.success += 1);
    }

    /// Record a failed contact, registering the relay if unseen.
    pub fn record_failure(&self, url: &str) {
        self.update(url, |c| c.failure += 1);
    }

    fn update(&self, url: &str, f: impl FnOnce(&mut RelayCounters)) {
        let url = match normalize_relay_url(url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring outcome for invalid relay URL {}: {}", url, e);
                return;
            }
        };
        let mut guard = self.relays.write().unwrap_or_else(|e| e.into_inner());
        let counters = guard.entry(url).or_insert(RelayCounters {
            found: 1,
            ..Default::default()
        });
        f(counters);
    }

    /// Counters for `url`, if known.
    pub fn counters(&self, url: &str) -> Option<RelayCounters> {
        let url = normalize_relay_url(url).ok()?;
        self.relays
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&url)
            .copied()
    }

    /// Every known relay URL, sorted.
    pub fn known_relays(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .relays
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        urls.sort();
        urls
    }

    /// Top `n` relays by success ratio. Ties prefer more successes.
    pub fn get_best_relays_to_try(&self, n: usize) -> Vec<String> {
        let guard = self.relays.read().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<(&String, &RelayCounters)> = guard.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.success_ratio()
                .partial_cmp(&a.1.success_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.success.cmp(&a.1.success))
                .then_with(|| a.0.cmp(b.0))
        });
        ranked
            .into_iter()
            .take(n)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Probe `url`: connect, then close immediately. The outcome updates
    /// the counters. Returns whether the relay was reachable.
    pub async fn test_relay(&self, url: &str) -> bool {
        let Some(transport) = &self.transport else {
            warn!("No transport configured, cannot probe {}", url);
            return false;
        };

        let reachable = match timeout(self.probe_timeout, transport.probe(url)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", url, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out", url);
                false
            }
        };

        if reachable {
            self.record_success(url);
        } else {
            self.record_failure(url);
        }
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::event::{fixtures, Filter};
    use crate::transport::{PublishOutcome, Socket, SubscriptionId, SubscriptionSink};
    use async_trait::async_trait;

    const A: &str = "wss://a.example.com";
    const B: &str = "wss://b.example.com";

    fn seeds() -> Vec<String> {
        vec![A.to_string(), B.to_string()]
    }

    /// Transport whose probes succeed only for `A`.
    struct ProbeOnly;

    #[async_trait]
    impl Transport for ProbeOnly {
        async fn connect(&self, url: &str) -> Result<Arc<dyn Socket>> {
            Err(Error::Network(format!("refused: {}", url)))
        }

        async fn subscribe(
            &self,
            _relays: &[String],
            _filter: &Filter,
            _sink: SubscriptionSink,
        ) -> Result<SubscriptionId> {
            Err(Error::Network("unsupported".to_string()))
        }

        async fn unsubscribe(&self, _id: &SubscriptionId) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, _relays: &[String], _event: &Event) -> Result<Vec<PublishOutcome>> {
            Ok(Vec::new())
        }

        async fn probe(&self, url: &str) -> Result<()> {
            if url == A {
                Ok(())
            } else {
                Err(Error::Network("refused".to_string()))
            }
        }
    }

    #[test]
    fn test_seeded_relays_are_known() {
        let discoverer = RelayDiscoverer::new(&seeds());
        assert_eq!(discoverer.known_relays(), seeds());
        assert_eq!(discoverer.counters(A).unwrap().found, 1);
    }

    #[test]
    fn test_add_candidates_normalizes_and_deduplicates() {
        let discoverer = RelayDiscoverer::new(&seeds());
        let added = discoverer.add_candidates(&[
            "WSS://A.example.com/",
            "wss://c.example.com",
            "http://not-a-relay",
        ]);
        assert_eq!(added, 1);
        assert_eq!(discoverer.known_relays().len(), 3);
        assert_eq!(discoverer.counters(A).unwrap().found, 2);
    }

    #[test]
    fn test_outcomes_auto_register_unseen_relays() {
        let discoverer = RelayDiscoverer::new(&[] as &[String]);
        discoverer.record_failure("wss://new.example.com");
        let counters = discoverer.counters("wss://new.example.com").unwrap();
        assert_eq!(counters.failure, 1);
        assert_eq!(counters.found, 1);
    }

    #[test]
    fn test_best_relays_ranked_by_success_ratio() {
        let discoverer = RelayDiscoverer::new(&seeds());
        discoverer.add_candidates(&["wss://c.example.com"]);

        discoverer.record_success(A);
        discoverer.record_failure(A);
        discoverer.record_success(B);
        discoverer.record_success(B);

        assert_eq!(
            discoverer.get_best_relays_to_try(3),
            vec![
                B.to_string(),
                A.to_string(),
                "wss://c.example.com".to_string()
            ]
        );
        assert_eq!(discoverer.get_best_relays_to_try(1), vec![B.to_string()]);
    }

    #[test]
    fn test_discover_from_relay_list_event() {
        let discoverer = RelayDiscoverer::new(&seeds());
        let mut event = fixtures::note(1, 'a', 10);
        event.kind = KIND_RELAY_LIST;
        event.tags = vec![
            vec!["r".to_string(), "wss://c.example.com".to_string()],
            vec!["r".to_string(), A.to_string(), "read".to_string()],
            vec!["p".to_string(), fixtures::key('b')],
        ];

        assert_eq!(discoverer.discover_from_event(&event), 1);
        assert_eq!(
            discoverer.discover_from_event(&fixtures::note(2, 'a', 10)),
            0
        );
    }

    #[tokio::test]
    async fn test_test_relay_records_outcome() {
        let discoverer = RelayDiscoverer::with_transport(&seeds(), Arc::new(ProbeOnly));

        assert!(discoverer.test_relay(A).await);
        assert!(!discoverer.test_relay(B).await);

        assert_eq!(discoverer.counters(A).unwrap().success, 1);
        assert_eq!(discoverer.counters(B).unwrap().failure, 1);
    }

    #[tokio::test]
    async fn test_test_relay_without_transport_is_false() {
        let discoverer = RelayDiscoverer::new(&seeds());
        assert!(!discoverer.test_relay(A).await);
    }
}
