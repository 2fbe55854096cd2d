//! Event tier with author, hashtag and time-range queries.

use std::collections::HashSet;
use std::sync::Arc;

use super::base::{BaseCache, TierStats};
use crate::clock::SharedClock;
use crate::config::TierExpiry;
use crate::error::Result;
use crate::event::Event;
use crate::metrics::MetricsService;
use crate::persistence::{keys, Store};

/// Combined query over cached events. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Only events by these authors.
    pub authors: Option<Vec<String>>,
    /// Only events tagged with this hashtag.
    pub hashtag: Option<String>,
    /// Only events of these kinds.
    pub kinds: Option<Vec<u16>>,
    /// Created at or after (unix secs).
    pub since: Option<u64>,
    /// Created at or before (unix secs).
    pub until: Option<u64>,
    /// Newest `limit` events.
    pub limit: Option<usize>,
}

/// Events keyed by id.
pub struct EventCache {
    inner: BaseCache<Event>,
}

impl EventCache {
    /// Create the tier, persisting important events to `store`.
    pub fn new(
        expiry: TierExpiry,
        clock: SharedClock,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            inner: BaseCache::new("events", expiry, clock)
                .with_storage(store, keys::EVENT_CACHE)
                .with_metrics(metrics),
        }
    }

    /// Cache one event.
    pub fn cache_event(&self, event: Event, important: bool) -> Result<()> {
        let id = event.id.clone();
        self.inner.cache_item(&id, event, important)
    }

    /// Cache a batch with a single persistence write.
    pub fn cache_events(&self, events: Vec<Event>, important: bool) -> Result<()> {
        let items = events.into_iter().map(|e| (e.id.clone(), e)).collect();
        self.inner.cache_items(items, important)
    }

    /// Event by id.
    pub fn get_event(&self, id: &str) -> Option<Event> {
        self.inner.get_item(id)
    }

    /// Events by any of `pubkeys`, newest first.
    pub fn get_events_by_authors(&self, pubkeys: &[String]) -> Vec<Event> {
        self.get_filtered_events(&EventQuery {
            authors: Some(pubkeys.to_vec()),
            ..Default::default()
        })
    }

    /// Events tagged `#tag`, newest first.
    pub fn get_events_by_hashtag(&self, tag: &str) -> Vec<Event> {
        self.get_filtered_events(&EventQuery {
            hashtag: Some(tag.to_string()),
            ..Default::default()
        })
    }

    /// Events matching every set field of `query`, newest first.
    pub fn get_filtered_events(&self, query: &EventQuery) -> Vec<Event> {
        let authors: Option<HashSet<&str>> = query
            .authors
            .as_ref()
            .map(|a| a.iter().map(String::as_str).collect());

        let mut events: Vec<Event> = self
            .inner
            .live_values()
            .into_iter()
            .filter(|e| authors.as_ref().map_or(true, |a| a.contains(e.pubkey.as_str())))
            .filter(|e| query.hashtag.as_ref().map_or(true, |t| e.has_hashtag(t)))
            .filter(|e| query.kinds.as_ref().map_or(true, |k| k.contains(&e.kind)))
            .filter(|e| query.since.map_or(true, |s| e.created_at >= s))
            .filter(|e| query.until.map_or(true, |u| e.created_at <= u))
            .collect();

        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        events
    }

    /// The underlying tier.
    pub fn tier(&self) -> &BaseCache<Event> {
        &self.inner
    }

    /// Tier counters.
    pub fn stats(&self) -> TierStats {
        self.inner.stats()
    }
}
