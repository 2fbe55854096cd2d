//! Thread tier.

use std::collections::HashSet;
use std::sync::Arc;

use super::base::{BaseCache, TierStats};
use crate::clock::SharedClock;
use crate::config::TierExpiry;
use crate::error::Result;
use crate::event::{Event, ThreadData};
use crate::metrics::MetricsService;
use crate::persistence::{keys, Store};

/// Threads keyed by root event id.
pub struct ThreadCache {
    inner: BaseCache<ThreadData>,
}

impl ThreadCache {
    /// Create the tier, persisting important threads to `store`.
    pub fn new(
        expiry: TierExpiry,
        clock: SharedClock,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            inner: BaseCache::new("threads", expiry, clock)
                .with_storage(store, keys::THREAD_CACHE)
                .with_metrics(metrics),
        }
    }

    /// Cache a thread. Events are deduplicated by id and kept oldest first.
    pub fn cache_thread(&self, root_id: &str, events: Vec<Event>, important: bool) -> Result<()> {
        let mut seen = HashSet::new();
        let mut events: Vec<Event> = events
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let thread = ThreadData {
            root_id: root_id.to_string(),
            events,
        };
        self.inner.cache_item(root_id, thread, important)
    }

    /// Thread by root id.
    pub fn get_thread(&self, root_id: &str) -> Option<ThreadData> {
        self.inner.get_item(root_id)
    }

    /// The underlying tier.
    pub fn tier(&self) -> &BaseCache<ThreadData> {
        &self.inner
    }

    /// Tier counters.
    pub fn stats(&self) -> TierStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::fixtures::{id, note};
    use crate::persistence::MemoryStore;

    #[test]
    fn test_thread_events_are_deduplicated_and_ordered() {
        let (_, clock) = ManualClock::shared(1_700_000_000_000);
        let cache = ThreadCache::new(
            TierExpiry::new(600, 86_400),
            clock,
            Arc::new(MemoryStore::new()),
            Arc::new(MetricsService::disabled()),
        );

        let root = note(1, 'a', 10);
        let events = vec![note(3, 'b', 30), root.clone(), note(2, 'c', 20), root];
        cache.cache_thread(&id(1), events, false).unwrap();

        let thread = cache.get_thread(&id(1)).unwrap();
        assert_eq!(thread.root_id, id(1));
        let created: Vec<u64> = thread.events.iter().map(|e| e.created_at).collect();
        assert_eq!(created, vec![10, 20, 30]);
        assert!(cache.get_thread(&id(2)).is_none());
    }
}
