//! List tier: named flat string lists such as mute or moderation lists.

use std::sync::Arc;

use super::base::{BaseCache, TierStats};
use crate::clock::SharedClock;
use crate::config::TierExpiry;
use crate::error::Result;
use crate::metrics::MetricsService;
use crate::persistence::{keys, Store};

/// String lists keyed by name.
pub struct ListCache {
    inner: BaseCache<Vec<String>>,
}

impl ListCache {
    /// Create the tier, persisting important lists to `store`.
    pub fn new(
        expiry: TierExpiry,
        clock: SharedClock,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            inner: BaseCache::new("lists", expiry, clock)
                .with_storage(store, keys::LIST_CACHE)
                .with_metrics(metrics),
        }
    }

    /// Cache a list.
    pub fn cache_list(&self, name: &str, items: Vec<String>, important: bool) -> Result<()> {
        self.inner.cache_item(name, items, important)
    }

    /// List by name.
    pub fn get_list(&self, name: &str) -> Option<Vec<String>> {
        self.inner.get_item(name)
    }

    /// The underlying tier.
    pub fn tier(&self) -> &BaseCache<Vec<String>> {
        &self.inner
    }

    /// Tier counters.
    pub fn stats(&self) -> TierStats {
        self.inner.stats()
    }
}
