//! Generic expiring cache tier.
//!
//! Entries live in memory. Entries flagged `important` are also written to
//! the [`Store`] as one JSON blob per tier, so they survive restarts.
//!
//! Expiry rule: an entry's lifetime is the tier's offline expiry when the
//! tier is in offline mode or the entry is important, otherwise the standard
//! expiry. When a lifetime is exceeded:
//! - offline mode returns the stale data anyway
//! - an important entry reads as a miss but is kept
//! - anything else is deleted

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::TierExpiry;
use crate::error::Result;
use crate::metrics::MetricsService;
use crate::persistence::{load_json, save_json, Store};

/// A cached value with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Cached value.
    pub data: T,
    /// When the entry was written (ms since epoch).
    pub timestamp: u64,
    /// Pinned entries use the long expiry and are persisted.
    pub important: bool,
}

/// Counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Entries held.
    pub entries: usize,
    /// Entries flagged important.
    pub important: usize,
    /// Lookups that returned data.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
    /// Entries removed by sweeps and evictions.
    pub evictions: u64,
}

impl TierStats {
    /// Fraction of lookups that hit (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Expiring key/value tier.
pub struct BaseCache<T> {
    name: &'static str,
    expiry: TierExpiry,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    offline: AtomicBool,
    clock: SharedClock,
    store: Option<(Arc<dyn Store>, &'static str)>,
    metrics: Arc<MetricsService>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T> BaseCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create an in-memory tier.
    pub fn new(name: &'static str, expiry: TierExpiry, clock: SharedClock) -> Self {
        Self {
            name,
            expiry,
            entries: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            clock,
            store: None,
            metrics: Arc::new(MetricsService::disabled()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Persist important entries to `store` under `key`.
    pub fn with_storage(mut self, store: Arc<dyn Store>, key: &'static str) -> Self {
        self.store = Some((store, key));
        self
    }

    /// Report lookups and evictions to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Tier name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store `data` under `key`. Important entries are persisted right away;
    /// if that fails the write is undone and the error returned.
    pub fn cache_item(&self, key: &str, data: T, important: bool) -> Result<()> {
        self.cache_items(vec![(key.to_string(), data)], important)
    }

    /// Store several values with one persistence write.
    pub fn cache_items(&self, items: Vec<(String, T)>, important: bool) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let timestamp = self.clock.now_ms();

        let previous: Vec<(String, Option<CacheEntry<T>>)> = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            items
                .into_iter()
                .map(|(key, data)| {
                    let old = entries.insert(
                        key.clone(),
                        CacheEntry {
                            data,
                            timestamp,
                            important,
                        },
                    );
                    (key, old)
                })
                .collect()
        };

        if !important || self.store.is_none() {
            return Ok(());
        }

        if let Err(e) = self.persist_to_storage() {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            for (key, old) in previous.into_iter().rev() {
                match old {
                    Some(entry) => entries.insert(key, entry),
                    None => entries.remove(&key),
                };
            }
            return Err(e);
        }
        Ok(())
    }

    /// Look up `key` under the expiry rule.
    pub fn get_item(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ms();
        let offline = self.is_offline();

        let result = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                None => Lookup::Missing,
                Some(entry) if !self.is_expired(entry, now, offline) || offline => {
                    Lookup::Hit(entry.data.clone())
                }
                Some(entry) if entry.important => Lookup::Missing,
                Some(_) => Lookup::Expired,
            }
        };

        match result {
            Lookup::Hit(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_lookup(self.name, true);
                Some(data)
            }
            Lookup::Expired => {
                self.entries
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_evicted(self.name, "expired", 1);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_lookup(self.name, false);
                None
            }
            Lookup::Missing => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_lookup(self.name, false);
                None
            }
        }
    }

    /// Whether `key` is held, regardless of expiry.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Values that a lookup would currently return, without touching the
    /// hit counters.
    pub fn live_values(&self) -> Vec<T> {
        let now = self.clock.now_ms();
        let offline = self.is_offline();
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| offline || !self.is_expired(entry, now, offline))
            .map(|entry| entry.data.clone())
            .collect()
    }

    /// Delete expired entries. Important entries are never swept, and
    /// nothing is swept in offline mode. Returns how many were removed.
    pub fn cleanup_expired_entries(&self) -> usize {
        if self.is_offline() {
            return 0;
        }
        let now = self.clock.now_ms();
        let removed = self.remove_where(|entry| {
            !entry.important && now.saturating_sub(entry.timestamp) > self.standard_ms()
        });
        if removed > 0 {
            debug!("{} cache: swept {} expired entries", self.name, removed);
            self.metrics.cache_evicted(self.name, "expired", removed);
        }
        removed
    }

    /// Drop every non-important entry.
    pub fn purge_non_important(&self) -> usize {
        let removed = self.remove_where(|entry| !entry.important);
        self.metrics.cache_evicted(self.name, "quota", removed);
        removed
    }

    /// Drop the `n` oldest non-important entries.
    pub fn remove_oldest_non_important(&self, n: usize) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<(u64, String)> = entries
            .iter()
            .filter(|(_, entry)| !entry.important)
            .map(|(key, entry)| (entry.timestamp, key.clone()))
            .collect();
        candidates.sort();

        let removed = candidates
            .into_iter()
            .take(n)
            .filter(|(_, key)| entries.remove(key).is_some())
            .count();
        drop(entries);

        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        self.metrics.cache_evicted(self.name, "quota", removed);
        removed
    }

    /// Remove one entry.
    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    /// Drop every entry, important ones included, and the persisted blob.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Some((store, key)) = &self.store {
            if let Err(e) = store.delete(key) {
                warn!("{} cache: failed to delete stored entries: {}", self.name, e);
            }
        }
    }

    /// Switch between the standard and offline expiry.
    pub fn set_offline_mode(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether offline expiry is in effect.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Entries held.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    pub fn stats(&self) -> TierStats {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        TierStats {
            entries: entries.len(),
            important: entries.values().filter(|e| e.important).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Write every important entry to the store. Returns how many.
    pub fn persist_to_storage(&self) -> Result<usize> {
        let Some((store, key)) = &self.store else {
            return Ok(0);
        };
        let important: HashMap<String, CacheEntry<T>> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, entry)| entry.important)
            .map(|(k, entry)| (k.clone(), entry.clone()))
            .collect();

        save_json(store.as_ref(), key, &important)?;
        Ok(important.len())
    }

    /// Load important entries from the store. Records that fail to decode
    /// are skipped. Returns how many were loaded.
    pub fn load_from_storage(&self) -> usize {
        let Some((store, key)) = &self.store else {
            return 0;
        };
        let Some(raw) = load_json::<HashMap<String, serde_json::Value>>(store.as_ref(), key) else {
            return 0;
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut loaded = 0;
        for (k, value) in raw {
            match serde_json::from_value::<CacheEntry<T>>(value) {
                Ok(entry) if entry.important => {
                    entries.insert(k, entry);
                    loaded += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("{} cache: skipping malformed entry {}: {}", self.name, k, e),
            }
        }
        debug!("{} cache: loaded {} entries from storage", self.name, loaded);
        loaded
    }

    fn standard_ms(&self) -> u64 {
        self.expiry.standard_secs.saturating_mul(1000)
    }

    fn is_expired(&self, entry: &CacheEntry<T>, now: u64, offline: bool) -> bool {
        let lifetime_secs = if offline || entry.important {
            self.expiry.offline_secs
        } else {
            self.expiry.standard_secs
        };
        now.saturating_sub(entry.timestamp) > lifetime_secs.saturating_mul(1000)
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry<T>) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !predicate(entry));
        let removed = before - entries.len();
        drop(entries);
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

enum Lookup<T> {
    Hit(T),
    Expired,
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryStore;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    fn tier() -> (Arc<ManualClock>, Arc<MemoryStore>, BaseCache<String>) {
        let (clock, shared) = ManualClock::shared(START);
        let store = Arc::new(MemoryStore::new());
        let cache = BaseCache::new("test", TierExpiry::new(600, 86_400), shared)
            .with_storage(store.clone(), "test:cache");
        (clock, store, cache)
    }

    #[test]
    fn test_round_trip() {
        let (_, _, cache) = tier();
        cache.cache_item("k", "v".to_string(), false).unwrap();
        assert_eq!(cache.get_item("k"), Some("v".to_string()));
        assert_eq!(cache.get_item("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_standard_entry_expires_and_is_deleted() {
        let (clock, _, cache) = tier();
        cache.cache_item("k", "v".to_string(), false).unwrap();

        clock.advance(Duration::from_secs(600));
        assert!(cache.get_item("k").is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get_item("k"), None);
        assert!(!cache.contains("k"));
    }

    #[test]
    fn test_important_entry_uses_offline_expiry_and_is_kept() {
        let (clock, _, cache) = tier();
        cache.cache_item("k", "v".to_string(), true).unwrap();

        clock.advance(Duration::from_secs(3_600));
        assert!(cache.get_item("k").is_some());

        clock.advance(Duration::from_secs(86_400));
        assert_eq!(cache.get_item("k"), None);
        assert!(cache.contains("k"));
        assert_eq!(cache.cleanup_expired_entries(), 0);
    }

    #[test]
    fn test_offline_mode_returns_stale_data() {
        let (clock, _, cache) = tier();
        cache.cache_item("k", "v".to_string(), false).unwrap();
        cache.set_offline_mode(true);

        clock.advance(Duration::from_secs(2 * 86_400));
        assert_eq!(cache.get_item("k"), Some("v".to_string()));
        assert_eq!(cache.cleanup_expired_entries(), 0);

        cache.set_offline_mode(false);
        assert_eq!(cache.get_item("k"), None);
    }

    #[test]
    fn test_cleanup_sweeps_only_expired_non_important() {
        let (clock, _, cache) = tier();
        cache.cache_item("old", "a".to_string(), false).unwrap();
        cache.cache_item("pinned", "b".to_string(), true).unwrap();
        clock.advance(Duration::from_secs(601));
        cache.cache_item("fresh", "c".to_string(), false).unwrap();

        assert_eq!(cache.cleanup_expired_entries(), 1);
        assert!(cache.contains("pinned"));
        assert!(cache.contains("fresh"));
        assert_eq!(cache.live_values().len(), 2);
    }

    #[test]
    fn test_persist_and_load_only_important() {
        let (_, store, cache) = tier();
        cache.cache_item("a", "x".to_string(), false).unwrap();
        cache.cache_item("b", "y".to_string(), true).unwrap();

        let (_, shared) = ManualClock::shared(START);
        let reloaded: BaseCache<String> = BaseCache::new("test", TierExpiry::new(600, 86_400), shared)
            .with_storage(store, "test:cache");
        assert_eq!(reloaded.load_from_storage(), 1);
        assert_eq!(reloaded.get_item("b"), Some("y".to_string()));
        assert_eq!(reloaded.get_item("a"), None);
    }

    #[test]
    fn test_load_skips_malformed_entries() {
        let (_, store, cache) = tier();
        store
            .put(
                "test:cache",
                br#"{"good":{"data":"v","timestamp":1,"important":true},"bad":{"data":7}}"#,
            )
            .unwrap();
        assert_eq!(cache.load_from_storage(), 1);

        store.put("test:cache", b"not json").unwrap();
        assert_eq!(cache.load_from_storage(), 0);
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let (_, store, cache) = tier();
        cache.cache_item("a", "old".to_string(), false).unwrap();
        store.set_quota(10);

        let err = cache.cache_item("a", "new".to_string(), true).unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(cache.get_item("a"), Some("old".to_string()));

        assert!(cache.cache_item("b", "x".to_string(), true).is_err());
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_remove_oldest_non_important() {
        let (clock, _, cache) = tier();
        for i in 0..5 {
            cache.cache_item(&format!("k{}", i), i.to_string(), i == 0).unwrap();
            clock.advance(Duration::from_secs(1));
        }

        assert_eq!(cache.remove_oldest_non_important(2), 2);
        assert!(cache.contains("k0"));
        assert!(!cache.contains("k1"));
        assert!(!cache.contains("k2"));
        assert!(cache.contains("k3"));

        assert_eq!(cache.purge_non_important(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_removes_stored_blob() {
        let (_, store, cache) = tier();
        cache.cache_item("a", "x".to_string(), true).unwrap();
        assert!(store.contains("test:cache").unwrap());

        cache.clear();
        assert!(cache.is_empty());
        assert!(!store.contains("test:cache").unwrap());
    }
}
