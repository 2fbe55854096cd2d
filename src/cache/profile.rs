//! Profile tier.
//!
//! Adds three things on top of [`BaseCache`]:
//!
//! - **Hot tier**: profiles read more than [`HOT_ACCESS_THRESHOLD`] times are
//!   promoted into a `moka` cache with a short TTL and served from there.
//! - **Stripping**: profiles that are not important are reduced to the
//!   fields needed to render an author before they are stored.
//! - **Prefetch queue**: pubkeys mentioned in a cached profile's bio are
//!   queued (at most [`PREFETCH_QUEUE_CAPACITY`]) and fetched in small
//!   batches by a background timer.

use async_trait::async_trait;
use bech32::Hrp;
use moka::sync::Cache;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::base::{BaseCache, TierStats};
use crate::clock::SharedClock;
use crate::config::TierExpiry;
use crate::error::Result;
use crate::event::{is_hex_key, Profile};
use crate::metrics::MetricsService;
use crate::persistence::{keys, Store};
use crate::scheduler::{Scheduler, TaskHandle};

/// Lifetime of a hot-tier entry.
pub const HOT_TTL: Duration = Duration::from_secs(2 * 60);

/// Reads after which a profile is promoted to the hot tier.
pub const HOT_ACCESS_THRESHOLD: u32 = 3;

/// Maximum queued prefetch pubkeys.
pub const PREFETCH_QUEUE_CAPACITY: usize = 10;

/// Pubkeys fetched per prefetch run.
pub const PREFETCH_BATCH: usize = 3;

/// Interval between prefetch runs.
pub const PREFETCH_INTERVAL: Duration = Duration::from_secs(5 * 60);

const MAX_HOT_ENTRIES: u64 = 1_000;

/// Fetches profiles from the network for the prefetch queue.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Fetch the latest profile of each pubkey that can be found.
    async fn fetch_profiles(&self, pubkeys: &[String]) -> Vec<Profile>;
}

/// Profiles keyed by hex pubkey.
pub struct ProfileCache {
    inner: BaseCache<Profile>,
    hot: Cache<String, Profile>,
    access_counts: Mutex<HashMap<String, u32>>,
    prefetch_queue: Mutex<VecDeque<String>>,
    scheduler: Scheduler,
    prefetch_task: Mutex<Option<TaskHandle>>,
}

impl ProfileCache {
    /// Create the tier, persisting important profiles to `store`.
    pub fn new(
        expiry: TierExpiry,
        clock: SharedClock,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            inner: BaseCache::new("profiles", expiry, clock)
                .with_storage(store, keys::PROFILE_CACHE)
                .with_metrics(metrics),
            hot: Cache::builder()
                .max_capacity(MAX_HOT_ENTRIES)
                .time_to_live(HOT_TTL)
                .build(),
            access_counts: Mutex::new(HashMap::new()),
            prefetch_queue: Mutex::new(VecDeque::new()),
            scheduler: Scheduler::new(),
            prefetch_task: Mutex::new(None),
        }
    }

    /// Cache a profile. Non-important profiles are stripped to their
    /// essential fields. Pubkeys mentioned in the bio are queued for
    /// prefetch.
    pub fn cache_profile(&self, profile: Profile, important: bool) -> Result<()> {
        for mention in bio_mentions(profile.about.as_deref().unwrap_or_default()) {
            if mention != profile.pubkey {
                self.queue_prefetch(&mention);
            }
        }

        let stored = if important {
            profile
        } else {
            profile.essential()
        };
        let pubkey = stored.pubkey.clone();
        self.inner.cache_item(&pubkey, stored.clone(), important)?;

        if self.hot.contains_key(&pubkey) {
            self.hot.insert(pubkey, stored);
        }
        Ok(())
    }

    /// Profile by pubkey. Frequently read profiles are served from the hot
    /// tier.
    pub fn get_profile(&self, pubkey: &str) -> Option<Profile> {
        if let Some(profile) = self.hot.get(pubkey) {
            return Some(profile);
        }

        let profile = self.inner.get_item(pubkey)?;
        let reads = {
            let mut counts = self.access_counts.lock().unwrap_or_else(|e| e.into_inner());
            let count = counts.entry(pubkey.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if reads > HOT_ACCESS_THRESHOLD {
            debug!("Promoting profile {} to hot tier", pubkey);
            self.hot.insert(pubkey.to_string(), profile.clone());
        }
        Some(profile)
    }

    /// Whether `pubkey` is in the hot tier.
    pub fn is_hot(&self, pubkey: &str) -> bool {
        self.hot.contains_key(pubkey)
    }

    /// Queue `pubkey` for prefetch. Pubkeys already cached or queued, and
    /// pushes beyond capacity, are ignored. Returns whether it was queued.
    pub fn queue_prefetch(&self, pubkey: &str) -> bool {
        if self.inner.contains(pubkey) {
            return false;
        }
        let mut queue = self.prefetch_queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= PREFETCH_QUEUE_CAPACITY || queue.iter().any(|k| k == pubkey) {
            return false;
        }
        queue.push_back(pubkey.to_string());
        true
    }

    /// Queued prefetch pubkeys, oldest first.
    pub fn prefetch_queue(&self) -> Vec<String> {
        self.prefetch_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Take up to [`PREFETCH_BATCH`] pubkeys off the queue.
    pub fn drain_prefetch_batch(&self) -> Vec<String> {
        let mut queue = self.prefetch_queue.lock().unwrap_or_else(|e| e.into_inner());
        let n = queue.len().min(PREFETCH_BATCH);
        queue.drain(..n).collect()
    }

    /// Fetch one batch from the queue and cache the results. Returns how
    /// many profiles were cached.
    pub async fn run_prefetch(&self, fetcher: &dyn ProfileFetcher) -> usize {
        let batch: Vec<String> = self
            .drain_prefetch_batch()
            .into_iter()
            .filter(|k| !self.inner.contains(k))
            .collect();
        if batch.is_empty() {
            return 0;
        }

        let profiles = fetcher.fetch_profiles(&batch).await;
        let cached = profiles
            .into_iter()
            .filter(|p| batch.contains(&p.pubkey))
            .filter(|p| self.cache_profile(p.clone(), false).is_ok())
            .count();
        debug!("Prefetched {}/{} profiles", cached, batch.len());
        cached
    }

    /// Start the prefetch timer. Calling it again replaces the fetcher.
    pub fn start_prefetch(self: &Arc<Self>, fetcher: Arc<dyn ProfileFetcher>) {
        let weak = Arc::downgrade(self);
        let handle = self
            .scheduler
            .every("profile-prefetch", PREFETCH_INTERVAL, move || {
                let weak = weak.clone();
                let fetcher = fetcher.clone();
                async move {
                    if let Some(cache) = weak.upgrade() {
                        cache.run_prefetch(fetcher.as_ref()).await;
                    }
                }
            });

        let previous = self
            .prefetch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
        info!("Profile prefetch every {:?}", PREFETCH_INTERVAL);
    }

    /// Drop the `n` oldest non-important profiles.
    pub fn trim_oldest(&self, n: usize) -> usize {
        let removed = self.inner.remove_oldest_non_important(n);
        self.sync_hot_tier();
        removed
    }

    /// Drop every profile, hot tier and prefetch queue included.
    pub fn clear(&self) {
        self.inner.clear();
        self.hot.invalidate_all();
        self.access_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.prefetch_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Sweep expired profiles.
    pub fn cleanup_expired_entries(&self) -> usize {
        let removed = self.inner.cleanup_expired_entries();
        if removed > 0 {
            self.sync_hot_tier();
        }
        removed
    }

    /// Stop the prefetch timer.
    pub fn cleanup(&self) {
        self.prefetch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.scheduler.shutdown();
    }

    /// The underlying tier.
    pub fn tier(&self) -> &BaseCache<Profile> {
        &self.inner
    }

    /// Tier counters.
    pub fn stats(&self) -> TierStats {
        self.inner.stats()
    }

    fn sync_hot_tier(&self) {
        let evicted: Vec<String> = self
            .hot
            .iter()
            .map(|(k, _)| (*k).clone())
            .filter(|k| !self.inner.contains(k))
            .collect();
        let mut counts = self.access_counts.lock().unwrap_or_else(|e| e.into_inner());
        for key in evicted {
            self.hot.invalidate(&key);
            counts.remove(&key);
        }
        counts.retain(|k, _| self.inner.contains(k));
    }
}

/// Hex pubkeys mentioned in `text`, as `nostr:npub1…`, `npub1…` or 64-char
/// hex. Order of first appearance, no duplicates.
pub fn bio_mentions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for word in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        let key = if word.starts_with("npub1") {
            decode_npub(word)
        } else if is_hex_key(word) {
            Some(word.to_ascii_lowercase())
        } else {
            None
        };
        if let Some(key) = key {
            if !found.contains(&key) {
                found.push(key);
            }
        }
    }
    found
}

/// Decode an `npub1…` string to a hex pubkey.
pub fn decode_npub(npub: &str) -> Option<String> {
    let (hrp, data) = bech32::decode(npub).ok()?;
    if hrp != Hrp::parse_unchecked("npub") || data.len() != 32 {
        return None;
    }
    Some(data.iter().map(|b| format!("{:02x}", b)).collect())
}
