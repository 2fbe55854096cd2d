//! Cache facade.
//!
//! Write paths never fail the caller: a tier write error is logged and
//! retried once with a smaller payload, and the result is reported as a
//! `bool`. Batches are shrunk before writing while storage is under
//! pressure, and the quota timer escalates to an emergency cleanup when
//! usage reaches the danger threshold.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::base::TierStats;
use super::event::{EventCache, EventQuery};
use super::feed::{FeedCache, FeedParams};
use super::list::ListCache;
use super::profile::{ProfileCache, ProfileFetcher};
use super::quota::{QuotaLevel, QuotaMonitor};
use super::thread::ThreadCache;
use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::event::{Event, Profile, ThreadData};
use crate::metrics::MetricsService;
use crate::persistence::Store;
use crate::scheduler::Scheduler;

/// Snapshot of every tier and of storage usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Event tier.
    pub events: TierStats,
    /// Profile tier.
    pub profiles: TierStats,
    /// Thread tier.
    pub threads: TierStats,
    /// Feed tier.
    pub feeds: TierStats,
    /// List tier.
    pub lists: TierStats,
    /// Bytes used in the store.
    pub used_bytes: u64,
    /// Store quota in bytes.
    pub quota_bytes: u64,
    /// Current quota level.
    pub quota_level: QuotaLevel,
    /// Whether offline expiry is in effect.
    pub offline: bool,
}

impl CacheStats {
    /// Entries across all tiers.
    pub fn total_entries(&self) -> usize {
        self.events.entries
            + self.profiles.entries
            + self.threads.entries
            + self.feeds.entries
            + self.lists.entries
    }
}

/// Owns every cache tier.
pub struct ContentCache {
    config: CacheConfig,
    events: EventCache,
    profiles: Arc<ProfileCache>,
    threads: ThreadCache,
    feeds: FeedCache,
    lists: ListCache,
    quota: QuotaMonitor,
    metrics: Arc<MetricsService>,
    scheduler: Scheduler,
    offline: AtomicBool,
}

impl ContentCache {
    /// Create the facade and its tiers over `store`.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn Store>,
        clock: SharedClock,
        metrics: Arc<MetricsService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            events: EventCache::new(config.events, clock.clone(), store.clone(), metrics.clone()),
            profiles: Arc::new(ProfileCache::new(
                config.profiles,
                clock.clone(),
                store.clone(),
                metrics.clone(),
            )),
            threads: ThreadCache::new(config.threads, clock.clone(), store.clone(), metrics.clone()),
            feeds: FeedCache::new(config.feeds, clock.clone(), store.clone(), metrics.clone()),
            lists: ListCache::new(config.lists, clock, store.clone(), metrics.clone()),
            quota: QuotaMonitor::new(store, config.warning_threshold, config.danger_threshold),
            metrics,
            scheduler: Scheduler::new(),
            offline: AtomicBool::new(false),
            config,
        })
    }

    /// Start the cleanup and quota timers, and profile prefetch when a
    /// fetcher is given.
    pub fn start(self: &Arc<Self>, fetcher: Option<Arc<dyn ProfileFetcher>>) {
        let weak = Arc::downgrade(self);
        self.scheduler.every(
            "cache-cleanup",
            Duration::from_secs(self.config.cleanup_interval_secs.max(1)),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(cache) = weak.upgrade() {
                        cache.cleanup_expired_entries();
                    }
                }
            },
        );

        let weak = Arc::downgrade(self);
        self.scheduler.every(
            "cache-quota-check",
            Duration::from_secs(self.config.quota_check_interval_secs.max(1)),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(cache) = weak.upgrade() {
                        cache.check_quota();
                    }
                }
            },
        );

        if let Some(fetcher) = fetcher {
            self.profiles.start_prefetch(fetcher);
        }
        info!(
            "Content cache timers started (cleanup every {}s, quota check every {}s)",
            self.config.cleanup_interval_secs, self.config.quota_check_interval_secs
        );
    }

    // ========== Events ==========

    /// Cache one event.
    pub fn cache_event(&self, event: Event, important: bool) -> bool {
        match self.events.cache_event(event.clone(), important) {
            Ok(()) => true,
            // A single event cannot shrink; keep it in memory only.
            Err(e) => self.retry_reduced("event", e, || self.events.cache_event(event, false)),
        }
    }

    /// Cache a batch of events. Under storage pressure only the newest
    /// events are written.
    pub fn cache_events(&self, events: Vec<Event>, important: bool) -> bool {
        if events.is_empty() {
            return true;
        }
        let events = self.fit_batch(events);
        match self.events.cache_events(events.clone(), important) {
            Ok(()) => true,
            Err(e) => self.retry_reduced("event", e, || {
                self.events.cache_events(newest_half(events), important)
            }),
        }
    }

    /// Event by id.
    pub fn get_event(&self, id: &str) -> Option<Event> {
        self.events.get_event(id)
    }

    /// Cached events by any of `pubkeys`, newest first.
    pub fn get_events_by_authors(&self, pubkeys: &[String]) -> Vec<Event> {
        self.events.get_events_by_authors(pubkeys)
    }

    /// Cached events tagged `#tag`, newest first.
    pub fn get_events_by_hashtag(&self, tag: &str) -> Vec<Event> {
        self.events.get_events_by_hashtag(tag)
    }

    /// Cached events matching `query`, newest first.
    pub fn get_filtered_events(&self, query: &EventQuery) -> Vec<Event> {
        self.events.get_filtered_events(query)
    }

    // ========== Profiles ==========

    /// Cache a profile.
    pub fn cache_profile(&self, profile: Profile, important: bool) -> bool {
        match self.profiles.cache_profile(profile.clone(), important) {
            Ok(()) => true,
            Err(e) => self.retry_reduced("profile", e, || {
                self.profiles.cache_profile(profile.essential(), important)
            }),
        }
    }

    /// Profile by pubkey.
    pub fn get_profile(&self, pubkey: &str) -> Option<Profile> {
        self.profiles.get_profile(pubkey)
    }

    // ========== Threads ==========

    /// Cache a thread.
    pub fn cache_thread(&self, root_id: &str, events: Vec<Event>, important: bool) -> bool {
        match self.threads.cache_thread(root_id, events.clone(), important) {
            Ok(()) => true,
            Err(e) => self.retry_reduced("thread", e, || {
                let (root, replies): (Vec<Event>, Vec<Event>) =
                    events.into_iter().partition(|ev| ev.id == root_id);
                let mut reduced = root;
                reduced.extend(newest_half(replies));
                self.threads.cache_thread(root_id, reduced, important)
            }),
        }
    }

    /// Thread by root id.
    pub fn get_thread(&self, root_id: &str) -> Option<ThreadData> {
        self.threads.get_thread(root_id)
    }

    // ========== Feeds ==========

    /// Cache a feed. Under storage pressure only the newest events are
    /// written.
    pub fn cache_feed(&self, params: &FeedParams, events: Vec<Event>, important: bool) -> bool {
        let events = self.fit_batch(events);
        match self.feeds.cache_feed(params, events.clone(), important) {
            Ok(()) => true,
            Err(e) => self.retry_reduced("feed", e, || {
                self.feeds.cache_feed(params, newest_half(events), important)
            }),
        }
    }

    /// Feed for `params`.
    pub fn get_feed(&self, params: &FeedParams) -> Option<Vec<Event>> {
        self.feeds.get_feed(params)
    }

    // ========== Lists ==========

    /// Cache a named list.
    pub fn cache_list(&self, name: &str, items: Vec<String>, important: bool) -> bool {
        match self.lists.cache_list(name, items.clone(), important) {
            Ok(()) => true,
            // Truncating a list would change its meaning; keep it in memory only.
            Err(e) => self.retry_reduced("list", e, || self.lists.cache_list(name, items, false)),
        }
    }

    /// List by name.
    pub fn get_list(&self, name: &str) -> Option<Vec<String>> {
        self.lists.get_list(name)
    }

    // ========== Maintenance ==========

    /// Sweep expired entries from every tier. Returns the total removed.
    pub fn cleanup_expired_entries(&self) -> usize {
        let events = self.events.tier().cleanup_expired_entries();
        let profiles = self.profiles.cleanup_expired_entries();
        let threads = self.threads.tier().cleanup_expired_entries();
        let feeds = self.feeds.tier().cleanup_expired_entries();
        let lists = self.lists.tier().cleanup_expired_entries();

        let total = events + profiles + threads + feeds + lists;
        if total > 0 {
            info!(
                "Cache cleanup removed {} entries (events={}, profiles={}, threads={}, feeds={}, lists={})",
                total, events, profiles, threads, feeds, lists
            );
        } else {
            debug!("Cache cleanup: nothing expired");
        }
        total
    }

    /// Check storage usage and clean up according to the level reached.
    pub fn check_quota(&self) -> QuotaLevel {
        let usage = self.quota.usage();
        let ratio = usage.ratio();
        self.metrics.storage_quota(ratio);

        let level = self.quota.level_for(ratio);
        match level {
            QuotaLevel::Danger => {
                warn!(
                    "Storage usage at {:.0}% ({} / {} bytes), running emergency cleanup",
                    ratio * 100.0,
                    usage.used_bytes,
                    usage.quota_bytes
                );
                self.emergency_cleanup();
            }
            QuotaLevel::Warning => {
                info!(
                    "Storage usage at {:.0}%, running cleanup",
                    ratio * 100.0
                );
                self.cleanup_expired_entries();
            }
            QuotaLevel::Normal => {
                debug!("Storage usage at {:.0}%", ratio * 100.0);
            }
        }
        level
    }

    /// Free as much as possible without touching important entries:
    /// every feed, every event and thread, and the oldest profiles.
    pub fn emergency_cleanup(&self) -> usize {
        let feeds = self.feeds.tier().purge_non_important();
        let events = self.events.tier().purge_non_important();
        let threads = self.threads.tier().purge_non_important();
        let profiles = self.profiles.trim_oldest(self.config.emergency_profile_trim);

        let total = feeds + events + threads + profiles;
        warn!(
            "Emergency cleanup removed {} entries (feeds={}, events={}, threads={}, profiles={})",
            total, feeds, events, threads, profiles
        );
        total
    }

    /// Switch every tier between standard and offline expiry.
    pub fn set_connectivity(&self, online: bool) {
        let offline = !online;
        if self.offline.swap(offline, Ordering::SeqCst) == offline {
            return;
        }
        self.events.tier().set_offline_mode(offline);
        self.profiles.tier().set_offline_mode(offline);
        self.threads.tier().set_offline_mode(offline);
        self.feeds.tier().set_offline_mode(offline);
        self.lists.tier().set_offline_mode(offline);
        info!(
            "Cache switched to {} mode",
            if offline { "offline" } else { "online" }
        );
    }

    /// Whether offline expiry is in effect.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Drop everything, persisted entries included.
    pub fn clear_all(&self) {
        self.events.tier().clear();
        self.profiles.clear();
        self.threads.tier().clear();
        self.feeds.tier().clear();
        self.lists.tier().clear();
        info!("All cache tiers cleared");
    }

    /// Counters for every tier plus storage usage.
    pub fn get_cache_stats(&self) -> CacheStats {
        let usage = self.quota.usage();
        CacheStats {
            events: self.events.stats(),
            profiles: self.profiles.stats(),
            threads: self.threads.stats(),
            feeds: self.feeds.stats(),
            lists: self.lists.stats(),
            used_bytes: usage.used_bytes,
            quota_bytes: usage.quota_bytes,
            quota_level: self.quota.level_for(usage.ratio()),
            offline: self.is_offline(),
        }
    }

    /// Restore important entries of every tier. Returns the total loaded.
    pub fn load_from_storage(&self) -> usize {
        let total = self.events.tier().load_from_storage()
            + self.profiles.tier().load_from_storage()
            + self.threads.tier().load_from_storage()
            + self.feeds.tier().load_from_storage()
            + self.lists.tier().load_from_storage();
        info!("Loaded {} cached entries from storage", total);
        total
    }

    /// Write important entries of every tier. Failures are logged.
    pub fn persist_to_storage(&self) -> usize {
        let results = [
            ("events", self.events.tier().persist_to_storage()),
            ("profiles", self.profiles.tier().persist_to_storage()),
            ("threads", self.threads.tier().persist_to_storage()),
            ("feeds", self.feeds.tier().persist_to_storage()),
            ("lists", self.lists.tier().persist_to_storage()),
        ];
        results
            .into_iter()
            .map(|(tier, result)| match result {
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to persist {} cache: {}", tier, e);
                    0
                }
            })
            .sum()
    }

    /// The profile tier.
    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.profiles
    }

    /// Stop every timer.
    pub fn shutdown(&self) {
        let cancelled = self.scheduler.shutdown();
        self.profiles.cleanup();
        debug!("Content cache stopped ({} timers cancelled)", cancelled);
    }

    fn fit_batch(&self, events: Vec<Event>) -> Vec<Event> {
        let cap = self.config.reduced_batch_size;
        if events.len() <= cap || self.quota.level() == QuotaLevel::Normal {
            return events;
        }
        info!(
            "Storage under pressure, caching {} newest of {} events",
            cap,
            events.len()
        );
        newest(events, cap)
    }

    fn retry_reduced(&self, tier: &str, error: Error, retry: impl FnOnce() -> Result<()>) -> bool {
        warn!(
            "Caching {} failed ({}), retrying with reduced payload",
            tier, error
        );
        match retry() {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping {} cache write: {}", tier, e);
                false
            }
        }
    }
}

fn newest(mut events: Vec<Event>, n: usize) -> Vec<Event> {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    events.truncate(n);
    events
}

fn newest_half(events: Vec<Event>) -> Vec<Event> {
    let n = (events.len() / 2).max(1);
    newest(events, n)
}
