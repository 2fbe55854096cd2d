//! Feed tier.
//!
//! A feed is the event list produced by one combination of feed filters.
//! [`FeedParams::cache_key`] encodes every filter field, so two different
//! combinations never share an entry while the same combination always maps
//! to the same key regardless of author order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::base::{BaseCache, TierStats};
use crate::clock::SharedClock;
use crate::config::TierExpiry;
use crate::error::Result;
use crate::event::Event;
use crate::metrics::MetricsService;
use crate::persistence::{keys, Store};

/// Filters that produced a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedParams {
    /// Feed kind, e.g. "following" or "global".
    pub feed_type: String,
    /// Authors included.
    pub author_pubkeys: Vec<String>,
    /// Hashtag filter.
    pub hashtag: Option<String>,
    /// Lower time bound (unix secs).
    pub since: Option<u64>,
    /// Upper time bound (unix secs).
    pub until: Option<u64>,
    /// Only events carrying media.
    pub media_only: bool,
}

impl FeedParams {
    /// Feed of the given type with no other filters.
    pub fn new(feed_type: impl Into<String>) -> Self {
        Self {
            feed_type: feed_type.into(),
            ..Default::default()
        }
    }

    /// Deterministic key for this combination of filters.
    ///
    /// Encoded as a JSON array so free-text fields cannot bleed into their
    /// neighbours and an absent hashtag differs from an empty one.
    pub fn cache_key(&self) -> String {
        let mut authors = self.author_pubkeys.clone();
        authors.sort();
        authors.dedup();

        serde_json::json!([
            self.feed_type,
            authors,
            self.hashtag,
            self.since,
            self.until,
            self.media_only
        ])
        .to_string()
    }
}

/// Feeds keyed by [`FeedParams::cache_key`].
pub struct FeedCache {
    inner: BaseCache<Vec<Event>>,
}

impl FeedCache {
    /// Create the tier, persisting important feeds to `store`.
    pub fn new(
        expiry: TierExpiry,
        clock: SharedClock,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            inner: BaseCache::new("feeds", expiry, clock)
                .with_storage(store, keys::FEED_CACHE)
                .with_metrics(metrics),
        }
    }

    /// Cache the events of a feed.
    pub fn cache_feed(&self, params: &FeedParams, events: Vec<Event>, important: bool) -> Result<()> {
        self.inner.cache_item(&params.cache_key(), events, important)
    }

    /// Events of a feed.
    pub fn get_feed(&self, params: &FeedParams) -> Option<Vec<Event>> {
        self.inner.get_item(&params.cache_key())
    }

    /// The underlying tier.
    pub fn tier(&self) -> &BaseCache<Vec<Event>> {
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

    #[test]
    fn test_cache_key_distinguishes_every_field() {
        let base = FeedParams {
            feed_type: "following".to_string(),
            author_pubkeys: vec!["b".to_string(), "a".to_string()],
            ..Default::default()
        };
        let variants = [
            FeedParams {
                feed_type: "global".to_string(),
                ..base.clone()
            },
            FeedParams {
                author_pubkeys: vec!["a".to_string()],
                ..base.clone()
            },
            FeedParams {
                hashtag: Some("rust".to_string()),
                ..base.clone()
            },
            FeedParams {
                since: Some(1),
                ..base.clone()
            },
            FeedParams {
                until: Some(1),
                ..base.clone()
            },
            FeedParams {
                media_only: true,
                ..base.clone()
            },
        ];

        for variant in &variants {
            assert_ne!(variant.cache_key(), base.cache_key());
        }
        // since and until never collide with each other.
        assert_ne!(variants[3].cache_key(), variants[4].cache_key());
    }

    #[test]
    fn test_cache_key_ignores_author_order() {
        let a = FeedParams {
            author_pubkeys: vec!["b".to_string(), "a".to_string()],
            ..FeedParams::new("following")
        };
        let b = FeedParams {
            author_pubkeys: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            ..FeedParams::new("following")
        };
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_does_not_collide_on_separators() {
        let a = FeedParams {
            hashtag: Some("c".to_string()),
            ..FeedParams::new("a|b")
        };
        let b = FeedParams {
            author_pubkeys: vec!["b".to_string()],
            hashtag: Some("|c".to_string()),
            ..FeedParams::new("a")
        };
        assert_ne!(a.cache_key(), b.cache_key());

        let joined = FeedParams {
            author_pubkeys: vec!["x,y".to_string()],
            ..FeedParams::new("following")
        };
        let split = FeedParams {
            author_pubkeys: vec!["x".to_string(), "y".to_string()],
            ..FeedParams::new("following")
        };
        assert_ne!(joined.cache_key(), split.cache_key());
    }

    #[test]
    fn test_cache_key_separates_missing_and_empty_hashtag() {
        let none = FeedParams::new("global");
        let empty = FeedParams {
            hashtag: Some(String::new()),
            ..FeedParams::new("global")
        };
        assert_ne!(none.cache_key(), empty.cache_key());
    }
}
