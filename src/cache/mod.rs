//! Multi-tier content cache.
//!
//! Each tier is a [`BaseCache`] with its own expiry pair. [`ContentCache`]
//! owns one of each, watches storage quota and runs the periodic sweeps.

pub mod base;
pub mod content;
pub mod event;
pub mod feed;
pub mod list;
pub mod profile;
pub mod quota;
pub mod thread;

pub use base::{BaseCache, CacheEntry, TierStats};
pub use content::{CacheStats, ContentCache};
pub use event::{EventCache, EventQuery};
pub use feed::{FeedCache, FeedParams};
pub use list::ListCache;
pub use profile::{bio_mentions, decode_npub, ProfileCache, ProfileFetcher};
pub use quota::{QuotaLevel, QuotaMonitor};
pub use thread::ThreadCache;
