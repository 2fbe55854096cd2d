//! relay-mesh Library
//!
//! Relay resilience and adaptive caching for decentralized pub/sub clients:
//! connection management with backoff, per-relay circuit breakers,
//! performance tracking, scored relay selection, relay discovery, a
//! periodic health sweep and a quota-aware multi-tier content cache.

pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod performance;
pub mod persistence;
pub mod relay_url;
pub mod scheduler;
pub mod selector;
pub mod transport;

pub use cache::{
    CacheStats, ContentCache, EventQuery, FeedParams, ProfileFetcher, QuotaLevel, TierStats,
};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use client::{RelayClient, UserRelay, DEFAULT_FETCH_WAIT};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    CacheConfig, CircuitConfig, ClientConfig, ConnectionConfig, HealthConfig, RelayListConfig,
    TierExpiry, DEFAULT_RELAYS,
};
pub use connection::{ConnectionManager, RelayMode, RelayRecord, RelayStatus};
pub use discovery::{RelayCounters, RelayDiscoverer};
pub use error::{Error, Result};
pub use event::{
    Event, Filter, Profile, ThreadData, KIND_METADATA, KIND_RELAY_LIST, KIND_TEXT_NOTE,
};
pub use health::HealthManager;
pub use metrics::{MetricsConfig, MetricsService, Timer};
pub use performance::{PerformanceTracker, RelayInfo, RelayPerformance};
pub use persistence::{MemoryStore, PersistenceConfig, RocksStore, StorageUsage, Store};
pub use relay_url::{normalize_relay_url, normalize_relay_urls};
pub use scheduler::Scheduler;
pub use selector::{RelaySelector, RelaySets, SelectionParams};
pub use transport::{
    MemoryTransport, PublishOutcome, Socket, SubscriptionEvent, SubscriptionId, Transport,
    WsTransport, WsTransportConfig,
};
