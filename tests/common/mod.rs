//! Common test utilities for relay-mesh integration tests.
//!
//! Builds clients over an in-process [`MemoryTransport`], a [`MemoryStore`]
//! and a [`ManualClock`] so tests control relays, storage and time.

#![allow(dead_code)]

use std::sync::Arc;

use relay_mesh::{
    ClientConfig, Event, ManualClock, MemoryStore, MemoryTransport, MetricsService, RelayClient,
    SharedClock, KIND_TEXT_NOTE,
};

// ========== Test Configuration ==========

/// Clock start used by every harness (ms).
pub const START_MS: u64 = 1_700_000_000_000;

/// Relays the harness configures as defaults.
pub const RELAY_A: &str = "wss://a.example.com";
pub const RELAY_B: &str = "wss://b.example.com";
pub const RELAY_C: &str = "wss://c.example.com";

/// Configuration with [`RELAY_A`] and [`RELAY_B`] as default relays.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.relays.default_relays = vec![RELAY_A.to_string(), RELAY_B.to_string()];
    config
}

// ========== Test Fixtures ==========

/// A client plus handles on everything it was built from.
pub struct TestHarness {
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub client: Arc<RelayClient>,
}

impl TestHarness {
    /// Harness over three reachable relays and an unbounded store.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Harness over three reachable relays and the given store.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let transport = Arc::new(MemoryTransport::with_relays(&[RELAY_A, RELAY_B, RELAY_C]));
        Self::build(transport, store, START_MS)
    }

    /// Build a second client over the same relays and storage, as after a
    /// restart `elapsed_ms` later.
    pub fn restart(&self, elapsed_ms: u64) -> Self {
        Self::build(
            self.transport.clone(),
            self.store.clone(),
            START_MS + elapsed_ms,
        )
    }

    fn build(transport: Arc<MemoryTransport>, store: Arc<MemoryStore>, now_ms: u64) -> Self {
        let (clock, shared): (Arc<ManualClock>, SharedClock) = ManualClock::shared(now_ms);
        let client = RelayClient::new(
            test_config(),
            transport.clone(),
            store.clone(),
            shared,
            Arc::new(MetricsService::disabled()),
        )
        .expect("test config is valid");
        Self {
            transport,
            store,
            clock,
            client,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex key made of a repeated character.
pub fn key(c: char) -> String {
    std::iter::repeat(c).take(64).collect()
}

/// Hex id derived from a number.
pub fn id(n: u64) -> String {
    format!("{:064x}", n)
}

/// Text note with the given id number, author and timestamp.
pub fn note(n: u64, author: char, created_at: u64) -> Event {
    Event {
        id: id(n),
        pubkey: key(author),
        created_at,
        kind: KIND_TEXT_NOTE,
        tags: vec![],
        content: format!("note {}", n),
        sig: String::new(),
    }
}
