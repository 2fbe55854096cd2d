//! Integration tests for the relay client.
//!
//! These tests drive a [`RelayClient`] end to end over simulated relays:
//! - Circuit breaking and selection (Scenarios A and C)
//! - Quota-aware caching (Scenario B, Danger level)
//! - Relay management, connectivity changes and restart behaviour
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test client_integration_test
//! ```

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{id, key, note, TestHarness, RELAY_A, RELAY_B, RELAY_C};
use relay_mesh::{
    CircuitState, ContentCache, Event, FeedParams, Filter, MemoryStore, Profile, QuotaLevel,
    RelayMode, RelayStatus, SelectionParams, Store,
};

// ============================================================================
// Circuit Breaking and Selection
// ============================================================================

#[tokio::test]
async fn test_scenario_a_failing_relay_is_isolated_then_recovers() {
    let h = TestHarness::new();
    let r = RELAY_C.to_string();
    let r2 = RELAY_A.to_string();

    for _ in 0..3 {
        h.client.record_failure(&r);
    }
    assert_eq!(h.client.get_state(&r), CircuitState::Open);

    let selected = h
        .client
        .select_best_relays(&[r.clone(), r2.clone()], &SelectionParams::read(2));
    assert!(!selected.contains(&r), "open relay must not be selected");
    assert_eq!(selected, vec![r2]);

    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.client.get_state(&r), CircuitState::HalfOpen);

    h.client.record_success(&r);
    assert_eq!(h.client.get_state(&r), CircuitState::Closed);
}

#[tokio::test]
async fn test_open_circuit_stays_open_until_reset_timeout_passes() {
    let h = TestHarness::new();
    for _ in 0..3 {
        h.client.record_failure(RELAY_C);
    }

    h.clock.advance(Duration::from_secs(30));
    assert_eq!(h.client.get_state(RELAY_C), CircuitState::Open);

    h.clock.advance(Duration::from_millis(1));
    assert_eq!(h.client.get_state(RELAY_C), CircuitState::HalfOpen);

    h.client.record_failure(RELAY_C);
    assert_eq!(h.client.get_state(RELAY_C), CircuitState::Open);
}

#[tokio::test]
async fn test_selection_falls_back_to_defaults_when_everything_is_open() {
    let h = TestHarness::new();
    for relay in [RELAY_A, RELAY_B, RELAY_C] {
        for _ in 0..3 {
            h.client.record_failure(relay);
        }
    }

    let selected = h
        .client
        .select_best_relays(&[RELAY_C.to_string()], &SelectionParams::read(3));
    assert_eq!(selected, vec![RELAY_A.to_string(), RELAY_B.to_string()]);
    assert_eq!(h.client.get_state(RELAY_A), CircuitState::Closed);
    assert_eq!(h.client.get_state(RELAY_C), CircuitState::Open);
}

#[tokio::test]
async fn test_scenario_c_read_and_write_sets_are_disjoint() {
    let h = TestHarness::new();
    let candidates: Vec<String> = (0..6)
        .map(|n| format!("wss://relay{}.example.com", n))
        .collect();
    h.client.tracker().record_success(&candidates[0], 50);
    h.client.tracker().record_success(&candidates[1], 400);
    h.client.tracker().record_failure(&candidates[2]);

    for (reads, writes) in [(3, 3), (6, 6), (1, 5), (5, 1), (0, 2)] {
        let sets = h
            .client
            .select_relays_by_operation_type(&candidates, reads, writes);
        let write: HashSet<&String> = sets.write.iter().collect();
        assert!(
            sets.read.iter().all(|url| !write.contains(url)),
            "read {:?} overlaps write {:?}",
            sets.read,
            sets.write
        );
    }
}

#[tokio::test]
async fn test_fastest_relay_prefers_lowest_latency() {
    let h = TestHarness::new();
    h.client.tracker().record_success(RELAY_A, 300);
    h.client.tracker().record_success(RELAY_B, 40);
    h.client.tracker().record_success(RELAY_C, 90);

    let candidates = vec![RELAY_A.to_string(), RELAY_B.to_string(), RELAY_C.to_string()];
    assert_eq!(
        h.client.find_fastest_relay(&candidates),
        Some(RELAY_B.to_string())
    );

    for _ in 0..3 {
        h.client.record_failure(RELAY_B);
    }
    assert_eq!(
        h.client.find_fastest_relay(&candidates),
        Some(RELAY_C.to_string())
    );
}

// ============================================================================
// Caching Under Storage Pressure
// ============================================================================

#[tokio::test]
async fn test_scenario_b_batch_under_warning_quota_keeps_newest_twenty() {
    let store = Arc::new(MemoryStore::with_quota(100_000));
    store.put("filler", &vec![0u8; 72_000]).unwrap();
    let h = TestHarness::with_store(store.clone());
    assert_eq!(h.client.cache().check_quota(), QuotaLevel::Warning);

    let events: Vec<Event> = (1..=50).map(|n| note(n, 'a', 1_000 + n)).collect();
    assert!(h.client.cache().cache_events(events, true));

    // Read back what actually reached storage.
    let restarted = h.restart(0);
    assert_eq!(restarted.client.cache().load_from_storage(), 20);
    let persisted = restarted.client.cache().get_events_by_authors(&[key('a')]);
    assert_eq!(persisted.len(), 20);
    let oldest = persisted.iter().map(|e| e.created_at).min().unwrap();
    assert_eq!(oldest, 1_031);
}

#[tokio::test]
async fn test_danger_quota_purges_everything_but_important_entries() {
    let store = Arc::new(MemoryStore::with_quota(200_000));
    let h = TestHarness::with_store(store.clone());
    let cache = h.client.cache();

    assert!(cache.cache_event(note(1, 'a', 1), true));
    for n in 2..=10 {
        cache.cache_event(note(n, 'a', n), false);
    }
    cache.cache_feed(&FeedParams::new("global"), vec![note(11, 'b', 11)], false);
    cache.cache_thread(&id(12), vec![note(12, 'c', 12)], false);
    cache.cache_profile(
        Profile {
            pubkey: key('d'),
            name: Some("d".to_string()),
            ..Default::default()
        },
        true,
    );

    let used = store.usage().used_bytes;
    store
        .put("filler", &vec![0u8; (180_000 - used) as usize])
        .unwrap();
    assert_eq!(cache.check_quota(), QuotaLevel::Danger);

    let stats = cache.get_cache_stats();
    assert_eq!(stats.events.entries, 1);
    assert_eq!(stats.feeds.entries, 0);
    assert_eq!(stats.threads.entries, 0);
    assert_eq!(stats.profiles.entries, 1);
    assert!(cache.get_event(&id(1)).is_some());
    assert!(cache.get_profile(&key('d')).is_some());
}

#[tokio::test]
async fn test_expiry_follows_the_simulated_clock() {
    let h = TestHarness::new();
    let cache = h.client.cache();
    cache.cache_event(note(1, 'a', 1), false);
    cache.cache_event(note(2, 'a', 2), true);

    h.clock.advance(Duration::from_secs(9 * 60));
    assert!(cache.get_event(&id(1)).is_some());

    h.clock.advance(Duration::from_secs(2 * 60));
    assert!(cache.get_event(&id(1)).is_none());
    assert!(cache.get_event(&id(2)).is_some(), "important entries use the long expiry");

    h.clock.advance(Duration::from_secs(24 * 60 * 60));
    assert!(cache.get_event(&id(2)).is_none());
    assert_eq!(
        cache.get_cache_stats().events.entries,
        1,
        "expired important entries are kept"
    );
}

#[tokio::test]
async fn test_offline_cache_serves_stale_data() {
    let h = TestHarness::new();
    let cache = h.client.cache();
    cache.cache_event(note(1, 'a', 1), false);

    h.client.set_connectivity(false).await;
    h.clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
    assert_eq!(cache.cleanup_expired_entries(), 0);
    assert!(cache.get_event(&id(1)).is_some());

    h.client.set_connectivity(true).await;
    assert!(cache.get_event(&id(1)).is_none());
}

// ============================================================================
// Relay Management
// ============================================================================

#[tokio::test]
async fn test_add_relay_twice_keeps_one_record_and_one_connection() {
    let h = TestHarness::new();

    assert!(h.client.add_relay(RELAY_C, RelayMode::READ_WRITE).await);
    assert!(h.client.add_relay(RELAY_C, RelayMode::READ_WRITE).await);

    let status = h.client.get_relay_status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].status, RelayStatus::Connected);
    assert_eq!(h.client.get_connected_relay_urls(), vec![RELAY_C.to_string()]);
    assert_eq!(h.transport.connect_attempts(RELAY_C), 1);
}

#[tokio::test]
async fn test_add_relay_rejects_invalid_url() {
    let h = TestHarness::new();
    assert!(!h.client.add_relay("http://not-a-relay", RelayMode::READ_WRITE).await);
    assert!(h.client.get_relay_status().is_empty());
}

#[tokio::test]
async fn test_add_multiple_relays_counts_connections() {
    let h = TestHarness::new();
    h.transport.set_reachable(RELAY_B, false);

    let connected = h
        .client
        .add_multiple_relays(&[RELAY_A.to_string(), RELAY_B.to_string(), RELAY_C.to_string()])
        .await;
    assert_eq!(connected, 2);
    assert_eq!(h.client.get_relay_status().len(), 3);
    h.client.shutdown().await;
}

#[tokio::test]
async fn test_offline_and_online_transitions() {
    let h = TestHarness::new();
    assert_eq!(h.client.connect_to_default_relays().await, 2);

    assert_eq!(h.client.set_connectivity(false).await, 0);
    assert!(!h.client.is_online());
    assert!(h.client.cache().is_offline());
    assert!(h.client.get_connected_relay_urls().is_empty());
    assert!(!h.client.publish(&note(1, 'a', 1)).await);

    assert_eq!(h.client.set_connectivity(true).await, 2);
    assert!(!h.client.cache().is_offline());
    assert!(h.client.publish(&note(1, 'a', 1)).await);
}

// ============================================================================
// Network Pipeline
// ============================================================================

#[tokio::test]
async fn test_publish_then_fetch_round_trip() {
    let h = TestHarness::new();
    h.client.connect_to_default_relays().await;

    let event = note(7, 'e', 70);
    assert!(h.client.publish(&event).await);

    let fetched = h
        .client
        .fetch_events(&Filter::new().ids(vec![id(7)]), Duration::from_secs(1))
        .await;
    assert_eq!(fetched, vec![event]);
}

#[tokio::test]
async fn test_fetch_learns_relays_from_relay_lists() {
    let h = TestHarness::new();
    h.client.connect_to_default_relays().await;

    let mut list = note(1, 'a', 10);
    list.kind = relay_mesh::KIND_RELAY_LIST;
    list.tags = vec![vec!["r".to_string(), "wss://learned.example.com".to_string()]];
    h.transport.store_event(RELAY_A, list);

    h.client
        .fetch_events(&Filter::new().authors(vec![key('a')]), Duration::from_secs(1))
        .await;
    assert!(h
        .client
        .discoverer()
        .known_relays()
        .contains(&"wss://learned.example.com".to_string()));
}

// ============================================================================
// Restart Behaviour
// ============================================================================

#[tokio::test]
async fn test_recent_snapshot_is_restored_on_start() {
    let h = TestHarness::new();
    assert_eq!(h.client.start().await, 2);
    assert!(h.client.add_relay(RELAY_C, RelayMode::READ_WRITE).await);
    h.client.shutdown().await;

    let restarted = h.restart(10_000);
    assert_eq!(restarted.client.start().await, 3);
    restarted.client.shutdown().await;
}

#[tokio::test]
async fn test_stale_snapshot_falls_back_to_user_relays() {
    let h = TestHarness::new();
    assert_eq!(h.client.start().await, 2);
    assert!(h.client.add_relay(RELAY_C, RelayMode::READ_WRITE).await);
    h.client.shutdown().await;

    let restarted = h.restart(60_000);
    assert_eq!(restarted.client.start().await, 1);
    assert_eq!(
        restarted.client.get_connected_relay_urls(),
        vec![RELAY_C.to_string()]
    );
    restarted.client.shutdown().await;
}

#[tokio::test]
async fn test_metrics_survive_restart() {
    let h = TestHarness::new();
    h.client.tracker().record_success(RELAY_A, 120);
    h.client.tracker().record_failure(RELAY_B);
    h.client.shutdown().await;

    let restarted = h.restart(1_000);
    assert_eq!(restarted.client.tracker().load(&*restarted.store), 2);

    let a = restarted.client.tracker().get_relay_performance(RELAY_A).unwrap();
    assert_eq!(a.avg_response_time, Some(120.0));
    let b = restarted.client.tracker().get_relay_performance(RELAY_B).unwrap();
    assert!(b.success_rate < 1.0);
}

#[tokio::test]
async fn test_important_cache_entries_survive_restart() {
    let h = TestHarness::new();
    h.client.cache().cache_event(note(1, 'a', 1), true);
    h.client.cache().cache_event(note(2, 'a', 2), false);
    h.client.cache().cache_list("follows", vec![key('b')], true);
    h.client.shutdown().await;

    let restarted = h.restart(1_000);
    let cache: &Arc<ContentCache> = restarted.client.cache();
    assert_eq!(cache.load_from_storage(), 2);
    assert!(cache.get_event(&id(1)).is_some());
    assert!(cache.get_event(&id(2)).is_none());
    assert_eq!(cache.get_list("follows"), Some(vec![key('b')]));
}
