//! In-memory relay network.
//!
//! Simulates a set of relays inside the process: reachability, connect
//! latency, stored events, write acceptance and dropped connections can all
//! be controlled. Used when running without network access and in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::{
    PublishOutcome, Socket, SubscriptionEvent, SubscriptionId, SubscriptionSink, Transport,
};
use crate::error::{Error, Result};
use crate::event::{Event, Filter};

#[derive(Debug, Clone)]
struct MemoryRelay {
    reachable: bool,
    accept_writes: bool,
    latency: Duration,
    events: Vec<Event>,
    connect_attempts: u32,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self {
            reachable: true,
            accept_writes: true,
            latency: Duration::ZERO,
            events: Vec::new(),
            connect_attempts: 0,
        }
    }
}

/// Connection to an in-memory relay.
pub struct MemorySocket {
    url: String,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MemorySocket {
    fn new(url: &str) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            url: url.to_string(),
            open: AtomicBool::new(true),
            closed_tx,
        }
    }

    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }
}

#[async_trait]
impl Socket for MemorySocket {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.shut();
    }
}

/// [`Transport`] backed by simulated relays.
#[derive(Default)]
pub struct MemoryTransport {
    relays: Mutex<HashMap<String, MemoryRelay>>,
    sockets: Mutex<HashMap<String, Arc<MemorySocket>>>,
    subscriptions: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryTransport {
    /// Create a network with no relays.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a network with the given reachable relays.
    pub fn with_relays(urls: &[&str]) -> Self {
        let transport = Self::new();
        for url in urls {
            transport.add_relay(url);
        }
        transport
    }

    fn with_relay<T>(&self, url: &str, f: impl FnOnce(&mut MemoryRelay) -> T) -> T {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        f(relays.entry(url.to_string()).or_default())
    }

    /// Add a reachable relay.
    pub fn add_relay(&self, url: &str) {
        self.with_relay(url, |_| ());
    }

    /// Make a relay reachable or not. Making it unreachable drops any open
    /// connection to it.
    pub fn set_reachable(&self, url: &str, reachable: bool) {
        self.with_relay(url, |r| r.reachable = reachable);
        if !reachable {
            self.drop_connection(url);
        }
    }

    /// Delay every connect to `url` by `latency`.
    pub fn set_latency(&self, url: &str, latency: Duration) {
        self.with_relay(url, |r| r.latency = latency);
    }

    /// Whether `url` accepts published events.
    pub fn set_accept_writes(&self, url: &str, accept: bool) {
        self.with_relay(url, |r| r.accept_writes = accept);
    }

    /// Store an event on `url` so subscriptions receive it.
    pub fn store_event(&self, url: &str, event: Event) {
        self.with_relay(url, |r| r.events.push(event));
    }

    /// Events held by `url`.
    pub fn events(&self, url: &str) -> Vec<Event> {
        self.with_relay(url, |r| r.events.clone())
    }

    /// Connection attempts made to `url`.
    pub fn connect_attempts(&self, url: &str) -> u32 {
        self.with_relay(url, |r| r.connect_attempts)
    }

    /// Close the open connection to `url` from the relay side.
    pub fn drop_connection(&self, url: &str) {
        let socket = self
            .sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
        if let Some(socket) = socket {
            socket.shut();
        }
    }

    /// Number of subscriptions not yet closed.
    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn is_reachable(&self, url: &str) -> bool {
        self.relays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .map(|r| r.reachable)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Socket>> {
        let (reachable, latency) = {
            let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
            match relays.get_mut(url) {
                Some(relay) => {
                    relay.connect_attempts += 1;
                    (relay.reachable, relay.latency)
                }
                None => (false, Duration::ZERO),
            }
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !reachable {
            return Err(Error::Network(format!("Connection refused: {}", url)));
        }

        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sockets.get(url).filter(|s| s.is_open()) {
            return Ok(existing.clone() as Arc<dyn Socket>);
        }
        let socket = Arc::new(MemorySocket::new(url));
        sockets.insert(url.to_string(), socket.clone());
        Ok(socket as Arc<dyn Socket>)
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filter: &Filter,
        sink: SubscriptionSink,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId::generate();
        let mut opened = Vec::new();

        for relay in relays {
            if !self.is_reachable(relay) {
                continue;
            }
            let mut matching: Vec<Event> = self
                .events(relay)
                .into_iter()
                .filter(|e| filter.matches(e))
                .collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matching.truncate(limit as usize);
            }
            for event in matching {
                let _ = sink.send(SubscriptionEvent::Event {
                    relay: relay.clone(),
                    event,
                });
            }
            let _ = sink.send(SubscriptionEvent::Eose {
                relay: relay.clone(),
            });
            opened.push(relay.clone());
        }

        if opened.is_empty() {
            return Err(Error::Network("No reachable relay for subscription".to_string()));
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.0.clone(), opened);
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id.as_str());
        Ok(())
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<Vec<PublishOutcome>> {
        if relays.is_empty() {
            return Err(Error::Validation("No relays to publish to".to_string()));
        }

        let outcomes = relays
            .iter()
            .map(|relay| {
                let (accepted, message) = self.with_relay(relay, |r| {
                    if !r.reachable {
                        (false, "connection refused".to_string())
                    } else if !r.accept_writes {
                        (false, "restricted: writes not allowed".to_string())
                    } else {
                        r.events.push(event.clone());
                        (true, String::new())
                    }
                });
                PublishOutcome {
                    relay: relay.clone(),
                    accepted,
                    message,
                    latency_ms: 1,
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn probe(&self, url: &str) -> Result<()> {
        if self.is_reachable(url) {
            Ok(())
        } else {
            Err(Error::Network(format!("Connection refused: {}", url)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures;
    use tokio::sync::mpsc;

    const A: &str = "wss://a.example.com";
    const B: &str = "wss://b.example.com";

    #[tokio::test]
    async fn test_connect_and_drop() {
        let transport = MemoryTransport::with_relays(&[A]);

        let socket = transport.connect(A).await.unwrap();
        assert!(socket.is_open());
        assert!(transport.connect(B).await.is_err());

        transport.drop_connection(A);
        socket.closed().await;
        assert!(!socket.is_open());
        assert_eq!(transport.connect_attempts(A), 1);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_matching_events_then_eose() {
        let transport = MemoryTransport::with_relays(&[A, B]);
        transport.store_event(A, fixtures::tagged_note(1, 'a', 10, "rust"));
        transport.store_event(A, fixtures::note(2, 'a', 20));
        transport.set_reachable(B, false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let filter = Filter::new().hashtag("rust");
        let id = transport
            .subscribe(&[A.to_string(), B.to_string()], &filter, tx)
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(SubscriptionEvent::Event { ref event, .. }) if event.id == fixtures::id(1)
        ));
        assert!(matches!(rx.recv().await, Some(SubscriptionEvent::Eose { .. })));
        assert_eq!(transport.open_subscriptions(), 1);

        transport.unsubscribe(&id).await.unwrap();
        assert_eq!(transport.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_publish_outcomes() {
        let transport = MemoryTransport::with_relays(&[A, B]);
        transport.set_accept_writes(B, false);
        let event = fixtures::note(1, 'a', 10);

        let outcomes = transport
            .publish(&[A.to_string(), B.to_string()], &event)
            .await
            .unwrap();

        assert!(outcomes[0].accepted);
        assert!(!outcomes[1].accepted);
        assert_eq!(transport.events(A), vec![event]);
    }
}
