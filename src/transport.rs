//! Relay transport seam.
//!
//! The rest of the crate only talks to relays through [`Transport`] and
//! [`Socket`]. [`WsTransport`] implements them over WebSockets with NIP-01
//! framing; [`MemoryTransport`] simulates relays in-process.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::{Event, Filter};

pub use memory::{MemorySocket, MemoryTransport};
pub use websocket::{WsTransport, WsTransportConfig};

/// Opaque id of an open subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message delivered to a subscription sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// An event matching the filter.
    Event {
        /// Relay the event came from.
        relay: String,
        /// The event.
        event: Event,
    },
    /// The relay has sent all stored events.
    Eose {
        /// Relay that finished.
        relay: String,
    },
    /// The relay closed the subscription or the connection dropped.
    Closed {
        /// Relay that closed.
        relay: String,
        /// Reason given, if any.
        reason: String,
    },
}

/// Channel that receives subscription messages.
pub type SubscriptionSink = mpsc::UnboundedSender<SubscriptionEvent>;

/// Per-relay result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Relay the event was sent to.
    pub relay: String,
    /// Whether the relay accepted the event.
    pub accepted: bool,
    /// Relay message, or the local error on failure.
    pub message: String,
    /// Time until the relay answered (ms).
    pub latency_ms: u64,
}

/// An open connection to one relay.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Relay URL.
    fn url(&self) -> &str;

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;

    /// Resolves once the connection has closed, for any reason.
    async fn closed(&self);

    /// Close the connection.
    async fn close(&self);
}

/// Pub/sub transport to relays.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or reuse) a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Arc<dyn Socket>>;

    /// Open a subscription on `relays`. Messages go to `sink` until
    /// [`Transport::unsubscribe`] is called.
    async fn subscribe(
        &self,
        relays: &[String],
        filter: &Filter,
        sink: SubscriptionSink,
    ) -> Result<SubscriptionId>;

    /// Close a subscription on every relay it was opened on.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()>;

    /// Send `event` to `relays` and collect one outcome per relay.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<Vec<PublishOutcome>>;

    /// Check reachability of `url` without keeping a connection.
    async fn probe(&self, url: &str) -> Result<()> {
        let socket = self.connect(url).await?;
        socket.close().await;
        Ok(())
    }
}
