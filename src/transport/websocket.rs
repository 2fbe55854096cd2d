//! WebSocket transport with NIP-01 framing.
//!
//! One connection per relay URL. Each connection runs a writer task fed by
//! an unbounded channel and a reader task that routes `EVENT`, `EOSE` and
//! `CLOSED` frames to subscription sinks and `OK` frames to pending
//! publishes.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    PublishOutcome, Socket, SubscriptionEvent, SubscriptionId, SubscriptionSink, Transport,
};
use crate::error::{Error, Result};
use crate::event::{Event, Filter};
use crate::relay_url::normalize_relay_url;

/// Frame received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event(String, Value),
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok(String, bool, String),
    /// `["EOSE", <subscription_id>]`
    Eose(String),
    /// `["CLOSED", <subscription_id>, <message>]`
    Closed(String, String),
    /// `["NOTICE", <message>]`
    Notice(String),
}

impl RelayMessage {
    /// Parse a text frame. Unknown frame types yield `Ok(None)`.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Malformed(format!("Invalid relay frame: {}", e)))?;
        let arr = value
            .as_array()
            .ok_or_else(|| Error::Malformed("Relay frame is not an array".to_string()))?;

        let kind = arr.first().and_then(|v| v.as_str()).unwrap_or_default();
        let text_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        let malformed = || Error::Malformed(format!("Malformed {} frame", kind));

        let message = match kind {
            "EVENT" => RelayMessage::Event(
                text_at(1).ok_or_else(malformed)?,
                arr.get(2).cloned().ok_or_else(malformed)?,
            ),
            "OK" => RelayMessage::Ok(
                text_at(1).ok_or_else(malformed)?,
                arr.get(2).and_then(|v| v.as_bool()).ok_or_else(malformed)?,
                text_at(3).unwrap_or_default(),
            ),
            "EOSE" => RelayMessage::Eose(text_at(1).ok_or_else(malformed)?),
            "CLOSED" => RelayMessage::Closed(
                text_at(1).ok_or_else(malformed)?,
                text_at(2).unwrap_or_default(),
            ),
            "NOTICE" => RelayMessage::Notice(text_at(1).unwrap_or_default()),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Deadline for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Deadline for a relay's `OK` answer to a publish.
    pub publish_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

struct SubscriptionEntry {
    relays: Vec<String>,
    sink: SubscriptionSink,
}

type PendingKey = (String, String);

#[derive(Default)]
struct Routing {
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<(bool, String)>>>,
}

impl Routing {
    fn dispatch(&self, relay: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event(sub_id, raw) => {
                let event = match Event::from_value(raw) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("Skipping event from {}: {}", relay, e);
                        return;
                    }
                };
                self.send_to(
                    &sub_id,
                    SubscriptionEvent::Event {
                        relay: relay.to_string(),
                        event,
                    },
                );
            }
            RelayMessage::Eose(sub_id) => self.send_to(
                &sub_id,
                SubscriptionEvent::Eose {
                    relay: relay.to_string(),
                },
            ),
            RelayMessage::Closed(sub_id, reason) => self.send_to(
                &sub_id,
                SubscriptionEvent::Closed {
                    relay: relay.to_string(),
                    reason,
                },
            ),
            RelayMessage::Ok(event_id, accepted, message) => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&(relay.to_string(), event_id));
                if let Some(tx) = waiter {
                    let _ = tx.send((accepted, message));
                }
            }
            RelayMessage::Notice(notice) => info!("Notice from {}: {}", relay, notice),
        }
    }

    fn send_to(&self, sub_id: &str, event: SubscriptionEvent) {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let receiver_gone = subs
            .get(sub_id)
            .map(|entry| entry.sink.send(event).is_err())
            .unwrap_or(false);
        if receiver_gone {
            debug!("Subscription {} receiver dropped, removing", sub_id);
            subs.remove(sub_id);
        }
    }

    fn connection_lost(&self, relay: &str) {
        let subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for entry in subs.values().filter(|e| e.relays.iter().any(|r| r == relay)) {
            let _ = entry.sink.send(SubscriptionEvent::Closed {
                relay: relay.to_string(),
                reason: "connection closed".to_string(),
            });
        }
        drop(subs);

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(r, _), _| r != relay);
    }
}

/// One WebSocket connection.
pub struct WsConnection {
    url: String,
    outgoing: tokio::sync::mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl WsConnection {
    fn send_json(&self, value: &Value) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Network(format!("Connection to {} is closed", self.url)));
        }
        self.outgoing
            .send(Message::Text(value.to_string()))
            .map_err(|_| Error::Network(format!("Connection to {} is closed", self.url)))
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[async_trait]
impl Socket for WsConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(Message::Close(None));
            debug!("Closing connection to {}", self.url);
            // Give the writer a moment to flush the close frame.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.abort_tasks();
    }
}

/// [`Transport`] over WebSockets.
pub struct WsTransport {
    config: WsTransportConfig,
    connections: Mutex<HashMap<String, Arc<WsConnection>>>,
    routing: Arc<Routing>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(WsTransportConfig::default())
    }
}

impl WsTransport {
    /// Create a transport with no open connections.
    pub fn new(config: WsTransportConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            routing: Arc::new(Routing::default()),
        }
    }

    fn existing(&self, url: &str) -> Option<Arc<WsConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .filter(|c| c.is_open())
            .cloned()
    }

    async fn open(&self, url: &str) -> Result<Arc<WsConnection>> {
        let url = normalize_relay_url(url)?;
        if let Some(conn) = self.existing(&url) {
            return Ok(conn);
        }

        let (stream, _) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Timeout(self.config.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::Transport(format!("{}: {}", url, e)))?;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let open = Arc::new(AtomicBool::new(true));

        let writer = {
            let open = open.clone();
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    let is_close = matches!(msg, Message::Close(_));
                    if write.send(msg).await.is_err() || is_close {
                        break;
                    }
                }
                open.store(false, Ordering::SeqCst);
                let _ = closed_tx.send(true);
            })
        };

        let reader = {
            let open = open.clone();
            let routing = self.routing.clone();
            let relay = url.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match RelayMessage::parse(&text) {
                            Ok(Some(message)) => routing.dispatch(&relay, message),
                            Ok(None) => {}
                            Err(e) => debug!("Ignoring frame from {}: {}", relay, e),
                        },
                        Ok(Message::Ping(data)) => {
                            let _ = out_tx.send(Message::Pong(data));
                        }
                        Ok(Message::Close(_)) => {
                            info!("Relay {} closed connection", relay);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("WebSocket error from {}: {}", relay, e);
                            break;
                        }
                    }
                }
                open.store(false, Ordering::SeqCst);
                let _ = closed_tx.send(true);
                routing.connection_lost(&relay);
            })
        };

        let conn = Arc::new(WsConnection {
            url: url.clone(),
            outgoing: out_tx,
            open,
            closed_rx,
            tasks: Mutex::new(vec![writer.abort_handle(), reader.abort_handle()]),
        });

        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.clone(), conn.clone());
        debug!("WebSocket open: {}", url);
        Ok(conn)
    }

    async fn publish_one(&self, relay: &str, event: &Event) -> PublishOutcome {
        let start = Instant::now();
        let failed = |message: String| PublishOutcome {
            relay: relay.to_string(),
            accepted: false,
            message,
            latency_ms: start.elapsed().as_millis() as u64,
        };

        let conn = match self.open(relay).await {
            Ok(conn) => conn,
            Err(e) => return failed(e.to_string()),
        };

        let key = (conn.url.clone(), event.id.clone());
        let (tx, rx) = oneshot::channel();
        self.routing
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), tx);

        if let Err(e) = conn.send_json(&json!(["EVENT", event])) {
            self.routing
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            return failed(e.to_string());
        }

        match timeout(self.config.publish_timeout, rx).await {
            Ok(Ok((accepted, message))) => PublishOutcome {
                relay: relay.to_string(),
                accepted,
                message,
                latency_ms: start.elapsed().as_millis() as u64,
            },
            Ok(Err(_)) => failed("connection closed before OK".to_string()),
            Err(_) => {
                self.routing
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                failed(Error::Timeout(self.config.publish_timeout.as_millis() as u64).to_string())
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Socket>> {
        let conn = self.open(url).await?;
        Ok(conn as Arc<dyn Socket>)
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filter: &Filter,
        sink: SubscriptionSink,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId::generate();
        let mut opened = Vec::new();
        let mut last_error = None;

        self.routing
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.0.clone(),
                SubscriptionEntry {
                    relays: Vec::new(),
                    sink,
                },
            );

        let request = json!(["REQ", id.as_str(), filter]);
        for relay in relays {
            let sent = match self.open(relay).await {
                Ok(conn) => conn.send_json(&request).map(|_| conn.url.clone()),
                Err(e) => Err(e),
            };
            match sent {
                Ok(url) => opened.push(url),
                Err(e) => {
                    debug!("Subscription {} not opened on {}: {}", id, relay, e);
                    last_error = Some(e);
                }
            }
        }

        let mut subs = self
            .routing
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if opened.is_empty() {
            subs.remove(id.as_str());
            return Err(last_error
                .unwrap_or_else(|| Error::Validation("No relays to subscribe to".to_string())));
        }
        if let Some(entry) = subs.get_mut(id.as_str()) {
            entry.relays = opened;
        }
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        let entry = self
            .routing
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id.as_str());

        if let Some(entry) = entry {
            let close = json!(["CLOSE", id.as_str()]);
            for relay in &entry.relays {
                if let Some(conn) = self.existing(relay) {
                    let _ = conn.send_json(&close);
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<Vec<PublishOutcome>> {
        if relays.is_empty() {
            return Err(Error::Validation("No relays to publish to".to_string()));
        }
        let attempts = relays.iter().map(|relay| self.publish_one(relay, event));
        Ok(futures::future::join_all(attempts).await)
    }

    async fn probe(&self, url: &str) -> Result<()> {
        let url = normalize_relay_url(url)?;
        let (mut stream, _) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Timeout(self.config.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::Transport(format!("{}: {}", url, e)))?;
        let _ = stream.close(None).await;
        Ok(())
    }
}
