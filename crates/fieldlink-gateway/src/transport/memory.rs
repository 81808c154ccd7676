//! In-process broker double.
//!
//! `MemoryTransport` plays the broker for tests and local tooling. It keeps
//! at most one live session, delivers injected messages to it when a
//! subscription matches, echoes the session's own publishes back the way a
//! real broker does, and lets the caller script failures: refused or hanging
//! handshakes or subscribes, rejected publishes, dropped or closed
//! connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use super::{
    InboundMessage, InboundStream, Transport, TransportError, TransportLink, TransportResult,
    TransportSession,
};
use crate::config::BrokerOptions;
use crate::topic;

type Delivery = TransportResult<InboundMessage>;

/// In-memory broker implementing [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryBroker>,
}

struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_session: AtomicU64,
    published_tx: broadcast::Sender<InboundMessage>,
}

#[derive(Default)]
struct BrokerState {
    fail_connects: u32,
    hang_connects: bool,
    hang_subscribes: bool,
    reject_publishes: bool,
    echo: bool,
    connect_count: u32,
    disconnect_count: u32,
    client_ids: Vec<String>,
    published: Vec<InboundMessage>,
    session: Option<ActiveSession>,
}

struct ActiveSession {
    id: u64,
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ActiveSession {
    fn deliver(&self, message: InboundMessage) -> bool {
        if self.patterns.iter().any(|p| topic::matches(p, &message.topic)) {
            self.tx.send(Ok(message)).is_ok()
        } else {
            false
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBroker {
                state: Mutex::new(BrokerState {
                    echo: true,
                    ..BrokerState::default()
                }),
                next_session: AtomicU64::new(1),
                published_tx: broadcast::channel(256).0,
            }),
        }
    }

    /// Refuse the next `count` handshakes.
    pub fn fail_connects(&self, count: u32) {
        self.inner.state.lock().fail_connects = count;
    }

    /// Make handshakes hang forever (until the caller's timeout fires).
    pub fn hang_connects(&self, hang: bool) {
        self.inner.state.lock().hang_connects = hang;
    }

    /// Make subscribe requests hang forever.
    pub fn hang_subscribes(&self, hang: bool) {
        self.inner.state.lock().hang_subscribes = hang;
    }

    /// Reject every publish on the live session.
    pub fn reject_publishes(&self, reject: bool) {
        self.inner.state.lock().reject_publishes = reject;
    }

    /// Whether the session's own publishes are delivered back to it.
    pub fn set_echo(&self, echo: bool) {
        self.inner.state.lock().echo = echo;
    }

    /// Number of handshakes attempted so far.
    pub fn connect_count(&self) -> u32 {
        self.inner.state.lock().connect_count
    }

    /// Number of sessions the client closed itself.
    pub fn disconnect_count(&self) -> u32 {
        self.inner.state.lock().disconnect_count
    }

    /// Client ids presented by every handshake, in order.
    pub fn client_ids(&self) -> Vec<String> {
        self.inner.state.lock().client_ids.clone()
    }

    /// Whether a session is currently live.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    /// Every message published by the gateway, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.inner.state.lock().published.clone()
    }

    /// Stream of messages published by the gateway from now on.
    pub fn published_stream(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.published_tx.subscribe()
    }

    /// Patterns subscribed on the live session.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.patterns.clone())
            .unwrap_or_default()
    }

    /// Deliver a message as if a device published it.
    ///
    /// Returns `true` if a live session was subscribed to the topic.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> bool {
        let message = InboundMessage::new(topic, payload);
        let state = self.inner.state.lock();
        match &state.session {
            Some(session) => session.deliver(message),
            None => false,
        }
    }

    /// Deliver a JSON payload as if a device published it.
    pub fn inject_json(&self, topic: impl Into<String>, payload: &serde_json::Value) -> bool {
        self.inject(topic, payload.to_string())
    }

    /// Kill the live session with a network error.
    pub fn drop_connection(&self) -> bool {
        self.end_session(TransportError::Io("connection reset by peer".to_string()))
    }

    /// Close the live session cleanly from the broker side.
    pub fn close_connection(&self) -> bool {
        self.end_session(TransportError::Closed)
    }

    fn end_session(&self, error: TransportError) -> bool {
        let session = self.inner.state.lock().session.take();
        match session {
            Some(session) => {
                let _ = session.tx.send(Err(error));
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _options: &BrokerOptions,
        client_id: &str,
    ) -> TransportResult<TransportSession> {
        // Handshakes never complete synchronously
        tokio::task::yield_now().await;

        let hang = {
            let mut state = self.inner.state.lock();
            state.connect_count += 1;
            state.client_ids.push(client_id.to_string());
            if !state.hang_connects && state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(TransportError::Refused("broker unavailable".to_string()));
            }
            state.hang_connects
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.inner.state.lock().session.replace(ActiveSession {
            id,
            patterns: Vec::new(),
            tx,
        });
        if let Some(previous) = previous {
            let _ = previous.tx.send(Err(TransportError::Closed));
        }
        trace!(client_id, session = id, "memory session opened");

        Ok(TransportSession {
            link: Arc::new(MemoryLink {
                broker: Arc::clone(&self.inner),
                session_id: id,
            }),
            inbound: Box::new(MemoryInbound { rx }),
        })
    }
}

struct MemoryLink {
    broker: Arc<MemoryBroker>,
    session_id: u64,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        let message = InboundMessage::new(topic, payload);
        {
            let mut state = self.broker.state.lock();
            if state.session.as_ref().map(|s| s.id) != Some(self.session_id) {
                return Err(TransportError::NotConnected);
            }
            if state.reject_publishes {
                return Err(TransportError::Rejected("publish rejected by broker".to_string()));
            }
            state.published.push(message.clone());
            if state.echo {
                if let Some(session) = &state.session {
                    session.deliver(message.clone());
                }
            }
        }
        let _ = self.broker.published_tx.send(message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> TransportResult<()> {
        let hang = self.broker.state.lock().hang_subscribes;
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.broker.state.lock();
        match state.session.as_mut() {
            Some(session) if session.id == self.session_id => {
                if !session.patterns.iter().any(|p| p == pattern) {
                    session.patterns.push(pattern.to_string());
                }
                Ok(())
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        if state.session.as_ref().map(|s| s.id) != Some(self.session_id) {
            return Err(TransportError::NotConnected);
        }
        if let Some(session) = state.session.take() {
            let _ = session.tx.send(Err(TransportError::Closed));
        }
        state.disconnect_count += 1;
        Ok(())
    }
}

struct MemoryInbound {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl InboundStream for MemoryInbound {
    async fn recv(&mut self) -> TransportResult<InboundMessage> {
        match self.rx.recv().await {
            Some(delivery) => delivery,
            None => Err(TransportError::Closed),
        }
    }
}
