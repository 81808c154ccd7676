//! Broker connection lifecycle.
//!
//! The [`ConnectionManager`] owns the single transport session of a gateway.
//! It re-issues every registered subscription after each (re)connect,
//! reconnects with exponential backoff after an unexpected loss, and gives
//! up after the configured number of attempts.
//!
//! Each session carries an epoch number. A loss is only acted upon if it
//! belongs to the current epoch, so a superseded session can never tear down
//! (or reject the commands of) a newer one.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fieldlink_core::{EventBus, GatewayEvent};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BrokerOptions, ReconnectPolicy};
use crate::error::{GatewayError, GatewayResult};
use crate::topic;
use crate::transport::{
    InboundMessage, InboundStream, Transport, TransportError, TransportLink, TransportSession,
};

const EVENT_SOURCE: &str = "connection";

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Receives everything a live session produces.
///
/// Messages are handed over one at a time in arrival order; the next message
/// is not read until `on_message` returns.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Handle one inbound message.
    async fn on_message(&self, message: InboundMessage);

    /// The session was lost or torn down. Runs before any reconnect is
    /// scheduled.
    fn on_connection_lost(&self);
}

/// Manages the broker session and its reconnection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: RwLock<BrokerOptions>,
    policy: ReconnectPolicy,
    event_bus: EventBus,
    state: RwLock<ConnectionState>,
    client_id: RwLock<String>,
    link: RwLock<Option<Arc<dyn TransportLink>>>,
    subscriptions: RwLock<BTreeSet<String>>,
    handler: RwLock<Option<Weak<dyn SessionHandler>>>,
    attempts: AtomicU32,
    epoch: AtomicU64,
    exhausted: AtomicBool,
    manual_stop: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        transport: Arc<dyn Transport>,
        options: BrokerOptions,
        policy: ReconnectPolicy,
        event_bus: EventBus,
    ) -> Self {
        let client_id = options.generate_client_id();
        Self {
            inner: Arc::new(Inner {
                transport,
                options: RwLock::new(options),
                policy,
                event_bus,
                state: RwLock::new(ConnectionState::Disconnected),
                client_id: RwLock::new(client_id),
                link: RwLock::new(None),
                subscriptions: RwLock::new(BTreeSet::new()),
                handler: RwLock::new(None),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                exhausted: AtomicBool::new(false),
                manual_stop: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                session_task: Mutex::new(None),
            }),
        }
    }

    /// Install the receiver of session traffic.
    pub fn set_handler(&self, handler: Weak<dyn SessionHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Connect to the broker.
    ///
    /// A no-op while connected or already connecting. A manual connect
    /// cancels any pending reconnect timer and clears an exhausted state.
    /// On failure the backoff loop is started and the handshake error is
    /// returned.
    pub async fn connect(&self) -> GatewayResult<()> {
        {
            let mut state = self.inner.state.write();
            if matches!(
                *state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                debug!(state = %*state, "Connect ignored, session already active");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        self.inner.manual_stop.store(false, Ordering::SeqCst);
        self.inner.exhausted.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        self.inner.discard_stale_session().await;

        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Connection attempt failed, scheduling reconnect");
                *self.inner.state.write() = ConnectionState::Disconnected;
                self.inner.spawn_reconnect();
                Err(e)
            }
        }
    }

    /// Tear the session down deliberately.
    ///
    /// Cancels pending reconnect timers, does not retry, and rejects every
    /// pending command with `ConnectionLost`.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_stop.store(true, Ordering::SeqCst);
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.cancel_reconnect();

        let link = inner.link.write().take();
        let had_link = link.is_some();
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                debug!(error = %e, "Transport disconnect failed");
            }
        }
        let session = inner.session_task.lock().take();
        if let Some(session) = session {
            session.abort();
        }

        let previous = std::mem::replace(&mut *inner.state.write(), ConnectionState::Disconnected);
        if let Some(handler) = inner.handler() {
            handler.on_connection_lost();
        }

        if had_link || previous != ConnectionState::Disconnected {
            info!("Disconnected from broker");
            inner.emit(GatewayEvent::Closed).await;
        }
    }

    /// Tear down and connect again with a fresh client id, optionally with
    /// new broker parameters.
    pub async fn reconnect(&self, new_options: Option<BrokerOptions>) -> GatewayResult<()> {
        if let Some(options) = &new_options {
            options.validate()?;
        }
        self.disconnect().await;

        if let Some(options) = new_options {
            *self.inner.options.write() = options;
        }
        let client_id = self.inner.options.read().generate_client_id();
        info!(client_id = %client_id, "Reconnecting with new client id");
        *self.inner.client_id.write() = client_id;

        self.connect().await
    }

    /// Publish a raw payload on the current session.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> GatewayResult<()> {
        if self.inner.exhausted.load(Ordering::SeqCst) {
            return Err(GatewayError::ReconnectExhausted(self.inner.policy.max_attempts));
        }
        let link = self.inner.link.read().clone();
        let link = link.ok_or_else(|| GatewayError::PublishFailure("not connected".to_string()))?;
        link.publish(topic, payload)
            .await
            .map_err(|e| GatewayError::PublishFailure(e.to_string()))
    }

    /// Register topic patterns. New patterns are subscribed immediately when
    /// connected, and all of them are re-issued after every reconnect.
    pub async fn add_subscriptions<I, S>(&self, patterns: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = Vec::new();
        for pattern in patterns {
            let pattern = pattern.into();
            topic::validate_pattern(&pattern)?;
            if self.inner.subscriptions.write().insert(pattern.clone()) {
                added.push(pattern);
            }
        }

        let link = self.inner.link.read().clone();
        if let Some(link) = link {
            for pattern in &added {
                match link.subscribe(pattern).await {
                    Ok(()) => debug!(pattern = %pattern, "Subscribed"),
                    Err(e) => warn!(pattern = %pattern, error = %e, "Subscribe failed"),
                }
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether automatic reconnection gave up.
    pub fn is_exhausted(&self) -> bool {
        self.inner.exhausted.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> String {
        self.inner.client_id.read().clone()
    }

    pub fn options(&self) -> BrokerOptions {
        self.inner.options.read().clone()
    }

    /// Registered subscription patterns, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.read().iter().cloned().collect()
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }
}

impl Inner {
    fn handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    async fn emit(&self, event: GatewayEvent) {
        self.event_bus.publish_with_source(event, EVENT_SOURCE).await;
    }

    fn cancel_reconnect(&self) {
        let task = self.reconnect_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Close a session left behind by an attempt that was cancelled after
    /// the handshake but before it reported `Connected`.
    async fn discard_stale_session(&self) {
        let session = self.session_task.lock().take();
        if let Some(session) = session {
            session.abort();
        }
        let link = self.link.write().take();
        if let Some(link) = link {
            debug!("Closing session of a cancelled connect attempt");
            if let Err(e) = link.disconnect().await {
                debug!(error = %e, "Transport disconnect failed");
            }
        }
    }

    /// One handshake attempt, bounded by the connect timeout.
    async fn establish(self: &Arc<Self>) -> GatewayResult<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let options = self.options.read().clone();
        let client_id = self.client_id.read().clone();

        info!(
            broker = %options.full_broker_addr(),
            client_id = %client_id,
            "Connecting to MQTT broker"
        );
        self.emit(GatewayEvent::Connecting {
            client_id: client_id.clone(),
        })
        .await;

        let timeout = options.connect_timeout();
        let handshake = self.transport.connect(&options, &client_id);
        let session = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                let message = e.to_string();
                self.emit(GatewayEvent::Error {
                    message: message.clone(),
                })
                .await;
                return Err(GatewayError::Connection(message));
            }
            Err(_) => {
                let message = format!("Connection timeout after {}ms", timeout.as_millis());
                self.emit(GatewayEvent::Error {
                    message: message.clone(),
                })
                .await;
                return Err(GatewayError::Connection(message));
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch || self.manual_stop.load(Ordering::SeqCst) {
            let _ = session.link.disconnect().await;
            return Err(GatewayError::Connection(
                "connection attempt superseded".to_string(),
            ));
        }

        let TransportSession { link, inbound } = session;
        *self.link.write() = Some(Arc::clone(&link));
        self.spawn_session(epoch, inbound);

        let patterns: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        for pattern in &patterns {
            if let Err(e) = link.subscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "Failed to re-issue subscription");
            }
        }

        // The session may already be gone again
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(GatewayError::Connection(
                "session lost during setup".to_string(),
            ));
        }

        *self.state.write() = ConnectionState::Connected;
        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        info!(client_id = %client_id, subscriptions = patterns.len(), "Connected to MQTT broker");
        self.emit(GatewayEvent::Connected { client_id }).await;
        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, epoch: u64, mut inbound: Box<dyn InboundStream>) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => match inner.handler() {
                        Some(handler) => handler.on_message(message).await,
                        None => debug!(topic = %message.topic, "No session handler, message dropped"),
                    },
                    Err(e) => {
                        inner.on_session_lost(epoch, e).await;
                        break;
                    }
                }
            }
        });

        let previous = self.session_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn on_session_lost(self: &Arc<Self>, epoch: u64, error: TransportError) {
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(epoch, "Ignoring loss of a superseded session");
            return;
        }
        if self.manual_stop.load(Ordering::SeqCst) {
            return;
        }

        *self.state.write() = ConnectionState::Disconnected;
        self.link.write().take();

        if let Some(handler) = self.handler() {
            handler.on_connection_lost();
        }

        match &error {
            TransportError::Closed => info!("Broker closed the session"),
            other => {
                warn!(error = %other, "MQTT connection lost");
                self.emit(GatewayEvent::Error {
                    message: other.to_string(),
                })
                .await;
            }
        }
        self.emit(GatewayEvent::Closed).await;
        self.emit(GatewayEvent::Offline).await;

        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.manual_stop.load(Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.reconnect_loop().await });

        let previous = self.reconnect_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.manual_stop.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.attempts.load(Ordering::SeqCst) + 1;
            if attempt > self.policy.max_attempts {
                let attempts = self.policy.max_attempts;
                warn!(attempts, "Reconnect attempts exhausted, manual connect required");
                self.exhausted.store(true, Ordering::SeqCst);
                *self.state.write() = ConnectionState::Disconnected;
                self.emit(GatewayEvent::ReconnectExhausted { attempts }).await;
                return;
            }
            self.attempts.store(attempt, Ordering::SeqCst);

            let delay = self.policy.delay_for(attempt);
            *self.state.write() = ConnectionState::Reconnecting;
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            self.emit(GatewayEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            })
            .await;

            tokio::time::sleep(delay).await;
            if self.manual_stop.load(Ordering::SeqCst) {
                return;
            }

            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "Reconnected to MQTT broker");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }
}
