//! Transport seam between the gateway and the publish/subscribe broker.
//!
//! A [`Transport`] opens sessions. Each [`TransportSession`] is split into a
//! cloneable [`TransportLink`] for outbound operations and an
//! [`InboundStream`] that yields messages in arrival order until the session
//! ends. The gateway never reuses a session after it ended; reconnecting
//! always opens a new one.

pub mod memory;
pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::BrokerOptions;

pub use memory::MemoryTransport;
pub use mqtt::RumqttTransport;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Session ended cleanly
    #[error("Session closed")]
    Closed,

    /// Broker refused the handshake
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Network or protocol failure
    #[error("Transport error: {0}")]
    Io(String),

    /// Operation on a session that is gone
    #[error("Not connected")]
    NotConnected,

    /// Broker or client rejected the request
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Outbound half of a session.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Subscribe to a topic pattern.
    async fn subscribe(&self, pattern: &str) -> TransportResult<()>;

    /// End the session deliberately.
    async fn disconnect(&self) -> TransportResult<()>;
}

/// Inbound half of a session.
#[async_trait]
pub trait InboundStream: Send {
    /// Wait for the next message.
    ///
    /// Any `Err` ends the session: `Closed` for a clean close, anything else
    /// for a failure.
    async fn recv(&mut self) -> TransportResult<InboundMessage>;
}

/// An established session.
pub struct TransportSession {
    pub link: Arc<dyn TransportLink>,
    pub inbound: Box<dyn InboundStream>,
}

/// Factory for broker sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session and wait until the broker acknowledged it.
    async fn connect(
        &self,
        options: &BrokerOptions,
        client_id: &str,
    ) -> TransportResult<TransportSession>;
}
