//! Error types for gateway operations.

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error type for gateway operations.
///
/// Command-level failures (`ConnectionLost`, `Timeout`, `PublishFailure`,
/// `ReconnectExhausted`) are returned to the caller of a command; the caller
/// decides whether to retry. Only `Configuration` escapes gateway
/// construction.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The transport dropped while the command awaited its response
    #[error("Connection lost while awaiting response")]
    ConnectionLost,

    /// No correlated response arrived in time
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// The transport rejected the outbound write
    #[error("Publish failed: {0}")]
    PublishFailure(String),

    /// Automatic reconnection gave up
    #[error("Reconnect exhausted after {0} attempts, manual connect required")]
    ReconnectExhausted(u32),

    /// Inbound payload could not be decoded; wrapped as raw, never fatal
    #[error("Malformed payload on {topic}: {reason}")]
    MalformedPayload { topic: String, reason: String },

    /// Handshake with the broker failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Envelope encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
