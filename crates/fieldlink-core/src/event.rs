//! Gateway event types.
//!
//! Every observable thing the gateway does is expressed as a [`GatewayEvent`]:
//! connection lifecycle transitions, per-message routing output and device
//! presence transitions. Collaborators subscribe to these through the
//! [`EventBus`](crate::eventbus::EventBus).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id
    pub event_id: String,
    /// Component that produced the event (e.g. "connection", "router")
    pub source: String,
    /// Publication time in epoch milliseconds
    pub timestamp: i64,
}

impl EventMetadata {
    /// Create metadata for a freshly published event.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Events emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A connection attempt started.
    Connecting { client_id: String },

    /// The broker acknowledged the session and subscriptions were re-issued.
    Connected { client_id: String },

    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },

    /// The transport session closed (deliberately or not).
    Closed,

    /// The gateway lost its connection unexpectedly.
    Offline,

    /// A transport or handshake error occurred.
    Error { message: String },

    /// Automatic reconnection gave up; a manual connect is required.
    ReconnectExhausted { attempts: u32 },

    /// Generic liveness signal, emitted for every routed device message.
    Heartbeat { device_id: String, timestamp: i64 },

    /// A status-bearing message arrived.
    Status { device_id: String, data: Value },

    /// Specific `category:action` event for a routed message.
    DeviceMessage {
        device_id: String,
        category: String,
        action: Option<String>,
        topic: String,
        data: Value,
        timestamp: i64,
    },

    /// Bare `action` event for a routed message.
    DeviceAction {
        device_id: String,
        action: String,
        data: Value,
        timestamp: i64,
    },

    /// Device transitioned to online.
    DeviceOnline { device_id: String, timestamp: i64 },

    /// Device transitioned to offline.
    DeviceOffline { device_id: String, timestamp: i64 },

    /// Device record was purged by the retention sweep.
    DeviceRemoved { device_id: String, timestamp: i64 },
}

impl GatewayEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "Connecting",
            Self::Connected { .. } => "Connected",
            Self::Reconnecting { .. } => "Reconnecting",
            Self::Closed => "Closed",
            Self::Offline => "Offline",
            Self::Error { .. } => "Error",
            Self::ReconnectExhausted { .. } => "ReconnectExhausted",
            Self::Heartbeat { .. } => "Heartbeat",
            Self::Status { .. } => "Status",
            Self::DeviceMessage { .. } => "DeviceMessage",
            Self::DeviceAction { .. } => "DeviceAction",
            Self::DeviceOnline { .. } => "DeviceOnline",
            Self::DeviceOffline { .. } => "DeviceOffline",
            Self::DeviceRemoved { .. } => "DeviceRemoved",
        }
    }

    /// Wire-level event name as seen by collaborators.
    ///
    /// Lifecycle events use their snake case names, routed messages use
    /// `category:action` (or just `category` for three segment topics) and
    /// bare actions use the action itself.
    pub fn event_name(&self) -> String {
        match self {
            Self::Connecting { .. } => "connecting".to_string(),
            Self::Connected { .. } => "connected".to_string(),
            Self::Reconnecting { .. } => "reconnecting".to_string(),
            Self::Closed => "closed".to_string(),
            Self::Offline => "offline".to_string(),
            Self::Error { .. } => "error".to_string(),
            Self::ReconnectExhausted { .. } => "reconnect_exhausted".to_string(),
            Self::Heartbeat { .. } => "heartbeat".to_string(),
            Self::Status { .. } => "status".to_string(),
            Self::DeviceMessage {
                category, action, ..
            } => match action {
                Some(action) => format!("{}:{}", category, action),
                None => category.clone(),
            },
            Self::DeviceAction { action, .. } => action.clone(),
            Self::DeviceOnline { .. } => "device_online".to_string(),
            Self::DeviceOffline { .. } => "device_offline".to_string(),
            Self::DeviceRemoved { .. } => "device_removed".to_string(),
        }
    }

    /// Device id carried by this event, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Heartbeat { device_id, .. }
            | Self::Status { device_id, .. }
            | Self::DeviceMessage { device_id, .. }
            | Self::DeviceAction { device_id, .. }
            | Self::DeviceOnline { device_id, .. }
            | Self::DeviceOffline { device_id, .. }
            | Self::DeviceRemoved { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// Check if this is a connection lifecycle event.
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. }
                | Self::Connected { .. }
                | Self::Reconnecting { .. }
                | Self::Closed
                | Self::Offline
                | Self::Error { .. }
                | Self::ReconnectExhausted { .. }
        )
    }

    /// Check if this is a presence transition event.
    pub fn is_presence_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceOnline { .. } | Self::DeviceOffline { .. } | Self::DeviceRemoved { .. }
        )
    }

    /// Check if this event was produced by routing an inbound device message.
    pub fn is_device_message(&self) -> bool {
        matches!(
            self,
            Self::Heartbeat { .. }
                | Self::Status { .. }
                | Self::DeviceMessage { .. }
                | Self::DeviceAction { .. }
        )
    }
}
