//! Inbound message routing.
//!
//! The [`TopicRouter`] turns raw broker messages on `device/...` topics into
//! [`DeviceMessage`]s and fans them out as typed events, in a fixed order:
//! heartbeat, status (status-bearing categories only), the specific
//! `category:action` event, then the bare action event.

use chrono::{DateTime, Utc};
use fieldlink_core::config::topics::{COMMAND_CATEGORY, CORRELATION_FIELD, SOURCE_FIELD};
use fieldlink_core::{EventBus, GatewayEvent};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionManager;
use crate::error::{GatewayError, GatewayResult};
use crate::topic::DeviceTopic;
use crate::transport::InboundMessage;

const EVENT_SOURCE: &str = "router";

/// Decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Parsed JSON document
    Json(Value),
    /// Payload that is not valid JSON, kept as text
    Raw(String),
}

impl Payload {
    /// Decode bytes as JSON, falling back to the raw text.
    pub fn decode(topic: &str, bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                let err = GatewayError::MalformedPayload {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Wrapping payload as raw");
                Payload::Raw(text.into_owned())
            }
        }
    }

    /// Value handed to event consumers; raw payloads become `{"raw": text}`.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Raw(text) => json!({ "raw": text }),
        }
    }

    /// Top-level field of an object payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Payload::Json(Value::Object(map)) => map.get(name),
            _ => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }
}

/// A routed device message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMessage {
    pub device_id: String,
    pub topic: String,
    pub category: String,
    pub action: Option<String>,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl DeviceMessage {
    /// Correlation id echoed by a command response, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.field(CORRELATION_FIELD).and_then(Value::as_str)
    }

    /// Name of the bare action event.
    pub fn action_name(&self) -> &str {
        self.action.as_deref().unwrap_or(&self.category)
    }

    pub fn data(&self) -> Value {
        self.payload.to_value()
    }
}

/// Decodes and dispatches inbound device traffic.
pub struct TopicRouter {
    connection: ConnectionManager,
    event_bus: EventBus,
    source_tag: String,
    status_categories: Vec<String>,
}

impl TopicRouter {
    pub fn new(
        connection: ConnectionManager,
        event_bus: EventBus,
        source_tag: impl Into<String>,
        status_categories: Vec<String>,
    ) -> Self {
        Self {
            connection,
            event_bus,
            source_tag: source_tag.into(),
            status_categories,
        }
    }

    /// Register topic patterns with the broker session.
    pub async fn subscribe<I, S>(&self, patterns: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connection.add_subscriptions(patterns).await
    }

    /// Publish a JSON payload.
    pub async fn publish(&self, topic: &str, payload: &Value) -> GatewayResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.connection.publish(topic, bytes).await
    }

    /// Whether messages of `category` carry device status.
    pub fn is_status_category(&self, category: &str) -> bool {
        self.status_categories.iter().any(|c| c == category)
    }

    /// Decode a broker message without emitting anything.
    ///
    /// Returns `None` for topics outside the device namespace and for the
    /// gateway's own commands echoed back by the broker. Device traffic on
    /// any other category is kept even if it repeats the command envelope.
    pub fn decode(&self, message: &InboundMessage) -> Option<DeviceMessage> {
        let Some(parsed) = DeviceTopic::parse(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring message outside the device namespace");
            return None;
        };

        let payload = Payload::decode(&message.topic, &message.payload);
        if parsed.category == COMMAND_CATEGORY
            && payload
                .field(SOURCE_FIELD)
                .and_then(Value::as_str)
                .is_some_and(|source| source == self.source_tag)
        {
            trace!(topic = %message.topic, "Dropping echo of own publish");
            return None;
        }

        Some(DeviceMessage {
            device_id: parsed.device_id,
            topic: message.topic.clone(),
            category: parsed.category,
            action: parsed.action,
            payload,
            received_at: Utc::now(),
        })
    }

    /// Decode a broker message and emit its events.
    ///
    /// Each wire name is emitted at most once per message, so a three
    /// segment topic such as `device/d1/status` yields `heartbeat` and
    /// `status` rather than repeating `status` for the bare action.
    pub async fn route(&self, message: &InboundMessage) -> Option<DeviceMessage> {
        let routed = self.decode(message)?;
        let timestamp = routed.received_at.timestamp_millis();
        let data = routed.data();

        trace!(
            device_id = %routed.device_id,
            category = %routed.category,
            action = ?routed.action,
            "Routing device message"
        );

        let mut events = vec![GatewayEvent::Heartbeat {
            device_id: routed.device_id.clone(),
            timestamp,
        }];
        if self.is_status_category(&routed.category) {
            events.push(GatewayEvent::Status {
                device_id: routed.device_id.clone(),
                data: data.clone(),
            });
        }
        events.push(GatewayEvent::DeviceMessage {
            device_id: routed.device_id.clone(),
            category: routed.category.clone(),
            action: routed.action.clone(),
            topic: routed.topic.clone(),
            data: data.clone(),
            timestamp,
        });
        events.push(GatewayEvent::DeviceAction {
            device_id: routed.device_id.clone(),
            action: routed.action_name().to_string(),
            data,
            timestamp,
        });

        let mut emitted: Vec<String> = Vec::with_capacity(events.len());
        for event in events {
            let name = event.event_name();
            if emitted.contains(&name) {
                continue;
            }
            emitted.push(name);
            self.emit(event).await;
        }

        Some(routed)
    }

    async fn emit(&self, event: GatewayEvent) {
        self.event_bus.publish_with_source(event, EVENT_SOURCE).await;
    }
}
