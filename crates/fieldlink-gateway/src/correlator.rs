//! Request/response correlation for device commands.
//!
//! Commands go out on `device/{id}/command/{command}` inside an envelope
//! carrying a fresh correlation id. When the caller waits for a response the
//! command is parked in the pending map until one of three things happens:
//! a message echoing the correlation id arrives, the deadline passes, or the
//! connection drops. Whoever removes the entry from the map settles it, so
//! exactly one outcome is ever delivered.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldlink_core::config::topics::{CORRELATION_FIELD, SOURCE_FIELD, TIMESTAMP_FIELD};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{GatewayError, GatewayResult};
use crate::router::DeviceMessage;
use crate::topic;

type Responder = oneshot::Sender<GatewayResult<CommandResponse>>;

/// A correlated response.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub correlation_id: String,
    pub device_id: String,
    pub topic: String,
    pub category: String,
    pub action: Option<String>,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

/// Outcome of a successful `publish_command`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReceipt {
    /// Fire-and-forget: the publish was accepted.
    Sent { correlation_id: String },
    /// The device answered.
    Response(CommandResponse),
}

impl CommandReceipt {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Sent { correlation_id } => correlation_id,
            Self::Response(response) => &response.correlation_id,
        }
    }

    pub fn into_response(self) -> Option<CommandResponse> {
        match self {
            Self::Sent { .. } => None,
            Self::Response(response) => Some(response),
        }
    }
}

struct PendingCommand {
    device_id: String,
    command: String,
    payload: Value,
    created_at: DateTime<Utc>,
    deadline: Instant,
    responder: Responder,
}

/// Snapshot of a command awaiting its response.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommandInfo {
    pub correlation_id: String,
    pub device_id: String,
    pub command: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Time left until the deadline
    pub remaining: Duration,
}

/// Matches outbound commands to inbound responses.
pub struct CommandCorrelator {
    connection: ConnectionManager,
    source_tag: String,
    pending: Mutex<HashMap<String, PendingCommand>>,
}

impl CommandCorrelator {
    pub fn new(connection: ConnectionManager, source_tag: impl Into<String>) -> Self {
        Self {
            connection,
            source_tag: source_tag.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap a command payload into the outbound envelope.
    ///
    /// Object payloads keep their fields; anything else is placed under
    /// `data`. The correlation fields always win over payload fields of the
    /// same name.
    pub fn build_envelope(&self, payload: Value, correlation_id: &str, timestamp: i64) -> Value {
        let mut envelope = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        envelope.insert(
            CORRELATION_FIELD.to_string(),
            Value::String(correlation_id.to_string()),
        );
        envelope.insert(TIMESTAMP_FIELD.to_string(), Value::from(timestamp));
        envelope.insert(
            SOURCE_FIELD.to_string(),
            Value::String(self.source_tag.clone()),
        );
        Value::Object(envelope)
    }

    /// Publish a command to a device.
    ///
    /// With `wait_for_response` false this settles as soon as the publish is
    /// accepted. Otherwise it waits for the correlated response, see
    /// [`request`](Self::request).
    pub async fn publish_command(
        &self,
        device_id: &str,
        command: &str,
        payload: Value,
        wait_for_response: bool,
        timeout: Duration,
    ) -> GatewayResult<CommandReceipt> {
        if wait_for_response {
            self.request(device_id, command, payload, timeout)
                .await
                .map(CommandReceipt::Response)
        } else {
            self.send(device_id, command, payload)
                .await
                .map(|correlation_id| CommandReceipt::Sent { correlation_id })
        }
    }

    /// Publish a command without waiting for a response.
    ///
    /// Returns the correlation id written into the envelope.
    pub async fn send(&self, device_id: &str, command: &str, payload: Value) -> GatewayResult<String> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let envelope =
            self.build_envelope(payload, &correlation_id, Utc::now().timestamp_millis());
        let bytes = serde_json::to_vec(&envelope)?;
        let topic = topic::command_topic(device_id, command);

        self.connection.publish(&topic, bytes).await?;
        debug!(device_id, command, correlation_id = %correlation_id, "Command sent");
        Ok(correlation_id)
    }

    /// Publish a command and wait for the correlated response.
    ///
    /// Fails with `Timeout` when nothing arrives before `timeout`, and with
    /// `ConnectionLost` when the session drops first. Dropping the returned
    /// future removes the pending entry.
    pub async fn request(
        &self,
        device_id: &str,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> GatewayResult<CommandResponse> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let envelope =
            self.build_envelope(payload.clone(), &correlation_id, created_at.timestamp_millis());
        let bytes = serde_json::to_vec(&envelope)?;
        let topic = topic::command_topic(device_id, command);

        // Registered before publishing so a fast response finds its entry
        let (tx, mut rx) = oneshot::channel();
        let deadline = deadline_after(timeout);
        self.pending.lock().insert(
            correlation_id.clone(),
            PendingCommand {
                device_id: device_id.to_string(),
                command: command.to_string(),
                payload,
                created_at,
                deadline,
                responder: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        if let Err(e) = self.connection.publish(&topic, bytes).await {
            warn!(device_id, command, error = %e, "Command publish failed");
            return Err(e);
        }
        debug!(
            device_id,
            command,
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis() as u64,
            "Command sent, awaiting response"
        );

        let outcome = tokio::select! {
            result = &mut rx => result.unwrap_or(Err(GatewayError::ConnectionLost)),
            _ = tokio::time::sleep_until(deadline) => {
                let expired = self.pending.lock().remove(&correlation_id).is_some();
                if expired {
                    Err(GatewayError::Timeout(timeout.as_millis() as u64))
                } else {
                    // Settled by someone else while the timer fired
                    rx.try_recv().unwrap_or(Err(GatewayError::ConnectionLost))
                }
            }
        };

        match &outcome {
            Ok(_) => debug!(correlation_id = %correlation_id, "Command response received"),
            Err(e) => info!(device_id, command, correlation_id = %correlation_id, error = %e, "Command failed"),
        }
        outcome
    }

    /// Settle the pending command a message responds to.
    ///
    /// Returns `true` if the message carried the correlation id of a pending
    /// command.
    pub fn resolve(&self, message: &DeviceMessage) -> bool {
        let Some(correlation_id) = message.correlation_id() else {
            return false;
        };

        let mut pending = self.pending.lock();
        let Some(entry) = pending.remove(correlation_id) else {
            debug!(correlation_id, "Response for unknown or settled command");
            return false;
        };
        if entry.device_id != message.device_id {
            debug!(
                correlation_id,
                expected = %entry.device_id,
                actual = %message.device_id,
                "Response arrived from a different device"
            );
        }

        let response = CommandResponse {
            correlation_id: correlation_id.to_string(),
            device_id: message.device_id.clone(),
            topic: message.topic.clone(),
            category: message.category.clone(),
            action: message.action.clone(),
            data: message.data(),
            received_at: message.received_at,
        };
        // Sent under the lock so a firing timer sees either the entry or the value
        let _ = entry.responder.send(Ok(response));
        true
    }

    /// Reject every pending command with `ConnectionLost`.
    pub fn reject_all_connection_lost(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for (correlation_id, entry) in pending.drain() {
            debug!(correlation_id = %correlation_id, command = %entry.command, "Rejecting pending command");
            let _ = entry.responder.send(Err(GatewayError::ConnectionLost));
        }
        if count > 0 {
            warn!(count, "Rejected pending commands after connection loss");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommandInfo> {
        let now = Instant::now();
        self.pending
            .lock()
            .iter()
            .map(|(correlation_id, entry)| PendingCommandInfo {
                correlation_id: correlation_id.clone(),
                device_id: entry.device_id.clone(),
                command: entry.command.clone(),
                payload: entry.payload.clone(),
                created_at: entry.created_at,
                remaining: entry.deadline.saturating_duration_since(now),
            })
            .collect()
    }
}

/// Roughly 30 years, used when a timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Removes a pending entry when its waiter goes away.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingCommand>>,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fieldlink_core::EventBus;
    use serde_json::json;

    use super::*;
    use crate::config::{BrokerOptions, ReconnectPolicy};
    use crate::router::Payload;
    use crate::transport::MemoryTransport;

    fn correlator(broker: &MemoryTransport) -> (ConnectionManager, Arc<CommandCorrelator>) {
        let connection = ConnectionManager::new(
            Arc::new(broker.clone()),
            BrokerOptions::default(),
            ReconnectPolicy::default(),
            EventBus::new(),
        );
        let correlator = Arc::new(CommandCorrelator::new(connection.clone(), "gw"));
        (connection, correlator)
    }

    fn response(device_id: &str, correlation_id: &str) -> DeviceMessage {
        DeviceMessage {
            device_id: device_id.to_string(),
            topic: format!("device/{}/response/ping", device_id),
            category: "response".to_string(),
            action: Some("ping".to_string()),
            payload: Payload::Json(json!({ "correlation_id": correlation_id, "ok": true })),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_envelope_fields() {
        let broker = MemoryTransport::new();
        let (_, correlator) = correlator(&broker);

        let envelope = correlator.build_envelope(json!({ "text": "hi" }), "c1", 42);
        assert_eq!(
            envelope,
            json!({ "text": "hi", "correlation_id": "c1", "timestamp": 42, "source": "gw" })
        );

        let wrapped = correlator.build_envelope(json!([1, 2]), "c2", 1);
        assert_eq!(wrapped["data"], json!([1, 2]));
        assert_eq!(wrapped["correlation_id"], "c2");
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let broker = MemoryTransport::new();
        let (connection, correlator) = correlator(&broker);
        connection.connect().await.unwrap();

        let receipt = correlator
            .publish_command("d1", "ping", json!({}), false, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(receipt, CommandReceipt::Sent { .. }));
        assert_eq!(correlator.pending_count(), 0);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "device/d1/command/ping");
    }

    #[tokio::test]
    async fn test_publish_failure_removes_entry() {
        let broker = MemoryTransport::new();
        let (_, correlator) = correlator(&broker);

        let result = correlator
            .publish_command("d1", "ping", json!({}), true, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(GatewayError::PublishFailure(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_settles_waiter() {
        let broker = MemoryTransport::new();
        let (connection, correlator) = correlator(&broker);
        connection.connect().await.unwrap();
        let mut outbound = broker.published_stream();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .publish_command("d1", "ping", json!({}), true, Duration::from_secs(5))
                    .await
            })
        };

        let sent = outbound.recv().await.unwrap();
        let envelope: Value = serde_json::from_slice(&sent.payload).unwrap();
        let id = envelope["correlation_id"].as_str().unwrap().to_string();
        assert_eq!(correlator.pending_commands()[0].correlation_id, id);

        assert!(correlator.resolve(&response("d1", &id)));
        assert!(!correlator.resolve(&response("d1", &id)));

        let response = waiter.await.unwrap().unwrap().into_response().unwrap();
        assert_eq!(response.correlation_id, id);
        assert_eq!(response.data["ok"], true);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_no_entry() {
        let broker = MemoryTransport::new();
        let (connection, correlator) = correlator(&broker);
        connection.connect().await.unwrap();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .publish_command("d1", "ping", json!({}), true, Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(correlator.pending_count(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_still_resolves() {
        let broker = MemoryTransport::new();
        let (connection, correlator) = correlator(&broker);
        connection.connect().await.unwrap();
        let mut outbound = broker.published_stream();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .publish_command("d1", "ping", json!({}), true, Duration::MAX)
                    .await
            })
        };

        let sent = outbound.recv().await.unwrap();
        let envelope: Value = serde_json::from_slice(&sent.payload).unwrap();
        let id = envelope["correlation_id"].as_str().unwrap().to_string();
        assert!(correlator.pending_commands()[0].remaining >= Duration::from_secs(86_400 * 365));

        assert!(correlator.resolve(&response("d1", &id)));
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(correlator.pending_count(), 0);
    }
}
