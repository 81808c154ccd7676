//! Domain command wrappers.
//!
//! Thin parameterizations of [`CommandCorrelator::request`] with the
//! command names devices understand and a timeout that fits the kind of
//! work: quick queries, physical actions that need a human or a modem, and
//! bulk file transfers.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fieldlink_core::config::timeouts;
use serde_json::{json, Value};

use crate::correlator::{CommandCorrelator, CommandResponse};
use crate::error::{GatewayError, GatewayResult};

/// Command names on the wire.
pub mod names {
    pub const SEND_MESSAGE: &str = "send-message";
    pub const PLACE_CALL: &str = "place-call";
    pub const END_CALL: &str = "end-call";
    pub const GET_STATUS: &str = "get-status";
    pub const PING: &str = "ping";
    pub const LIST_FILES: &str = "list-files";
    pub const READ_FILE: &str = "read-file";
    pub const WRITE_FILE: &str = "write-file";
    pub const DELETE_FILE: &str = "delete-file";
}

/// Typed command API on top of the correlator.
#[derive(Clone)]
pub struct DeviceCommands {
    correlator: Arc<CommandCorrelator>,
}

impl DeviceCommands {
    pub fn new(correlator: Arc<CommandCorrelator>) -> Self {
        Self { correlator }
    }

    async fn request(
        &self,
        device_id: &str,
        command: &str,
        payload: Value,
        timeout_ms: u64,
    ) -> GatewayResult<CommandResponse> {
        self.correlator
            .request(device_id, command, payload, Duration::from_millis(timeout_ms))
            .await
    }

    /// Send a text message through the device.
    pub async fn send_message(
        &self,
        device_id: &str,
        recipient: &str,
        text: &str,
    ) -> GatewayResult<CommandResponse> {
        self.request(
            device_id,
            names::SEND_MESSAGE,
            json!({ "to": recipient, "text": text }),
            timeouts::PHYSICAL_ACTION_MS,
        )
        .await
    }

    /// Place a voice call.
    pub async fn place_call(&self, device_id: &str, number: &str) -> GatewayResult<CommandResponse> {
        self.request(
            device_id,
            names::PLACE_CALL,
            json!({ "number": number }),
            timeouts::PHYSICAL_ACTION_MS,
        )
        .await
    }

    pub async fn end_call(&self, device_id: &str) -> GatewayResult<CommandResponse> {
        self.request(device_id, names::END_CALL, json!({}), timeouts::QUERY_MS)
            .await
    }

    /// Ask the device for a full status report.
    pub async fn request_status(&self, device_id: &str) -> GatewayResult<CommandResponse> {
        self.request(device_id, names::GET_STATUS, json!({}), timeouts::QUERY_MS)
            .await
    }

    pub async fn ping(&self, device_id: &str) -> GatewayResult<CommandResponse> {
        self.request(device_id, names::PING, json!({}), timeouts::PING_MS)
            .await
    }

    pub async fn list_files(&self, device_id: &str, path: &str) -> GatewayResult<CommandResponse> {
        self.request(
            device_id,
            names::LIST_FILES,
            json!({ "path": path }),
            timeouts::QUERY_MS,
        )
        .await
    }

    /// Read a file; the response carries it base64 encoded, see
    /// [`decode_file_content`].
    pub async fn read_file(&self, device_id: &str, path: &str) -> GatewayResult<CommandResponse> {
        self.request(
            device_id,
            names::READ_FILE,
            json!({ "path": path }),
            timeouts::BULK_TRANSFER_MS,
        )
        .await
    }

    pub async fn write_file(
        &self,
        device_id: &str,
        path: &str,
        content: &[u8],
    ) -> GatewayResult<CommandResponse> {
        self.request(
            device_id,
            names::WRITE_FILE,
            json!({
                "path": path,
                "content": BASE64.encode(content),
                "encoding": "base64",
                "size": content.len(),
            }),
            timeouts::BULK_TRANSFER_MS,
        )
        .await
    }

    pub async fn delete_file(&self, device_id: &str, path: &str) -> GatewayResult<CommandResponse> {
        self.request(
            device_id,
            names::DELETE_FILE,
            json!({ "path": path }),
            timeouts::QUERY_MS,
        )
        .await
    }
}

/// Decode the `content` field of a `read_file` response.
pub fn decode_file_content(response: &CommandResponse) -> GatewayResult<Vec<u8>> {
    let content = response
        .data
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::MalformedPayload {
            topic: response.topic.clone(),
            reason: "missing string field 'content'".to_string(),
        })?;
    BASE64
        .decode(content)
        .map_err(|e| GatewayError::MalformedPayload {
            topic: response.topic.clone(),
            reason: e.to_string(),
        })
}
