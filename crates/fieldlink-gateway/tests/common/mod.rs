//! Shared helpers for gateway integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fieldlink_gateway::{
    BrokerOptions, EventBusReceiver, Gateway, GatewayConfig, GatewayEvent,
    MemoryTransport,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

pub const SOURCE_TAG: &str = "test-gw";

pub fn config() -> GatewayConfig {
    GatewayConfig::new(BrokerOptions::new("localhost").with_client_id("test"))
        .with_source_tag(SOURCE_TAG)
}

pub fn gateway(broker: &MemoryTransport) -> Gateway {
    gateway_with(broker, config())
}

pub fn gateway_with(broker: &MemoryTransport, config: GatewayConfig) -> Gateway {
    Gateway::new(config, Arc::new(broker.clone())).expect("valid config")
}

/// Wait for the next event with the given wire name.
pub async fn wait_for(rx: &mut EventBusReceiver, name: &str) -> GatewayEvent {
    loop {
        let (event, _) = rx.recv().await.expect("event bus closed");
        if event.event_name() == name {
            return event;
        }
    }
}

/// Drain everything currently buffered.
pub fn drain(rx: &mut EventBusReceiver) -> Vec<GatewayEvent> {
    std::iter::from_fn(|| rx.try_recv())
        .map(|(event, _)| event)
        .collect()
}

/// Let spawned tasks run without moving the clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// A device living on the in-memory broker.
pub struct MockDevice {
    broker: MemoryTransport,
    device_id: String,
}

impl MockDevice {
    pub fn new(broker: &MemoryTransport, device_id: impl Into<String>) -> Self {
        Self {
            broker: broker.clone(),
            device_id: device_id.into(),
        }
    }

    pub fn status(&self, data: Value) -> bool {
        self.broker
            .inject_json(format!("device/{}/status", self.device_id), &data)
    }

    pub fn publish(&self, category: &str, action: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.broker.inject(
            format!("device/{}/{}/{}", self.device_id, category, action),
            payload,
        )
    }

    /// Answer every command addressed to this device, echoing its
    /// correlation id and the request fields under `request`.
    pub fn auto_respond(&self) -> JoinHandle<()> {
        self.respond_with(|envelope| {
            Some(json!({
                "correlation_id": envelope["correlation_id"],
                "ok": true,
                "request": envelope,
            }))
        })
    }

    /// Answer every command with the received envelope itself plus `ok`.
    pub fn echo_respond(&self) -> JoinHandle<()> {
        self.respond_with(|envelope| {
            let mut reply = envelope.clone();
            reply["ok"] = json!(true);
            Some(reply)
        })
    }

    /// Answer commands on `device/{id}/response/{command}` with whatever
    /// `reply` builds from the envelope; `None` leaves the command unanswered.
    pub fn respond_with<F>(&self, reply: F) -> JoinHandle<()>
    where
        F: Fn(&Value) -> Option<Value> + Send + 'static,
    {
        let mut outbound = self.broker.published_stream();
        let broker = self.broker.clone();
        let prefix = format!("device/{}/command/", self.device_id);
        let device_id = self.device_id.clone();

        tokio::spawn(async move {
            while let Ok(message) = outbound.recv().await {
                let Some(command) = message.topic.strip_prefix(&prefix) else {
                    continue;
                };
                let Ok(envelope) = serde_json::from_slice::<Value>(&message.payload) else {
                    continue;
                };
                if let Some(response) = reply(&envelope) {
                    broker.inject_json(
                        format!("device/{}/response/{}", device_id, command),
                        &response,
                    );
                }
            }
        })
    }
}
