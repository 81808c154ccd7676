//! Command correlation tests against the in-memory broker.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fieldlink_gateway::{decode_file_content, CommandReceipt, GatewayError, MemoryTransport};
use serde_json::{json, Value};
use tokio::time::Instant;

use common::{settle, MockDevice};

async fn wait_pending(gateway: &fieldlink_gateway::Gateway, count: usize) {
    while gateway.correlator().pending_count() < count {
        settle().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_commands_settle_once() {
    let broker = MemoryTransport::new();
    let gateway = Arc::new(common::gateway(&broker));
    gateway.start().await.unwrap();
    let _responder = MockDevice::new(&broker, "d1").auto_respond();

    let calls = (0..20).map(|seq| {
        let gateway = Arc::clone(&gateway);
        async move {
            gateway
                .publish_command("d1", "ping", json!({ "seq": seq }), true, Duration::from_secs(5))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    let mut ids = HashSet::new();
    for (seq, result) in results.into_iter().enumerate() {
        let response = result.unwrap().into_response().unwrap();
        assert_eq!(response.device_id, "d1");
        assert_eq!(response.data["request"]["seq"], json!(seq));
        assert!(ids.insert(response.correlation_id));
    }
    assert_eq!(ids.len(), 20);
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_answers_settle_every_caller_once() {
    let broker = MemoryTransport::new();
    let gateway = Arc::new(common::gateway(&broker));
    gateway.start().await.unwrap();
    let _responder = MockDevice::new(&broker, "d1").respond_with(|envelope| {
        let seq = envelope["seq"].as_u64()?;
        (seq % 2 == 0).then(|| json!({ "correlation_id": envelope["correlation_id"], "seq": seq }))
    });

    let calls = (0..20u64).map(|seq| {
        let gateway = Arc::clone(&gateway);
        async move {
            gateway
                .publish_command("d1", "ping", json!({ "seq": seq }), true, Duration::from_secs(5))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    for (seq, result) in results.into_iter().enumerate() {
        if seq % 2 == 0 {
            let response = result.unwrap().into_response().unwrap();
            assert_eq!(response.data["seq"], json!(seq));
        } else {
            assert!(
                matches!(result, Err(GatewayError::Timeout(5_000))),
                "seq {} should time out",
                seq
            );
        }
    }
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_response_repeating_envelope_resolves() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    let _responder = MockDevice::new(&broker, "d1").echo_respond();

    let response = gateway
        .publish_command("d1", "get-status", json!({}), true, Duration::from_secs(5))
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(response.topic, "device/d1/response/get-status");
    assert_eq!(response.data["source"], common::SOURCE_TAG);
    assert_eq!(response.data["ok"], true);

    settle().await;
    assert!(gateway.presence().get_device("d1").is_some());
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_envelope_on_the_wire() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();

    let receipt = gateway
        .publish_command("d1", "send-message", json!({ "text": "hi" }), false, Duration::from_secs(5))
        .await
        .unwrap();
    let CommandReceipt::Sent { correlation_id } = receipt else {
        panic!("fire-and-forget must not wait");
    };

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "device/d1/command/send-message");
    let envelope: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(envelope["text"], "hi");
    assert_eq!(envelope["correlation_id"], json!(correlation_id));
    assert_eq!(envelope["source"], common::SOURCE_TAG);
    assert!(envelope["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_rejects_and_clears_entry() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    let started = Instant::now();

    let result = gateway
        .publish_command("d1", "get-status", json!({}), true, Duration::from_millis(5_000))
        .await;

    assert!(matches!(result, Err(GatewayError::Timeout(5_000))));
    assert!(started.elapsed() >= Duration::from_millis(5_000));
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_is_ignored() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();

    let result = gateway
        .publish_command("d1", "ping", json!({}), true, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(GatewayError::Timeout(1_000))));

    let envelope: Value = serde_json::from_slice(&broker.published()[0].payload).unwrap();
    let device = MockDevice::new(&broker, "d1");
    device.publish(
        "response",
        "ping",
        json!({ "correlation_id": envelope["correlation_id"] }).to_string(),
    );
    settle().await;
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_rejects_all_pending() {
    let broker = MemoryTransport::new();
    let gateway = Arc::new(common::gateway(&broker));
    gateway.start().await.unwrap();

    let spawn_command = |command: &'static str| {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .publish_command("d1", command, json!({}), true, Duration::from_secs(60))
                .await
        })
    };
    let a = spawn_command("place-call");
    let b = spawn_command("send-message");
    wait_pending(&gateway, 2).await;

    broker.drop_connection();

    assert!(matches!(a.await.unwrap(), Err(GatewayError::ConnectionLost)));
    assert!(matches!(b.await.unwrap(), Err(GatewayError::ConnectionLost)));
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_session_does_not_reject_new_commands() {
    let broker = MemoryTransport::new();
    let gateway = Arc::new(common::gateway(&broker));
    gateway.start().await.unwrap();

    gateway.connection().reconnect(None).await.unwrap();
    assert_eq!(broker.connect_count(), 2);

    let pending = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .publish_command("d1", "ping", json!({}), true, Duration::from_secs(30))
                .await
        })
    };
    wait_pending(&gateway, 1).await;
    settle().await;
    assert_eq!(gateway.correlator().pending_count(), 1);

    let envelope: Value = serde_json::from_slice(&broker.published()[0].payload).unwrap();
    broker.inject_json(
        "device/d1/response/ping",
        &json!({ "correlation_id": envelope["correlation_id"] }),
    );
    assert!(pending.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_when_broker_rejects() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    broker.reject_publishes(true);

    let result = gateway
        .publish_command("d1", "ping", json!({}), true, Duration::from_secs(5))
        .await;
    assert!(matches!(result, Err(GatewayError::PublishFailure(_))));
    assert_eq!(gateway.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_domain_wrappers() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    let _responder = MockDevice::new(&broker, "d1").auto_respond();
    let commands = gateway.commands();

    let status = commands.request_status("d1").await.unwrap();
    assert_eq!(status.topic, "device/d1/response/get-status");

    let written = commands.write_file("d1", "/tmp/a.txt", b"hello").await.unwrap();
    assert_eq!(written.data["request"]["content"], "aGVsbG8=");
    assert_eq!(written.data["request"]["path"], "/tmp/a.txt");

    let call = commands.place_call("d1", "+100200300").await.unwrap();
    assert_eq!(call.data["request"]["number"], "+100200300");

    let topics: Vec<String> = broker.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(
        topics,
        vec![
            "device/d1/command/get-status",
            "device/d1/command/write-file",
            "device/d1/command/place-call",
        ]
    );

    let echoed = fieldlink_gateway::CommandResponse {
        data: written.data["request"].clone(),
        ..written
    };
    assert_eq!(decode_file_content(&echoed).unwrap(), b"hello");
}
