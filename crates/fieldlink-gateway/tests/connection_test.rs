//! Connection lifecycle tests against the in-memory broker.

mod common;

use std::time::Duration;

use fieldlink_gateway::{
    BrokerOptions, ConnectionState, GatewayError, GatewayEvent, MemoryTransport, ReconnectPolicy,
};
use tokio::time::Instant;

use common::{drain, settle, wait_for};

#[tokio::test(start_paused = true)]
async fn test_double_connect_opens_one_session() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    let mut rx = gateway.subscribe_events();

    let connection = gateway.connection();
    let (first, second) = tokio::join!(connection.connect(), connection.connect());
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(connection.connect().await.is_ok());

    assert_eq!(broker.connect_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);

    let connected = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, GatewayEvent::Connected { .. }))
        .count();
    assert_eq!(connected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_subscribes_default_patterns() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();

    assert!(gateway.connection().is_connected());
    assert_eq!(
        broker.subscriptions(),
        vec!["device/+/+".to_string(), "device/+/+/#".to_string()]
    );
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_then_exhaustion() {
    let broker = MemoryTransport::new();
    broker.fail_connects(u32::MAX);
    let config = common::config().with_reconnect(ReconnectPolicy {
        max_attempts: 3,
        ..ReconnectPolicy::default()
    });
    let gateway = common::gateway_with(&broker, config);
    let mut rx = gateway.subscribe_events();
    let started = Instant::now();

    let result = gateway.connection().connect().await;
    assert!(matches!(result, Err(GatewayError::Connection(_))));

    let mut delays = Vec::new();
    loop {
        match rx.recv().await.unwrap().0 {
            GatewayEvent::Reconnecting { attempt, delay_ms } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay_ms);
            }
            GatewayEvent::ReconnectExhausted { attempts } => {
                assert_eq!(attempts, 3);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(delays, vec![5_000, 7_500, 11_250]);
    assert!(started.elapsed() >= Duration::from_millis(23_750));
    assert_eq!(broker.connect_count(), 4);
    assert!(gateway.connection().is_exhausted());
    assert_eq!(gateway.connection().state(), ConnectionState::Disconnected);

    let publish = gateway
        .connection()
        .publish("device/d1/command/ping", Vec::new())
        .await;
    assert!(matches!(publish, Err(GatewayError::ReconnectExhausted(3))));

    // A manual connect is the way out
    broker.fail_connects(0);
    gateway.connection().connect().await.unwrap();
    assert!(!gateway.connection().is_exhausted());
    assert_eq!(gateway.connection().reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_handshake_counts_as_failed_attempt() {
    let broker = MemoryTransport::new();
    broker.hang_connects(true);
    let config = common::config();
    let config = fieldlink_gateway::GatewayConfig {
        broker: BrokerOptions::new("localhost")
            .with_client_id("test")
            .with_connect_timeout(Duration::from_secs(2)),
        ..config
    };
    let gateway = common::gateway_with(&broker, config);
    let mut rx = gateway.subscribe_events();
    let started = Instant::now();

    let result = gateway.connection().connect().await;
    assert!(matches!(result, Err(GatewayError::Connection(_))));
    assert!(started.elapsed() >= Duration::from_secs(2));

    match wait_for(&mut rx, "reconnecting").await {
        GatewayEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
        other => panic!("unexpected event {:?}", other),
    }

    broker.hang_connects(false);
    wait_for(&mut rx, "connected").await;
    assert!(gateway.connection().is_connected());
    assert_eq!(gateway.connection().reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_drop_resubscribes() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    gateway
        .router()
        .subscribe(["device/+/storage/#"])
        .await
        .unwrap();
    let mut rx = gateway.subscribe_events();

    assert!(broker.drop_connection());
    wait_for(&mut rx, "connected").await;

    assert_eq!(broker.connect_count(), 2);
    assert_eq!(gateway.connection().reconnect_attempts(), 0);
    let mut subscriptions = broker.subscriptions();
    subscriptions.sort();
    assert_eq!(
        subscriptions,
        vec![
            "device/+/+".to_string(),
            "device/+/+/#".to_string(),
            "device/+/storage/#".to_string(),
        ]
    );
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_loss_emits_lifecycle_in_order() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    let mut rx = gateway.event_bus().filter().connection_events();

    broker.drop_connection();

    let mut names = Vec::new();
    while let Some((event, _)) = rx.recv().await {
        names.push(event.event_name());
        if matches!(event, GatewayEvent::Connected { .. }) {
            break;
        }
    }
    assert_eq!(
        names,
        vec!["error", "closed", "offline", "reconnecting", "connecting", "connected"]
    );
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_retry() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();

    gateway.connection().disconnect().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(broker.connect_count(), 1);
    assert!(!broker.is_connected());
    assert_eq!(gateway.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_clean_broker_close_reconnects() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    let mut rx = gateway.subscribe_events();

    broker.close_connection();
    wait_for(&mut rx, "offline").await;
    wait_for(&mut rx, "connected").await;
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_closes_half_set_up_session() {
    let broker = MemoryTransport::new();
    let gateway = common::gateway(&broker);
    gateway.start().await.unwrap();
    let mut rx = gateway.subscribe_events();

    // The reconnect handshake succeeds but re-subscribing never finishes
    broker.hang_subscribes(true);
    broker.drop_connection();
    wait_for(&mut rx, "connecting").await;
    while broker.connect_count() < 2 {
        settle().await;
    }
    settle().await;
    assert_eq!(gateway.connection().state(), ConnectionState::Reconnecting);
    assert!(broker.is_connected());

    broker.hang_subscribes(false);
    gateway.connection().connect().await.unwrap();

    assert_eq!(broker.connect_count(), 3);
    assert_eq!(broker.disconnect_count(), 1);
    assert!(gateway.connection().is_connected());
    assert_eq!(broker.subscriptions().len(), 2);
    gateway.shutdown().await;
}
