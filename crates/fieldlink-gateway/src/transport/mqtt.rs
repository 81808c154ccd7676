//! MQTT transport backed by rumqttc.
//!
//! The rumqttc event loop reconnects on its own when polled after an error.
//! The gateway owns reconnection and backoff, so a session here ends at the
//! first error and the event loop is dropped with it.

use std::sync::Arc;

use async_trait::async_trait;
use fieldlink_core::config::broker::{MAX_PACKET_SIZE, REQUEST_CHANNEL_CAPACITY};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tracing::{debug, warn};

use super::{
    InboundMessage, InboundStream, Transport, TransportError, TransportLink, TransportResult,
    TransportSession,
};
use crate::config::{BrokerOptions, Scheme};

/// Transport that talks MQTT 3.1.1 through rumqttc.
#[derive(Debug, Clone, Default)]
pub struct RumqttTransport;

impl RumqttTransport {
    pub fn new() -> Self {
        Self
    }

    fn build_options(options: &BrokerOptions, client_id: &str) -> MqttOptions {
        let host = if options.scheme.is_websocket() {
            let scheme = if options.scheme.is_tls() { "wss" } else { "ws" };
            format!("{}://{}:{}{}", scheme, options.host, options.port, options.ws_path)
        } else {
            options.host.clone()
        };

        let mut mqttoptions = MqttOptions::new(client_id, host, options.port);
        mqttoptions.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        mqttoptions.set_keep_alive(options.keep_alive());
        mqttoptions.set_clean_session(true);

        if let (Some(u), Some(p)) = (&options.username, &options.password) {
            mqttoptions.set_credentials(u, p);
        }

        match options.scheme {
            Scheme::Mqtt => {}
            Scheme::Mqtts => {
                mqttoptions.set_transport(rumqttc::Transport::tls_with_default_config());
            }
            Scheme::Ws => {
                mqttoptions.set_transport(rumqttc::Transport::Ws);
            }
            Scheme::Wss => {
                mqttoptions.set_transport(rumqttc::Transport::wss_with_default_config());
            }
        }

        mqttoptions
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(
        &self,
        options: &BrokerOptions,
        client_id: &str,
    ) -> TransportResult<TransportSession> {
        let mqttoptions = Self::build_options(options, client_id);
        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CHANNEL_CAPACITY);

        // Drive the handshake until the broker answers with CONNACK
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(format!("{:?}", ack.code)));
                    }
                    debug!(client_id, session_present = ack.session_present, "MQTT CONNACK received");
                    break;
                }
                Ok(_) => continue,
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    return Err(TransportError::Refused(format!("{:?}", code)));
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }

        Ok(TransportSession {
            link: Arc::new(RumqttLink { client }),
            inbound: Box::new(RumqttInbound { eventloop }),
        })
    }
}

struct RumqttLink {
    client: AsyncClient,
}

#[async_trait]
impl TransportLink for RumqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> TransportResult<()> {
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

struct RumqttInbound {
    eventloop: EventLoop,
}

#[async_trait]
impl InboundStream for RumqttInbound {
    async fn recv(&mut self) -> TransportResult<InboundMessage> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        warn!(pkid = ack.pkid, "Broker rejected a subscription");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect))
                | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    return Err(TransportError::Closed);
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}
