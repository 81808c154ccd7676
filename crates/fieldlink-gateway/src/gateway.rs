//! The gateway facade.
//!
//! A [`Gateway`] owns one connection, one router, one correlator and one
//! presence tracker, wires them to a shared [`EventBus`], and installs the
//! dispatcher that feeds every inbound message through router, presence and
//! correlator in arrival order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_core::{EventBus, EventBusReceiver};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::DeviceCommands;
use crate::config::GatewayConfig;
use crate::connection::{ConnectionManager, SessionHandler};
use crate::correlator::{CommandCorrelator, CommandReceipt};
use crate::error::GatewayResult;
use crate::presence::PresenceTracker;
use crate::router::{Payload, TopicRouter};
use crate::transport::{InboundMessage, RumqttTransport, Transport};

/// Feeds session traffic through the gateway components.
struct Dispatcher {
    router: Arc<TopicRouter>,
    presence: Arc<PresenceTracker>,
    correlator: Arc<CommandCorrelator>,
}

#[async_trait]
impl SessionHandler for Dispatcher {
    async fn on_message(&self, message: InboundMessage) {
        let Some(routed) = self.router.route(&message).await else {
            return;
        };

        match &routed.payload {
            Payload::Json(Value::Object(map)) if self.router.is_status_category(&routed.category) => {
                self.presence
                    .update_device_status_at(&routed.device_id, map.clone(), routed.received_at)
                    .await;
            }
            _ => {
                self.presence
                    .handle_heartbeat_at(&routed.device_id, routed.received_at)
                    .await;
            }
        }

        if self.correlator.resolve(&routed) {
            debug!(device_id = %routed.device_id, topic = %routed.topic, "Resolved command response");
        }
    }

    fn on_connection_lost(&self) {
        self.correlator.reject_all_connection_lost();
    }
}

/// MQTT device gateway.
pub struct Gateway {
    config: GatewayConfig,
    event_bus: EventBus,
    connection: ConnectionManager,
    router: Arc<TopicRouter>,
    correlator: Arc<CommandCorrelator>,
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<Dispatcher>,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway on the given transport.
    ///
    /// Only configuration errors are returned; connecting happens in
    /// [`start`](Self::start).
    pub fn new(config: GatewayConfig, transport: Arc<dyn Transport>) -> GatewayResult<Self> {
        config.validate()?;

        let event_bus = EventBus::with_name("fieldlink");
        let connection = ConnectionManager::new(
            transport,
            config.broker.clone(),
            config.reconnect.clone(),
            event_bus.clone(),
        );
        let router = Arc::new(TopicRouter::new(
            connection.clone(),
            event_bus.clone(),
            config.commands.source_tag.clone(),
            config.status_categories.clone(),
        ));
        let correlator = Arc::new(CommandCorrelator::new(
            connection.clone(),
            config.commands.source_tag.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            config.presence.clone(),
            event_bus.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher {
            router: Arc::clone(&router),
            presence: Arc::clone(&presence),
            correlator: Arc::clone(&correlator),
        });
        let handler: Arc<dyn SessionHandler> = dispatcher.clone();
        connection.set_handler(Arc::downgrade(&handler));

        Ok(Self {
            config,
            event_bus,
            connection,
            router,
            correlator,
            presence,
            dispatcher,
            sweeps: Mutex::new(Vec::new()),
        })
    }

    /// Build a gateway that talks MQTT through rumqttc.
    pub fn mqtt(config: GatewayConfig) -> GatewayResult<Self> {
        Self::new(config, Arc::new(RumqttTransport::new()))
    }

    /// Register the configured subscriptions, connect, and start the
    /// presence sweeps.
    ///
    /// A failed first connect is not an error here: the backoff loop keeps
    /// trying and the outcome is visible on the event bus.
    pub async fn start(&self) -> GatewayResult<()> {
        self.router
            .subscribe(self.config.subscriptions.iter().cloned())
            .await?;

        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "Initial connect failed, reconnecting in background");
        }

        let mut sweeps = self.sweeps.lock();
        if sweeps.is_empty() {
            *sweeps = self.presence.spawn_sweeps();
        }
        info!(
            broker = %self.config.broker.full_broker_addr(),
            subscriptions = self.config.subscriptions.len(),
            "Gateway started"
        );
        Ok(())
    }

    /// Disconnect and stop the sweeps.
    pub async fn shutdown(&self) {
        let sweeps: Vec<JoinHandle<()>> = self.sweeps.lock().drain(..).collect();
        for sweep in sweeps {
            sweep.abort();
        }
        self.connection.disconnect().await;
        info!("Gateway stopped");
    }

    /// Publish a command, see [`CommandCorrelator::publish_command`].
    pub async fn publish_command(
        &self,
        device_id: &str,
        command: &str,
        payload: Value,
        wait_for_response: bool,
        timeout: Duration,
    ) -> GatewayResult<CommandReceipt> {
        self.correlator
            .publish_command(device_id, command, payload, wait_for_response, timeout)
            .await
    }

    /// Typed command wrappers.
    pub fn commands(&self) -> DeviceCommands {
        DeviceCommands::new(Arc::clone(&self.correlator))
    }

    pub fn subscribe_events(&self) -> EventBusReceiver {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn correlator(&self) -> &CommandCorrelator {
        &self.correlator
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Feed a message through the dispatcher as if the session received it.
    pub async fn handle_message(&self, message: InboundMessage) {
        self.dispatcher.on_message(message).await;
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for sweep in self.sweeps.get_mut().drain(..) {
            sweep.abort();
        }
    }
}
