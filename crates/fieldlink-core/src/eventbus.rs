//! Event bus for the gateway.
//!
//! Every component publishes onto one broadcast channel; collaborators
//! subscribe either to everything or through a filter.

use crate::event::{EventMetadata, GatewayEvent};
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Event bus shared between the gateway components.
///
/// Delivery is in publication order for each subscriber. A subscriber that
/// falls more than the channel capacity behind loses the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(GatewayEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    /// Get the name of this event bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub async fn publish(&self, event: GatewayEvent) -> bool {
        self.publish_with_source(event, "gateway").await
    }

    /// Publish an event with a custom source.
    pub async fn publish_with_source(
        &self,
        event: GatewayEvent,
        source: impl Into<String>,
    ) -> bool {
        let metadata = EventMetadata::new(source);
        self.publish_with_metadata(event, metadata).await
    }

    /// Publish an event with custom metadata.
    pub async fn publish_with_metadata(
        &self,
        event: GatewayEvent,
        metadata: EventMetadata,
    ) -> bool {
        tracing::trace!(event = event.type_name(), source = %metadata.source, "publishing event");
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&GatewayEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Create a filtered subscription helper for common patterns.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder { bus: self.clone() }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(GatewayEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&GatewayEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(GatewayEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&GatewayEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(GatewayEvent, EventMetadata)>, filter: F) -> Self {
        Self { rx, filter }
    }

    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Builder for creating filtered subscriptions.
pub struct FilterBuilder {
    bus: EventBus,
}

impl FilterBuilder {
    /// Subscribe to connection lifecycle events only.
    pub fn connection_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        self.bus.subscribe_filtered(GatewayEvent::is_connection_event)
    }

    /// Subscribe to presence transitions only.
    pub fn presence_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        self.bus.subscribe_filtered(GatewayEvent::is_presence_event)
    }

    /// Subscribe to routed device message events only.
    pub fn device_messages(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        self.bus.subscribe_filtered(GatewayEvent::is_device_message)
    }

    /// Subscribe to events with a given wire name.
    ///
    /// `"storage:list"` selects the specific routed event, `"list"` selects
    /// the bare action event, `"connected"` a lifecycle event.
    pub fn named(
        &self,
        name: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&GatewayEvent) -> bool + Send + 'static> {
        let name = name.into();
        self.bus.subscribe_filtered(move |event: &GatewayEvent| {
            event.event_name() == name
        })
    }

    /// Subscribe to every event that concerns one device.
    pub fn for_device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&GatewayEvent) -> bool + Send + 'static> {
        let target = device_id.into();
        self.bus.subscribe_filtered(move |event: &GatewayEvent| {
            event.device_id() == Some(target.as_str())
        })
    }
}
