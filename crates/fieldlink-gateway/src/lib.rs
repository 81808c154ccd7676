//! FieldLink MQTT device gateway.
//!
//! Connects to a broker, routes `device/{id}/{category}/{action}` traffic
//! into typed events, tracks device presence, and correlates outbound
//! commands with their responses.
//!
//! ```no_run
//! use std::time::Duration;
//! use fieldlink_gateway::{Gateway, GatewayConfig};
//!
//! # async fn run() -> fieldlink_gateway::GatewayResult<()> {
//! let gateway = Gateway::mqtt(GatewayConfig::from_env()?)?;
//! gateway.start().await?;
//!
//! let status = gateway.commands().request_status("pump-7").await?;
//! println!("{}", status.data);
//!
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod router;
pub mod topic;
pub mod transport;

pub use commands::{decode_file_content, DeviceCommands};
pub use config::{
    BrokerOptions, CommandConfig, GatewayConfig, PresenceConfig, ReconnectPolicy, Scheme,
};
pub use connection::{ConnectionManager, ConnectionState, SessionHandler};
pub use correlator::{CommandCorrelator, CommandReceipt, CommandResponse, PendingCommandInfo};
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use presence::{DeviceRecord, PresenceChange, PresenceTracker};
pub use router::{DeviceMessage, Payload, TopicRouter};
pub use transport::{
    InboundMessage, MemoryTransport, RumqttTransport, Transport, TransportError, TransportResult,
};

pub use fieldlink_core::{EventBus, EventBusReceiver, EventMetadata, GatewayEvent};
