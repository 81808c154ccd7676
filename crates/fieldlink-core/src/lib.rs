//! Core types for the FieldLink device gateway.
//!
//! This crate defines the event vocabulary and the event bus shared by the
//! gateway and its collaborators, plus the configuration defaults every
//! crate reads from.

pub mod config;
pub mod event;
pub mod eventbus;

pub use event::{EventMetadata, GatewayEvent};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilterBuilder, FilteredReceiver,
};
