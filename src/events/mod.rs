//! Event handling module
//!
//! Dispatch payloads leave the session engine through the [`EventBus`] as
//! `(event name, raw payload)`. Typed decoding is the job of a
//! [`ModelDecoder`] supplied by the consumer.

pub mod bus;
pub mod serialize;

pub use bus::{
    DecodingListener, DispatchEvent, EventBus, EventFilter, EventListener, ModelDecoder,
    SubscriptionId,
};
pub use serialize::{serialize_event, GatewayEvent};
