//! shardwire: a sharded gateway session engine and a rate-limited REST
//! dispatcher for chat platform bots.
//!
//! - [`gateway`]: per-shard sessions (decompression, heartbeats, resume and
//!   reconnect) and the [`ShardManager`](gateway::ShardManager) that runs them
//! - [`http`]: per-route token buckets, the global throttle and the
//!   [`RequestDispatcher`](http::RequestDispatcher)
//! - [`events`]: the bus dispatches leave the engine through
//!
//! Everything is wired through an explicit [`Context`] built at startup.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod http;
pub mod metrics;
pub mod nats;
pub mod voice;

pub use context::Context;
pub use error::{GatewayError, HttpError, ProtocolError};
