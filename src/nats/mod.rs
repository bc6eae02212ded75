//! NATS JetStream forwarding
//!
//! Optional: when `NATS_URL` is set the binary subscribes a [`NatsPublisher`]
//! to the event bus and every forwarded dispatch lands on a JetStream subject.

mod publisher;

pub use publisher::{ensure_streams, subject_for, NatsPublisher};
