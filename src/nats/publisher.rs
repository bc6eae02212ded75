//! NATS event publisher

use crate::error::GatewayError;
use crate::events::{serialize_event, DispatchEvent, EventListener, GatewayEvent};
use async_nats::jetstream::{self, Context as JsContext};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream names
pub mod streams {
    /// Interactions, short retention for fast command handling
    pub const COMMANDS: &str = "COMMANDS";
    /// Every other forwarded dispatch
    pub const EVENTS: &str = "EVENTS";
}

/// Subject prefixes for routing
pub mod subjects {
    pub const COMMANDS: &str = "commands";
    pub const EVENTS: &str = "events";
}

/// Subject for a broker event type, e.g. `guild.join` → `events.guild.join`
pub fn subject_for(event_type: &str) -> String {
    match event_type {
        "interaction.create" => format!("{}.interaction", subjects::COMMANDS),
        other => format!("{}.{other}", subjects::EVENTS),
    }
}

/// Event bus listener forwarding dispatches to JetStream
pub struct NatsPublisher {
    jetstream: JsContext,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server(s)
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            jetstream: jetstream::new(client),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    pub fn jetstream(&self) -> &JsContext {
        &self.jetstream
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish one serialized event and wait for the JetStream ack
    pub async fn publish_event(&self, event: &GatewayEvent) -> Result<(), GatewayError> {
        let subject = subject_for(&event.event_type);
        let payload = serde_json::to_vec(event).map_err(|source| GatewayError::SerializationFailed {
            event_type: event.event_type.clone(),
            shard_id: event.shard_id,
            source,
        })?;

        let publish_failed = |e: Box<dyn std::error::Error + Send + Sync>| {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
            GatewayError::NatsPublishFailed {
                subject: subject.clone(),
                source: e,
            }
        };

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| publish_failed(Box::new(e)))?
            .await
            .map_err(|e| publish_failed(Box::new(e)))?;

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        debug!(
            subject,
            stream = %ack.stream,
            seq = ack.sequence,
            event_id = %event.event_id,
            "Event published"
        );
        Ok(())
    }
}

#[async_trait]
impl EventListener for Arc<NatsPublisher> {
    async fn on_event(&self, event: &DispatchEvent) {
        let Some(payload) = serialize_event(event) else {
            return;
        };
        if let Err(e) = self.publish_event(&payload).await {
            warn!(shard_id = event.shard_id, event = %event.name, error = %e, "Failed to forward event");
        }
    }
}

/// Create the forwarding streams if they do not exist yet
pub async fn ensure_streams(js: &JsContext) -> Result<(), GatewayError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    let configs = [
        (streams::COMMANDS, subjects::COMMANDS, Duration::from_secs(60)),
        (streams::EVENTS, subjects::EVENTS, Duration::from_secs(300)),
    ];

    for (name, prefix, max_age) in configs {
        let config = Config {
            name: name.to_string(),
            subjects: vec![format!("{prefix}.>")],
            retention: RetentionPolicy::Limits,
            max_age,
            storage: StorageType::Memory,
            ..Default::default()
        };
        js.get_or_create_stream(config)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;
        debug!(stream = name, "Stream ready");
    }

    info!("NATS streams configured");
    Ok(())
}
