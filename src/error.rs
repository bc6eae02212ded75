//! Domain error types for shardwire
//!
//! Three taxonomies, one per concern:
//! - [`GatewayError`]: gateway session / shard manager failures
//! - [`ProtocolError`]: a single inbound frame could not be turned into an envelope
//! - [`HttpError`]: REST dispatch failures after rate limiting and retries
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns one of the typed results below.

use serde::Deserialize;
use thiserror::Error;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// Fatal variants (`Authentication`, `Sharding`, `Rejected`) are surfaced once
/// and never retried.
///
/// Example log output:
/// ```text
/// GatewayError::Authentication { shard_id: 3, code: 4004 }
/// → "shard 3 closed with 4004: authentication failed (check the bot token)"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Host unreachable / TLS failure after the bounded connect retries
    #[error("shard {shard_id} could not connect after {attempts} attempts")]
    Connection {
        shard_id: u64,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Close code 4004
    #[error("shard {shard_id} closed with {code}: authentication failed (check the bot token)")]
    Authentication { shard_id: u64, code: u16 },

    /// Close codes 4010 / 4011
    #[error("shard {shard_id} closed with {code}: invalid shard or sharding required (request more shards)")]
    Sharding { shard_id: u64, code: u16 },

    /// Close codes the client cannot recover from by reconnecting (4012 and above)
    #[error("shard {shard_id} closed with {code}: connection rejected by the gateway")]
    Rejected { shard_id: u64, code: u16 },

    /// Shard exceeded consecutive failed connection cycles
    #[error("shard {shard_id} exceeded consecutive error threshold ({count}/{max})")]
    ShardCircuitBroken { shard_id: u64, count: u32, max: u32 },

    /// Gateway URL / shard count discovery failed
    #[error("gateway discovery failed")]
    Discovery(#[source] HttpError),

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Event serialization failed
    #[error("event serialization failed for {event_type} on shard {shard_id}")]
    SerializationFailed {
        event_type: String,
        shard_id: u64,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Authentication { .. } => "authentication",
            Self::Sharding { .. } => "sharding",
            Self::Rejected { .. } => "rejected",
            Self::ShardCircuitBroken { .. } => "circuit_broken",
            Self::Discovery(_) => "discovery",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::SerializationFailed { .. } => "serialization",
            Self::Config(_) => "config",
        }
    }

    /// Fatal errors end a shard for good: no reconnect is attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::Sharding { .. }
                | Self::Rejected { .. }
                | Self::ShardCircuitBroken { .. }
                | Self::Connection { .. }
        )
    }
}

/// A frame that could not be decoded into an envelope.
///
/// Never fatal: the session answers with a reconnect.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed gateway payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u64),

    #[error("inflate failed: {0}")]
    Inflate(String),

    #[error("decompressed payload is not valid UTF-8")]
    Utf8,
}

impl ProtocolError {
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Decode(_) => "protocol_decode",
            Self::UnknownOpcode(_) => "protocol_opcode",
            Self::Inflate(_) => "protocol_inflate",
            Self::Utf8 => "protocol_utf8",
        }
    }
}

/// Structured error body returned by the REST API on 4xx responses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u64,
    #[serde(default)]
    pub message: String,
    /// Per-field validation errors, kept raw
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

/// REST dispatch errors
#[derive(Error, Debug)]
pub enum HttpError {
    /// 429s exceeded the transparent retry cap
    #[error("route {route} still rate limited after {retries} retries (retry after {retry_after:.3}s)")]
    RateLimited {
        route: String,
        retries: u32,
        retry_after: f64,
    },

    /// 5xx / gateway unavailable: the caller may retry
    #[error("server error {status} on {route}")]
    Server {
        route: String,
        status: u16,
        body: String,
    },

    /// Any other 4xx: terminal
    #[error("request to {route} rejected with {status}: {} (code {})", .error.message, .error.code)]
    Client {
        route: String,
        status: u16,
        error: ApiErrorBody,
    },

    #[error("HTTP transport failed")]
    Transport(#[from] reqwest::Error),

    /// Token cannot be carried in an Authorization header
    #[error("bot token contains characters not allowed in a header")]
    InvalidToken,

    #[error("could not decode response from {route}")]
    Decode {
        route: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server",
            Self::Client { .. } => "client",
            Self::Transport(_) => "transport",
            Self::InvalidToken => "invalid_token",
            Self::Decode { .. } => "decode",
        }
    }

    /// Whether a caller-level retry may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::RateLimited { .. } | Self::Transport(_)
        )
    }
}
