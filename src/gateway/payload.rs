//! Gateway envelope and payload shapes
//!
//! Only the fields the session engine itself reads or writes are typed here.
//! Dispatch bodies stay raw JSON and are decoded outside the core.

use super::opcode::OpCode;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The universal gateway message wrapper, both directions.
///
/// `s` / `t` are only present on Dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub op: OpCode,
    pub d: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Wire shape before opcode validation, so unknown opcodes can be told apart
/// from malformed JSON.
#[derive(Deserialize)]
struct RawEnvelope {
    op: u64,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

impl Envelope {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self { op, d, s: None, t: None }
    }

    /// Parse one complete gateway message.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        let op = OpCode::from_u64(raw.op).ok_or(ProtocolError::UnknownOpcode(raw.op))?;
        Ok(Self {
            op,
            d: raw.d,
            s: raw.s,
            t: raw.t,
        })
    }

    /// Heartbeat carrying the last sequence seen (`null` before any dispatch)
    pub fn heartbeat(last_seq: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, last_seq.map_or(Value::Null, Value::from))
    }

    pub fn identify(payload: &IdentifyPayload) -> Self {
        Self::new(OpCode::Identify, to_value(payload))
    }

    pub fn resume(payload: &ResumePayload) -> Self {
        Self::new(OpCode::Resume, to_value(payload))
    }

    pub fn status_update(payload: &PresenceUpdate) -> Self {
        Self::new(OpCode::StatusUpdate, to_value(payload))
    }

    pub fn voice_state_update(payload: &VoiceStateUpdate) -> Self {
        Self::new(OpCode::VoiceStateUpdate, to_value(payload))
    }

    pub fn request_guild_members(payload: &RequestGuildMembers) -> Self {
        Self::new(OpCode::RequestGuildMembers, to_value(payload))
    }

    pub fn to_json(&self) -> String {
        // Envelope holds only a Value and primitives; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// `d` of Hello
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds
    pub heartbeat_interval: u64,
}

/// Client properties sent with Identify
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// `d` of Identify
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: ConnectionProperties,
    pub compress: bool,
    pub large_threshold: u16,
    /// `[shard_id, shard_count]`
    pub shard: [u64; 2],
}

/// `d` of Resume
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

/// The parts of READY the session engine keeps
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub guilds: Vec<Value>,
}

/// `d` of StatusUpdate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceUpdate {
    /// Unix time in milliseconds since the client went idle
    pub since: Option<u64>,
    pub activities: Vec<Value>,
    pub status: String,
    pub afk: bool,
}

/// `d` of VoiceStateUpdate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    /// `None` disconnects from voice
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// `d` of RequestGuildMembers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    pub query: String,
    pub limit: u32,
}
