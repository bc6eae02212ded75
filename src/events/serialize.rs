//! Event serialization for message broker
//!
//! Converts raw dispatch events to flat JSON records for NATS publishing.

use super::bus::DispatchEvent;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Generic gateway event payload
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    pub event_type: String,
    pub shard_id: u64,
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub data: Value,
}

/// Serialize a dispatch to a GatewayEvent payload
///
/// Returns None for session bookkeeping events that are not forwarded.
pub fn serialize_event(event: &DispatchEvent) -> Option<GatewayEvent> {
    let event_type = broker_event_type(&event.name)?;
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);

    let d = &event.payload;
    let guild_id = if event.name.starts_with("GUILD_") && !event.name.starts_with("GUILD_MEMBER") {
        id_field(d, "guild_id").or_else(|| id_field(d, "id"))
    } else {
        id_field(d, "guild_id")
    };
    let user_id = id_field(&d["user"], "id")
        .or_else(|| id_field(&d["author"], "id"))
        .or_else(|| id_field(&d["member"]["user"], "id"))
        .or_else(|| id_field(d, "user_id"));

    Some(GatewayEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type,
        shard_id: event.shard_id,
        timestamp,
        guild_id,
        channel_id: id_field(d, "channel_id"),
        user_id,
        data: d.clone(),
    })
}

/// Map a gateway event name to the broker's dotted event type.
pub fn broker_event_type(name: &str) -> Option<String> {
    let mapped = match name {
        // Session bookkeeping stays inside the process
        "READY" | "RESUMED" => return None,
        "GUILD_CREATE" => "guild.join",
        "GUILD_DELETE" => "guild.leave",
        "GUILD_UPDATE" => "guild.update",
        "GUILD_MEMBER_ADD" => "member.join",
        "GUILD_MEMBER_REMOVE" => "member.leave",
        "GUILD_MEMBER_UPDATE" => "member.update",
        "INTERACTION_CREATE" => "interaction.create",
        other => return Some(default_event_type(other)),
    };
    Some(mapped.to_string())
}

/// `MESSAGE_REACTION_ADD` → `message_reaction.add`
fn default_event_type(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.rsplit_once('_') {
        Some((subject, action)) => format!("{subject}.{action}"),
        None => lower,
    }
}

fn id_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
