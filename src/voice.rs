//! Voice connection handoff
//!
//! The voice transport opens its own connection and only needs four values
//! from the main gateway: the bot's user id (READY), its voice session id
//! (VOICE_STATE_UPDATE for the bot user) and the voice server token and
//! endpoint (VOICE_SERVER_UPDATE). [`VoiceTracker`] collects them per guild.

use crate::events::{DispatchEvent, EventListener};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Identify-equivalent for a voice connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceIdentify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

#[derive(Debug, Default, Clone)]
struct GuildVoice {
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
}

/// Listener assembling [`VoiceIdentify`] values. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct VoiceTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    user_id: RwLock<Option<String>>,
    guilds: DashMap<String, GuildVoice>,
}

impl VoiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.read().clone()
    }

    /// Everything needed to open a voice connection in `guild_id`, once all
    /// pieces have arrived.
    pub fn voice_identify(&self, guild_id: &str) -> Option<VoiceIdentify> {
        let user_id = self.user_id()?;
        let guild = self.inner.guilds.get(guild_id)?;
        Some(VoiceIdentify {
            server_id: guild_id.to_string(),
            user_id,
            session_id: guild.session_id.clone()?,
            token: guild.token.clone()?,
            endpoint: guild.endpoint.clone()?,
        })
    }

    /// Apply one dispatch. Only READY and the two voice events are looked at.
    pub fn observe(&self, name: &str, payload: &Value) {
        match name {
            "READY" => {
                if let Some(id) = payload["user"]["id"].as_str() {
                    *self.inner.user_id.write() = Some(id.to_string());
                }
            }
            "VOICE_STATE_UPDATE" => self.on_voice_state(payload),
            "VOICE_SERVER_UPDATE" => self.on_voice_server(payload),
            _ => {}
        }
    }

    fn on_voice_state(&self, payload: &Value) {
        let (Some(guild_id), Some(user_id)) =
            (payload["guild_id"].as_str(), payload["user_id"].as_str())
        else {
            return;
        };
        if self.user_id().as_deref() != Some(user_id) {
            return;
        }

        if payload["channel_id"].is_null() {
            debug!(guild_id, "Left voice channel");
            self.inner.guilds.remove(guild_id);
            return;
        }

        let session_id = payload["session_id"].as_str().map(str::to_string);
        self.inner
            .guilds
            .entry(guild_id.to_string())
            .or_default()
            .session_id = session_id;
    }

    fn on_voice_server(&self, payload: &Value) {
        let Some(guild_id) = payload["guild_id"].as_str() else {
            return;
        };
        let mut guild = self.inner.guilds.entry(guild_id.to_string()).or_default();
        guild.token = payload["token"].as_str().map(str::to_string);
        // A null endpoint means the voice server went away; wait for the next update.
        guild.endpoint = payload["endpoint"].as_str().map(str::to_string);
        debug!(guild_id, endpoint = ?guild.endpoint, "Voice server updated");
    }
}

#[async_trait]
impl EventListener for VoiceTracker {
    async fn on_event(&self, event: &DispatchEvent) {
        self.observe(&event.name, &event.payload);
    }
}
