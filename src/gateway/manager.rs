//! Shard manager
//!
//! Discovers the gateway URL and recommended shard count, then runs one
//! [`GatewaySession`] task per shard id assigned to this process.

use super::identify::IdentifyQueue;
use super::session::{GatewaySession, ShardHandle, ShardInfo};
use super::state::ShardState;
use crate::config::{GatewayConfig, SessionConfig};
use crate::context::Context;
use crate::error::GatewayError;
use crate::events::EventFilter;
use crate::http::GatewayBotInfo;
use crate::voice::{VoiceIdentify, VoiceTracker};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Discovery attempts before giving up
pub const DISCOVERY_ATTEMPTS: u32 = 3;
pub const DISCOVERY_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Full socket URL for a discovered gateway host
pub fn gateway_url(base: &str, api_version: u8, compress: bool) -> String {
    let mut url = format!(
        "{}/?v={api_version}&encoding=json",
        base.trim_end_matches('/')
    );
    if compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

/// Owns every session of this process
pub struct ShardManager {
    state: ShardState,
    handles: BTreeMap<u64, ShardHandle>,
    tasks: Vec<(u64, JoinHandle<Option<GatewayError>>)>,
    voice: VoiceTracker,
    shutdown_tx: broadcast::Sender<()>,
}

impl ShardManager {
    /// Discover the gateway and start the shards named by `config`.
    pub async fn connect(config: &GatewayConfig, ctx: &Context) -> Result<Self, GatewayError> {
        let info = discover(ctx).await?;
        let total_shards = config.total_shards.unwrap_or(info.shards).max(1);
        let shard_ids = match &config.shard_ids {
            Some(ids) => ids.clone(),
            None => (0..total_shards).collect(),
        };

        info!(
            url = %info.url,
            recommended = info.shards,
            total_shards,
            shard_count = shard_ids.len(),
            session_starts_remaining = info.session_start_limit.remaining,
            max_concurrency = info.session_start_limit.max_concurrency,
            "Gateway discovered"
        );

        let url = gateway_url(&info.url, config.session.api_version, config.session.compress);
        let identify = Arc::new(IdentifyQueue::new(info.session_start_limit.max_concurrency));
        Self::start(ctx, &config.session, &url, total_shards, shard_ids, identify)
    }

    /// Start sessions against an already known gateway URL (query included).
    /// Every session paces its Identify through `identify`.
    pub fn start(
        ctx: &Context,
        session: &SessionConfig,
        url: &str,
        total_shards: u64,
        shard_ids: Vec<u64>,
        identify: Arc<IdentifyQueue>,
    ) -> Result<Self, GatewayError> {
        if let Some(bad) = shard_ids.iter().find(|&&id| id >= total_shards) {
            return Err(GatewayError::Config(format!(
                "shard id {bad} is out of range for {total_shards} shards"
            )));
        }
        if shard_ids.is_empty() {
            return Err(GatewayError::Config("no shard ids to run".to_string()));
        }

        let state = ShardState::new(shard_ids.iter().copied(), total_shards);
        let voice = VoiceTracker::new();
        ctx.events.subscribe(EventFilter::All, voice.clone());

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::with_capacity(shard_ids.len());

        for shard_id in shard_ids {
            let info = ShardInfo {
                id: shard_id,
                total: total_shards,
            };
            let (session, handle) = GatewaySession::new(
                info,
                url,
                session,
                ctx,
                state.clone(),
                Arc::clone(&identify),
            );
            let mut shutdown_rx = shutdown_tx.subscribe();

            let task = tokio::spawn(async move {
                tokio::select! {
                    result = session.run() => result.err(),
                    _ = shutdown_rx.recv() => {
                        info!(shard_id, "Shard received shutdown signal");
                        None
                    }
                }
            });

            handles.insert(shard_id, handle);
            tasks.push((shard_id, task));
        }

        info!(shards = handles.len(), total_shards, "Shard manager started");

        Ok(Self {
            state,
            handles,
            tasks,
            voice,
            shutdown_tx,
        })
    }

    /// Shared state (for health checks)
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    pub fn shard(&self, shard_id: u64) -> Option<&ShardHandle> {
        self.handles.get(&shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardHandle> {
        self.handles.values()
    }

    /// Shard responsible for a guild: `(guild_id >> 22) % total`
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<&ShardHandle> {
        let total = self.state.total_shards().max(1);
        self.shard((guild_id >> 22) % total)
    }

    /// Identify-equivalent for a voice connection in `guild_id`
    pub fn voice_identify(&self, guild_id: &str) -> Option<VoiceIdentify> {
        self.voice.voice_identify(guild_id)
    }

    /// Tear down every session: sockets close and heartbeats stop with the
    /// session tasks.
    pub fn disconnect(&self) {
        info!(shards = self.handles.len(), "Disconnecting all shards");
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for every session to end. Returns the fatal errors shards
    /// stopped with. Cancel-safe: sessions that already ended are not
    /// waited on again.
    pub async fn wait(&mut self) -> Vec<GatewayError> {
        let mut failures = Vec::new();
        while let Some((shard_id, task)) = self.tasks.last_mut() {
            let shard_id = *shard_id;
            let outcome = task.await;
            self.tasks.pop();
            match outcome {
                Ok(Some(err)) => failures.push(err),
                Ok(None) => {}
                Err(e) => error!(shard_id, error = %e, "Shard task panicked"),
            }
        }
        info!(failed = failures.len(), "Shard sessions ended");
        failures
    }
}

/// `GET /gateway/bot` with a fixed pause between attempts. Client errors
/// (bad token) are not retried.
async fn discover(ctx: &Context) -> Result<GatewayBotInfo, GatewayError> {
    let mut attempt = 1;
    loop {
        match ctx.http.get_gateway_bot().await {
            Ok(info) => return Ok(info),
            Err(e) if e.is_recoverable() && attempt < DISCOVERY_ATTEMPTS => {
                warn!(attempt, error = %e, "Gateway discovery failed, retrying");
                attempt += 1;
                tokio::time::sleep(DISCOVERY_RETRY_PAUSE).await;
            }
            Err(e) => return Err(GatewayError::Discovery(e)),
        }
    }
}
