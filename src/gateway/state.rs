//! Shard state tracking
//!
//! Central registry of per-shard status keyed by shard id. Sessions report
//! into it; the manager and health endpoints read from it. Nothing holds a
//! reference to a session itself, only its id.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected
    Idle,
    /// Opening the socket
    Connecting,
    /// Socket open, waiting for Hello
    AwaitingHello,
    /// Identify or Resume sent
    Authenticating,
    /// Session established, dispatches flowing
    Ready,
    /// Connection dropped, about to reconnect
    Reconnecting,
    /// Terminal: shut down or fatal close
    Closed,
}

impl ConnectionState {
    /// Returns true if the shard is up or expected to come back on its own
    pub fn is_healthy(&self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub state: ConnectionState,
    pub guilds: u64,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub latency: Option<Duration>,
    pub connected_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            guilds: 0,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            latency: None,
            connected_at: None,
            last_error: None,
        }
    }
}

/// Shared state across all shards of this process
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    shards: DashMap<u64, ShardStateEntry>,
    total_shards: u64,
}

impl ShardState {
    /// Create a new shard state tracker
    pub fn new(shard_ids: impl Iterator<Item = u64>, total_shards: u64) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner {
                shards,
                total_shards,
            }),
        }
    }

    /// Get total shards across the cluster
    pub fn total_shards(&self) -> u64 {
        self.inner.total_shards
    }

    /// Shard ids tracked by this process, ascending
    pub fn shard_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.shards.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Update shard connection state
    pub fn set_state(&self, shard_id: u64, state: ConnectionState) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.state = state;
            match state {
                ConnectionState::Ready => {
                    if entry.connected_at.is_none() {
                        entry.connected_at = Some(Instant::now());
                    }
                }
                ConnectionState::Reconnecting | ConnectionState::Closed => {
                    entry.connected_at = None;
                }
                _ => {}
            }
        }
    }

    /// Update shard guild count
    pub fn set_guilds(&self, shard_id: u64, count: u64) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.guilds = count;
        }
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat acknowledgement
    pub fn record_heartbeat(&self, shard_id: u64, latency: Option<Duration>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
            entry.latency = latency;
        }
    }

    /// Remember the error that closed or degraded the shard
    pub fn record_error(&self, shard_id: u64, error: impl ToString) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_error = Some(error.to_string());
        }
    }

    /// Get state for a specific shard
    pub fn get_state(&self, shard_id: u64) -> Option<ConnectionState> {
        self.inner.shards.get(&shard_id).map(|e| e.state)
    }

    pub fn latency(&self, shard_id: u64) -> Option<Duration> {
        self.inner.shards.get(&shard_id).and_then(|e| e.latency)
    }

    pub fn last_error(&self, shard_id: u64) -> Option<String> {
        self.inner.shards.get(&shard_id).and_then(|e| e.last_error.clone())
    }

    pub fn reconnects(&self, shard_id: u64) -> u64 {
        self.inner
            .shards
            .get(&shard_id)
            .map_or(0, |e| e.reconnects.load(Ordering::Relaxed))
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get total guilds across all shards
    pub fn total_guilds(&self) -> u64 {
        self.inner.shards.iter().map(|e| e.guilds).sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.state.is_ready())
            .count()
    }

    /// Get count of shards that are not closed
    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.state.is_healthy())
            .count()
    }

    /// Get shard count in this process
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Check if process is ready (at least one shard ready)
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Check if every shard is healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }
}
