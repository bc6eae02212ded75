//! Identify pacing
//!
//! The gateway accepts `max_concurrency` Identify handshakes per 5 second
//! window, one per rate-limit key `shard_id % max_concurrency`. Identifies
//! over the limit are answered with InvalidSession, so every session of the
//! process waits here before opening a socket it will Identify on. Resumes
//! are not limited.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spacing between two Identifies on the same key
pub const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct IdentifyQueue {
    interval: Duration,
    /// Last Identify per key. The lock is held while waiting, so callers on
    /// one key go through in arrival order.
    keys: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyQueue {
    pub fn new(max_concurrency: u64) -> Self {
        Self::with_interval(max_concurrency, IDENTIFY_INTERVAL)
    }

    pub fn with_interval(max_concurrency: u64, interval: Duration) -> Self {
        let keys = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { interval, keys }
    }

    pub fn max_concurrency(&self) -> u64 {
        self.keys.len() as u64
    }

    /// Rate-limit key of a shard
    pub fn key_for(&self, shard_id: u64) -> usize {
        (shard_id % self.max_concurrency()) as usize
    }

    /// Wait until `shard_id` may Identify. Returns how long the caller waited.
    pub async fn acquire(&self, shard_id: u64) -> Duration {
        let start = Instant::now();
        let mut last = self.keys[self.key_for(shard_id)].lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
        start.elapsed()
    }
}

impl Default for IdentifyQueue {
    fn default() -> Self {
        Self::new(1)
    }
}
