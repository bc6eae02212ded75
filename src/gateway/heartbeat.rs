//! Heartbeat liveness for one shard
//!
//! The timer never runs on its own task: the session's event loop owns it and
//! polls [`HeartbeatTimer::tick`] alongside the socket, so firings are always
//! serialized with every other state change of the shard.
//!
//! ```text
//!   Hello(interval) ──> start()
//!        every interval:  ack_missed >= 3 ? ──yes──> Zombie (reconnect)
//!                                          └─no──> ack_missed += 1, send Heartbeat{d: last_seq}
//!   HeartbeatAck ──> ack_missed = max(ack_missed - 1, 0)
//! ```

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Unacknowledged heartbeats tolerated before the link is treated as dead
pub const MAX_MISSED_ACKS: u32 = 3;

/// Result of one timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat now
    Send,
    /// Too many missed acks: abandon the connection
    Zombie,
}

#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Option<Interval>,
    period: Option<Duration>,
    ack_missed: u32,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatTimer {
    pub fn new() -> Self {
        Self {
            interval: None,
            period: None,
            ack_missed: 0,
            last_sent: None,
            latency: None,
        }
    }

    /// Arm the timer with the interval from Hello. The first firing happens
    /// one full interval from now.
    pub fn start(&mut self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.period = Some(period);
        self.ack_missed = 0;
    }

    /// Disarm; used when the connection is torn down.
    pub fn stop(&mut self) {
        self.interval = None;
        self.period = None;
        self.ack_missed = 0;
        self.last_sent = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Wait for the next firing. Pends forever while the timer is stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Decide what a firing does and account for the heartbeat about to go out.
    pub fn fire(&mut self) -> Beat {
        if self.ack_missed >= MAX_MISSED_ACKS {
            return Beat::Zombie;
        }
        self.record_sent();
        Beat::Send
    }

    /// Account for a heartbeat sent outside the timer (server-requested).
    pub fn record_sent(&mut self) {
        self.ack_missed += 1;
        self.last_sent = Some(Instant::now());
    }

    /// HeartbeatAck received
    pub fn ack(&mut self) {
        self.ack_missed = self.ack_missed.saturating_sub(1);
        if let Some(sent) = self.last_sent {
            self.latency = Some(sent.elapsed());
        }
    }

    pub fn ack_missed(&self) -> u32 {
        self.ack_missed
    }

    /// Round trip of the most recent acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

impl Default for HeartbeatTimer {
    fn default() -> Self {
        Self::new()
    }
}
