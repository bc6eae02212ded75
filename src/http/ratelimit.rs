//! Bucket registry and global throttle

use super::bucket::{Bucket, RateLimitHeaders};
use super::route::RouteKey;
use crate::metrics::GatewayMetrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Process-wide pause after a global 429. Shared by every bucket.
#[derive(Debug, Default)]
pub struct GlobalThrottle {
    until: Mutex<Option<Instant>>,
}

impl GlobalThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_throttled(&self) -> bool {
        self.until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    /// Active deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        let until = *self.until.lock();
        until.filter(|until| Instant::now() < *until)
    }

    /// Extend the pause to `deadline`. An earlier deadline never shortens an
    /// active pause. Returns the deadline now in force.
    pub fn lock_until(&self, deadline: Instant) -> Instant {
        let mut until = self.until.lock();
        let effective = match *until {
            Some(current) if current > deadline => current,
            _ => deadline,
        };
        *until = Some(effective);
        effective
    }

    /// Clear the flag once its deadline passed. Returns true if it was cleared.
    fn release_if_elapsed(&self) -> bool {
        let mut until = self.until.lock();
        match *until {
            Some(deadline) if Instant::now() >= deadline => {
                *until = None;
                true
            }
            _ => false,
        }
    }
}

/// All buckets of the process, keyed by route
pub struct RateLimiter {
    buckets: Arc<DashMap<RouteKey, Arc<Bucket>>>,
    global: Arc<GlobalThrottle>,
    padding: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl RateLimiter {
    pub fn new(padding: Duration, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            global: Arc::new(GlobalThrottle::new()),
            padding,
            metrics,
        }
    }

    /// Wait until a request on `route` may be sent. `retry` puts the caller
    /// at the front of its bucket's queue.
    pub async fn acquire(&self, route: &RouteKey, retry: bool) {
        loop {
            if let Some(bucket) = self.bucket(route) {
                bucket.acquire(retry).await;
                return;
            }
            // No bucket yet: only the global pause applies
            match self.global.deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => return,
            }
        }
    }

    /// Apply the rate-limit headers of a response, creating the bucket on
    /// first sight.
    pub fn update(&self, route: &RouteKey, headers: &RateLimitHeaders) {
        if !headers.has_limits() {
            return;
        }
        let bucket = self.bucket_or_insert(route, || {
            let limit = headers.limit.or(headers.remaining).unwrap_or(1);
            let window = headers.reset_after.unwrap_or(Duration::from_secs(1));
            debug!(route = %route, limit, "Creating bucket");
            Bucket::new(
                route.clone(),
                limit,
                window,
                Arc::clone(&self.global),
                self.padding,
            )
        });
        bucket.update(headers);
    }

    /// React to a 429 on `route`.
    pub fn on_rate_limited(&self, route: &RouteKey, retry_after: Duration, global: bool) {
        self.metrics.record_rate_limited(route.as_str(), global);

        if global {
            self.lock_global(retry_after);
            return;
        }

        warn!(route = %route, retry_after_ms = retry_after.as_millis() as u64, "Route rate limited");
        let bucket = self.bucket_or_insert(route, || {
            Bucket::defensive(route.clone(), Arc::clone(&self.global), self.padding)
        });
        bucket.rate_limited(retry_after);
    }

    /// Pause every bucket for `retry_after`, then re-check all of them at once.
    pub fn lock_global(&self, retry_after: Duration) {
        let deadline = self.global.lock_until(Instant::now() + retry_after);
        self.metrics.set_global_throttled(true);
        warn!(retry_after_ms = retry_after.as_millis() as u64, "Global rate limit hit");

        let global = Arc::clone(&self.global);
        let buckets = Arc::clone(&self.buckets);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // A later 429 may have pushed the deadline out; its own task wakes then.
            if !global.release_if_elapsed() {
                return;
            }
            metrics.set_global_throttled(false);

            let waiting: Vec<Arc<Bucket>> = buckets.iter().map(|b| Arc::clone(b.value())).collect();
            info!(buckets = waiting.len(), "Global rate limit lifted");
            for bucket in waiting {
                bucket.check();
            }
        });
    }

    pub fn bucket(&self, route: &RouteKey) -> Option<Arc<Bucket>> {
        self.buckets.get(route).map(|b| Arc::clone(b.value()))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_globally_throttled(&self) -> bool {
        self.global.is_throttled()
    }

    fn bucket_or_insert(&self, route: &RouteKey, create: impl FnOnce() -> Bucket) -> Arc<Bucket> {
        if let Some(bucket) = self.bucket(route) {
            return bucket;
        }
        let entry = self
            .buckets
            .entry(route.clone())
            .or_insert_with(|| Arc::new(create()));
        Arc::clone(entry.value())
    }
}
