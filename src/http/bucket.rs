//! Per-route token bucket
//!
//! A bucket never holds a caller's thread: callers get a oneshot permit that
//! resolves when a token is granted. Permits are granted strictly in queue
//! order; when tokens run out a single timer task re-runs [`Bucket::check`]
//! at the reset instant.

use super::ratelimit::GlobalThrottle;
use super::route::RouteKey;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Window used when a route is first seen through a 429
pub const DEFENSIVE_LIMIT: u32 = 1;
pub const DEFENSIVE_WINDOW: Duration = Duration::from_secs(2);

/// Rate-limit values carried by one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the bucket refills, from `X-RateLimit-Reset-After` or
    /// derived from the absolute `X-RateLimit-Reset`
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub global: bool,
    /// Server-side bucket hash
    pub bucket: Option<String>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
        let number = |name: &str| text(name).and_then(|v| v.parse::<f64>().ok());
        let seconds = |secs: f64| Duration::try_from_secs_f64(secs.max(0.0)).ok();

        let reset_after = number("x-ratelimit-reset-after")
            .and_then(seconds)
            .or_else(|| number("x-ratelimit-reset").and_then(|at| seconds(at - unix_now())));

        Self {
            limit: text("x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: text("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_after,
            retry_after: number("retry-after").and_then(seconds),
            global: text("x-ratelimit-global").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            bucket: text("x-ratelimit-bucket").map(str::to_string),
        }
    }

    /// Whether the response described a bucket at all
    pub fn has_limits(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some()
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Point-in-time view of a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in: Option<Duration>,
    pub queued: usize,
    /// Values came from the server rather than a local guess
    pub authoritative: bool,
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    /// Length of a local window, used until the server tells us otherwise
    window: Duration,
    /// `None` until a token is spent in the current window
    reset_at: Option<Instant>,
    authoritative: bool,
    queue: VecDeque<oneshot::Sender<()>>,
    timer_scheduled: bool,
}

impl BucketState {
    fn refill_if_elapsed(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset| now >= reset) {
            self.remaining = self.limit;
            self.reset_at = None;
        }
    }

    fn spend(&mut self, now: Instant) {
        self.remaining = self.remaining.saturating_sub(1);
        if self.reset_at.is_none() {
            self.reset_at = Some(now + self.window);
        }
    }
}

#[derive(Debug)]
pub struct Bucket {
    route: RouteKey,
    state: Mutex<BucketState>,
    global: Arc<GlobalThrottle>,
    padding: Duration,
}

impl Bucket {
    pub fn new(
        route: RouteKey,
        limit: u32,
        window: Duration,
        global: Arc<GlobalThrottle>,
        padding: Duration,
    ) -> Self {
        Self {
            route,
            state: Mutex::new(BucketState {
                limit,
                remaining: limit,
                window,
                reset_at: None,
                authoritative: false,
                queue: VecDeque::new(),
                timer_scheduled: false,
            }),
            global,
            padding,
        }
    }

    /// Bucket for a route whose first response was a 429
    pub fn defensive(route: RouteKey, global: Arc<GlobalThrottle>, padding: Duration) -> Self {
        Self::new(route, DEFENSIVE_LIMIT, DEFENSIVE_WINDOW, global, padding)
    }

    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    /// Reserve `n` tokens without queueing. Fails when the queue is not empty
    /// so earlier callers keep their place.
    pub fn take(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill_if_elapsed(now);

        if !state.queue.is_empty() || state.remaining < n {
            return false;
        }
        for _ in 0..n {
            state.spend(now);
        }
        true
    }

    /// Queue a job; the receiver resolves when it may run.
    pub fn submit(self: &Arc<Self>) -> oneshot::Receiver<()> {
        self.enqueue(false)
    }

    /// Queue a job that already waited once (after a 429) ahead of newer ones.
    pub fn resubmit(self: &Arc<Self>) -> oneshot::Receiver<()> {
        self.enqueue(true)
    }

    /// Wait for a token
    pub async fn acquire(self: &Arc<Self>, retry: bool) {
        if !retry && !self.global.is_throttled() && self.take(1) {
            return;
        }
        let permit = if retry { self.resubmit() } else { self.submit() };
        // The sender only goes away with the bucket itself
        let _ = permit.await;
    }

    fn enqueue(self: &Arc<Self>, front: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if front {
                state.queue.push_front(tx);
            } else {
                state.queue.push_back(tx);
            }
        }
        self.check();
        rx
    }

    /// Grant queued jobs while tokens last; otherwise arrange to run again at
    /// the reset instant. Does nothing while the global throttle is active.
    pub fn check(self: &Arc<Self>) {
        if self.global.is_throttled() {
            return;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill_if_elapsed(now);

        while state.remaining > 0 {
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            // Callers that gave up don't consume a token
            if job.send(()).is_ok() {
                state.spend(now);
            }
        }

        if state.queue.is_empty() || state.timer_scheduled {
            return;
        }

        let window = state.window;
        let reset_at = *state.reset_at.get_or_insert(now + window);
        let wake = reset_at + self.padding;
        state.timer_scheduled = true;
        debug!(
            route = %self.route,
            queued = state.queue.len(),
            wait_ms = wake.saturating_duration_since(now).as_millis() as u64,
            "Bucket exhausted, deferring"
        );
        drop(state);

        let bucket = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(wake).await;
            bucket.state.lock().timer_scheduled = false;
            bucket.check();
        });
    }

    /// Overwrite local predictions with server values.
    pub fn update(self: &Arc<Self>, headers: &RateLimitHeaders) {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if let Some(limit) = headers.limit {
                state.limit = limit;
            }
            if let Some(remaining) = headers.remaining {
                state.remaining = remaining;
            }
            if let Some(reset_after) = headers.reset_after {
                state.reset_at = Some(now + reset_after);
                state.window = reset_after.max(state.window);
            }
            state.authoritative = true;
        }
        self.check();
    }

    /// The server rejected a request on this route: nothing runs until
    /// `retry_after` has passed.
    pub fn rate_limited(self: &Arc<Self>, retry_after: Duration) {
        {
            let mut state = self.state.lock();
            state.remaining = 0;
            state.reset_at = Some(Instant::now() + retry_after);
        }
        self.check();
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let state = self.state.lock();
        let now = Instant::now();
        BucketSnapshot {
            limit: state.limit,
            remaining: state.remaining,
            reset_in: state.reset_at.map(|at| at.saturating_duration_since(now)),
            queued: state.queue.len(),
            authoritative: state.authoritative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio_test::{assert_pending, assert_ready};

    fn bucket(limit: u32, window: Duration) -> Arc<Bucket> {
        Arc::new(Bucket::new(
            RouteKey::new(&reqwest::Method::GET, "/test"),
            limit,
            window,
            Arc::new(GlobalThrottle::new()),
            Duration::ZERO,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_request_waits_for_reset() {
        let bucket = bucket(5, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..5 {
            bucket.acquire(false).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.snapshot().remaining, 0);

        bucket.acquire(false).await;
        assert!(start.elapsed() >= Duration::from_secs(1));

        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.remaining, 4);
        assert_eq!(snapshot.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_permit_is_pending_until_reset() {
        let bucket = bucket(1, Duration::from_secs(3));
        assert!(bucket.take(1));

        let mut permit = tokio_test::task::spawn(bucket.submit());
        assert_pending!(permit.poll());
        assert_eq!(bucket.snapshot().queued, 1);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_pending!(permit.poll());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(permit.is_woken());
        assert!(assert_ready!(permit.poll()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_jobs_run_in_submission_order() {
        let bucket = bucket(1, Duration::from_secs(1));
        assert!(bucket.take(1));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let permit = bucket.submit();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _ = permit.await;
                order.lock().push(i);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_job_runs_before_newer_submissions() {
        let bucket = bucket(1, Duration::from_secs(1));
        assert!(bucket.take(1));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (label, permit) in [("new", bucket.submit()), ("retry", bucket.resubmit())] {
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _ = permit.await;
                order.lock().push(label);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["retry", "new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn take_refuses_to_jump_the_queue() {
        let bucket = bucket(1, Duration::from_secs(1));
        assert!(bucket.take(1));
        let _permit = bucket.submit();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        // The queued job got the refilled token
        assert!(!bucket.take(1));
    }

    #[tokio::test(start_paused = true)]
    async fn server_headers_override_local_guess() {
        let bucket = bucket(1, Duration::from_secs(2));
        bucket.update(&RateLimitHeaders {
            limit: Some(5),
            remaining: Some(3),
            reset_after: Some(Duration::from_millis(500)),
            ..Default::default()
        });

        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.limit, 5);
        assert_eq!(snapshot.remaining, 3);
        assert_eq!(snapshot.reset_in, Some(Duration::from_millis(500)));
        assert!(snapshot.authoritative);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_bucket_holds_until_retry_after() {
        let bucket = bucket(5, Duration::from_secs(1));
        bucket.rate_limited(Duration::from_secs(4));

        let start = Instant::now();
        bucket.acquire(true).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[test]
    fn parses_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset-after", HeaderValue::from_static("1.250"));
        headers.insert("x-ratelimit-bucket", HeaderValue::from_static("abcd1234"));
        headers.insert("retry-after", HeaderValue::from_static("2"));
        headers.insert("x-ratelimit-global", HeaderValue::from_static("true"));

        let parsed = RateLimitHeaders::from_headers(&headers);
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1_250)));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
        assert!(parsed.global);
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert!(parsed.has_limits());
    }

    #[test]
    fn absolute_reset_is_used_without_reset_after() {
        let mut headers = HeaderMap::new();
        let reset = format!("{:.3}", unix_now() + 30.0);
        headers.insert("x-ratelimit-reset", HeaderValue::from_str(&reset).unwrap());

        let parsed = RateLimitHeaders::from_headers(&headers);
        let reset_after = parsed.reset_after.unwrap();
        assert!(reset_after > Duration::from_secs(28) && reset_after <= Duration::from_secs(30));
        assert!(!parsed.has_limits());
        assert!(!parsed.global);
    }
}
