//! REST side: route keys, per-route buckets, the global throttle and the
//! dispatcher that ties them to reqwest.

pub mod bucket;
pub mod client;
pub mod ratelimit;
pub mod route;

pub use bucket::{Bucket, BucketSnapshot, RateLimitHeaders};
pub use client::{GatewayBotInfo, RequestDispatcher, SessionStartLimit};
pub use ratelimit::{GlobalThrottle, RateLimiter};
pub use route::RouteKey;
