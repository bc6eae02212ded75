//! Rate-limited REST dispatcher
//!
//! Every call goes through the [`RateLimiter`] before it is sent and feeds
//! the response headers back into it afterwards. 429s are absorbed here;
//! callers only see them once the retry cap is exhausted.

use super::bucket::RateLimitHeaders;
use super::ratelimit::RateLimiter;
use super::route::RouteKey;
use crate::config::HttpConfig;
use crate::error::{ApiErrorBody, HttpError};
use crate::metrics::GatewayMetrics;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fallback wait when a 429 names no retry time at all
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Body of a 429 response
#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// `GET /gateway/bot`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u64,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u64,
}

fn default_max_concurrency() -> u64 {
    1
}

pub struct RequestDispatcher {
    client: Client,
    base: String,
    limiter: Arc<RateLimiter>,
    metrics: Arc<GatewayMetrics>,
    max_retries: u32,
}

impl RequestDispatcher {
    pub fn new(config: HttpConfig, metrics: Arc<GatewayMetrics>) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bot {}", config.token))
            .map_err(|_| HttpError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base: config.versioned_base(),
            limiter: Arc::new(RateLimiter::new(config.reset_padding, Arc::clone(&metrics))),
            metrics,
            max_retries: config.max_rate_limit_retries,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Send one request. `path` is relative to the versioned base, e.g.
    /// `/channels/123/messages`. Returns the decoded JSON body (`Null` for
    /// empty responses).
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, HttpError> {
        let route = RouteKey::new(&method, path);
        let url = format!("{}{}", self.base, path);
        let mut retries: u32 = 0;

        loop {
            self.limiter.acquire(&route, retries > 0).await;

            let mut builder = self.client.request(method.clone(), url.as_str());
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;

            let status = response.status();
            let headers = RateLimitHeaders::from_headers(response.headers());
            self.limiter.update(&route, &headers);
            self.metrics.record_http(route.as_str(), status.as_u16());

            let bytes = response.bytes().await?;
            debug!(route = %route, status = status.as_u16(), len = bytes.len(), "Response");

            if status == StatusCode::TOO_MANY_REQUESTS {
                let limited: RateLimitBody = serde_json::from_slice(&bytes).unwrap_or_default();
                let retry_after = limited
                    .retry_after
                    .and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
                    .or(headers.retry_after)
                    .unwrap_or(DEFAULT_RETRY_AFTER);
                let global = headers.global || limited.global;

                if retries >= self.max_retries {
                    return Err(HttpError::RateLimited {
                        route: route.to_string(),
                        retries,
                        retry_after: retry_after.as_secs_f64(),
                    });
                }
                retries += 1;
                self.limiter.on_rate_limited(&route, retry_after, global);
                continue;
            }

            if status.is_success() {
                if bytes.is_empty() || status == StatusCode::NO_CONTENT {
                    return Ok(Value::Null);
                }
                return serde_json::from_slice(&bytes).map_err(|source| HttpError::Decode {
                    route: route.to_string(),
                    source,
                });
            }

            if status.is_server_error() {
                warn!(route = %route, status = status.as_u16(), "Server error");
                return Err(HttpError::Server {
                    route: route.to_string(),
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }

            let error = serde_json::from_slice::<ApiErrorBody>(&bytes).unwrap_or_else(|_| ApiErrorBody {
                message: String::from_utf8_lossy(&bytes).into_owned(),
                ..ApiErrorBody::default()
            });
            return Err(HttpError::Client {
                route: route.to_string(),
                status: status.as_u16(),
                error,
            });
        }
    }

    /// Like [`request`](Self::request), decoding the body into `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, HttpError> {
        let value = self.request(method.clone(), path, body).await?;
        serde_json::from_value(value).map_err(|source| HttpError::Decode {
            route: RouteKey::new(&method, path).to_string(),
            source,
        })
    }

    pub async fn get_gateway_bot(&self) -> Result<GatewayBotInfo, HttpError> {
        self.request_as(Method::GET, "/gateway/bot", None).await
    }

    pub async fn get_current_user(&self) -> Result<Value, HttpError> {
        self.request(Method::GET, "/users/@me", None).await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Value, HttpError> {
        self.request(Method::GET, &format!("/channels/{channel_id}"), None)
            .await
    }

    pub async fn create_message(&self, channel_id: &str, content: &str) -> Result<Value, HttpError> {
        let body = json!({ "content": content });
        self.request(
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(&body),
        )
        .await
    }

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Value, HttpError> {
        let body = json!({ "content": content });
        self.request(
            Method::PATCH,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            Some(&body),
        )
        .await
    }

    pub async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), HttpError> {
        self.request(
            Method::DELETE,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            None,
        )
        .await
        .map(drop)
    }

    /// `emoji` is a unicode emoji or `name:id` for a custom one.
    pub async fn create_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), HttpError> {
        let emoji = encode_path_segment(emoji);
        self.request(
            Method::PUT,
            &format!("/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me"),
            None,
        )
        .await
        .map(drop)
    }
}

/// Percent-encode everything outside the unreserved set
fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() * 3);
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b':') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
