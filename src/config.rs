//! Gateway configuration module
//!
//! Handles loading configuration from environment variables. Parsing goes
//! through [`GatewayConfig::from_lookup`] so it can be exercised without
//! touching the process environment.

use crate::error::GatewayError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default REST API base (versioned prefix is appended per request)
pub const DEFAULT_API_BASE: &str = "https://discord.com/api";

/// Default REST / gateway protocol version
pub const DEFAULT_API_VERSION: u8 = 10;

/// Settings every [`GatewaySession`](crate::gateway::GatewaySession) needs to
/// identify and stay connected.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub token: String,
    pub api_version: u8,
    /// Request zlib-stream transport compression
    pub compress: bool,
    /// Members above which a guild is considered large (50..=250)
    pub large_threshold: u16,
    pub reconnect: ReconnectPolicy,
}

/// Reconnect / connect-retry pacing for a session.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Bounded connect attempts per connection cycle
    pub max_connect_attempts: u32,
    /// Pause between failed connect attempts
    pub connect_retry_pause: Duration,
    /// First reconnect delay; doubles per consecutive failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Apply a random 1-5s wait before re-identifying after InvalidSession
    pub invalid_session_jitter: bool,
    /// Consecutive cycles without reaching Ready before giving up
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_connect_attempts: 5,
            connect_retry_pause: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            invalid_session_jitter: true,
            max_consecutive_failures: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-indexed):
    /// `initial * 2^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Settings for the REST dispatcher and its rate limiter.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub token: String,
    pub api_base: String,
    pub api_version: u8,
    pub user_agent: String,
    /// Transparent 429 retries before surfacing `HttpError::RateLimited`
    pub max_rate_limit_retries: u32,
    /// Extra slack added on top of the server reset instant
    pub reset_padding: Duration,
    pub request_timeout: Duration,
}

impl HttpConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION,
            user_agent: default_user_agent(),
            max_rate_limit_retries: 5,
            reset_padding: Duration::ZERO,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Base URL plus versioned path prefix, e.g. `https://discord.com/api/v10`
    pub fn versioned_base(&self) -> String {
        format!("{}/v{}", self.api_base.trim_end_matches('/'), self.api_version)
    }
}

fn default_user_agent() -> String {
    format!(
        "DiscordBot ({}, {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub session: SessionConfig,
    pub http: HttpConfig,

    /// Overrides the recommended shard count from discovery
    pub total_shards: Option<u64>,

    /// Shard ids this process runs; `None` means all of them
    pub shard_ids: Option<Vec<u64>>,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("DISCORD_TOKEN")
            .or_else(|| lookup("DISCORD_BOT_TOKEN"))
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let api_version: u8 = parse_or(&lookup, "API_VERSION", DEFAULT_API_VERSION)?;
        let api_base = lookup("API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let large_threshold: u16 = parse_or(&lookup, "LARGE_THRESHOLD", 250)?;
        let reconnect = ReconnectPolicy {
            max_connect_attempts: parse_or(&lookup, "MAX_CONNECT_ATTEMPTS", 5)?,
            invalid_session_jitter: parse_bool_or(&lookup, "INVALID_SESSION_JITTER", true)?,
            ..ReconnectPolicy::default()
        };

        let session = SessionConfig {
            token: token.clone(),
            api_version,
            compress: parse_bool_or(&lookup, "COMPRESS", true)?,
            large_threshold: large_threshold.clamp(50, 250),
            reconnect,
        };

        let http = HttpConfig {
            api_base,
            api_version,
            max_rate_limit_retries: parse_or(&lookup, "MAX_RATE_LIMIT_RETRIES", 5)?,
            reset_padding: Duration::from_millis(parse_or(&lookup, "RESET_PADDING_MS", 0u64)?),
            ..HttpConfig::new(token)
        };

        let total_shards = lookup("TOTAL_SHARDS")
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    GatewayError::Config(format!("TOTAL_SHARDS must be a valid number: {e}"))
                })
            })
            .transpose()?;
        if total_shards == Some(0) {
            return Err(GatewayError::Config("TOTAL_SHARDS must be at least 1".to_string()));
        }

        let shard_ids = lookup("SHARD_IDS").map(|v| parse_shard_ids(&v)).transpose()?;

        let nats_url = lookup("NATS_URL");

        let http_port = lookup("HTTP_PORT")
            .or_else(|| lookup("METRICS_PORT"))
            .unwrap_or_else(|| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            session,
            http,
            total_shards,
            shard_ids,
            nats_url,
            http_port,
            log_level,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, GatewayError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{key} must be a valid number: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "TRUE" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "no") => Ok(false),
        Some(other) => Err(GatewayError::Config(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

/// Parse `"0,2,5"` or `"0-3"` (or a mix, `"0-3,8"`) into shard ids.
pub fn parse_shard_ids(raw: &str) -> Result<Vec<u64>, GatewayError> {
    let invalid = |part: &str| GatewayError::Config(format!("SHARD_IDS has invalid entry '{part}'"));

    let mut ids = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u64 = start.trim().parse().map_err(|_| invalid(part))?;
            let end: u64 = end.trim().parse().map_err(|_| invalid(part))?;
            if start > end {
                return Err(invalid(part));
            }
            ids.extend(start..=end);
        } else {
            ids.push(part.parse().map_err(|_| invalid(part))?);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(GatewayError::Config("SHARD_IDS must name at least one shard".to_string()));
    }
    Ok(ids)
}
