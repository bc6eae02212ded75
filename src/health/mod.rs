//! Health check endpoints

use crate::gateway::ShardState;
use crate::http::RequestDispatcher;
use crate::metrics::GatewayMetrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Per-shard entry of the readiness report
#[derive(Debug, Serialize)]
pub struct ShardReport {
    pub id: u64,
    pub state: &'static str,
    pub latency_ms: Option<u64>,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: u64,
    pub shards_local: usize,
    pub shards_ready: usize,
    pub guilds_total: u64,
    pub events_received: u64,
    pub rate_limit_buckets: usize,
    pub globally_throttled: bool,
    pub shards: Vec<ShardReport>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub http: Arc<RequestDispatcher>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_report(&state);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

fn ready_report(state: &AppState) -> ReadyResponse {
    let shards = &state.shard_state;
    let limiter = state.http.limiter();

    ReadyResponse {
        ready: shards.is_ready(),
        shards_total: shards.total_shards(),
        shards_local: shards.shard_count(),
        shards_ready: shards.ready_shards(),
        guilds_total: shards.total_guilds(),
        events_received: shards.total_events_received(),
        rate_limit_buckets: limiter.bucket_count(),
        globally_throttled: limiter.is_globally_throttled(),
        shards: shards
            .shard_ids()
            .into_iter()
            .map(|id| ShardReport {
                id,
                state: shards.get_state(id).map_or("unknown", |s| s.as_str()),
                latency_ms: shards.latency(id).map(|l| l.as_millis() as u64),
                reconnects: shards.reconnects(id),
                last_error: shards.last_error(id),
            })
            .collect(),
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_shards_ready(state.shard_state.ready_shards());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
