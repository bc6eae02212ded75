//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder (library use, tests) every call is a no-op.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the Prometheus recorder process-wide and return a handle to it
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics without an exporter (records into whatever recorder is global)
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Dispatch events received from the gateway"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects by reason"
        );
        describe_counter!("gateway_errors_total", Unit::Count, "Total gateway errors");
        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round trip"
        );
        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_counter!(
            "http_requests_total",
            Unit::Count,
            "REST requests by route and status"
        );
        describe_counter!(
            "http_rate_limited_total",
            Unit::Count,
            "429 responses by route"
        );
        describe_gauge!(
            "http_global_throttled",
            Unit::Count,
            "Global rate limit active (1=throttled, 0=clear)"
        );
    }

    /// Record a dispatch event received
    pub fn record_event(&self, shard_id: u64, event_name: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_name.to_ascii_lowercase()
        )
        .increment(1);
    }

    /// Record a heartbeat acknowledgement
    pub fn record_heartbeat(&self, shard_id: u64, latency: Option<Duration>) {
        if let Some(latency) = latency {
            histogram!(
                "gateway_heartbeat_latency_seconds",
                "shard_id" => shard_id.to_string()
            )
            .record(latency.as_secs_f64());
        }
    }

    pub fn record_reconnect(&self, shard_id: u64, reason: &'static str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u64, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    pub fn record_http(&self, route: &str, status: u16) {
        counter!(
            "http_requests_total",
            "route" => route.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_rate_limited(&self, route: &str, global: bool) {
        counter!(
            "http_rate_limited_total",
            "route" => route.to_string(),
            "global" => if global { "true" } else { "false" }
        )
        .increment(1);
    }

    pub fn set_global_throttled(&self, throttled: bool) {
        gauge!("http_global_throttled").set(if throttled { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}
