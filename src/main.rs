//! shardwire gateway service
//!
//! Runs the shards assigned to this process, optionally forwards dispatches
//! to NATS JetStream and serves health / readiness / Prometheus endpoints.

use anyhow::Result;
use shardwire::config::GatewayConfig;
use shardwire::events::EventFilter;
use shardwire::gateway::ShardManager;
use shardwire::health::{self, AppState};
use shardwire::metrics::GatewayMetrics;
use shardwire::nats::{ensure_streams, NatsPublisher};
use shardwire::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardwire={}", gateway_config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        total_shards = ?gateway_config.total_shards,
        shard_ids = ?gateway_config.shard_ids,
        "Starting shardwire"
    );

    let metrics = Arc::new(GatewayMetrics::install()?);
    info!("Prometheus metrics initialized");

    let ctx = Context::new(gateway_config.http.clone(), Arc::clone(&metrics))?;

    match gateway_config.nats_url.as_deref() {
        Some(url) => match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                if let Err(e) = ensure_streams(publisher.jetstream()).await {
                    warn!(error = %e, "Could not configure NATS streams");
                }
                ctx.events.subscribe(EventFilter::All, publisher);
            }
            Err(e) => error!(error = %e, "Failed to connect to NATS - running in local mode"),
        },
        None => info!("No NATS_URL configured - running in local mode"),
    }

    let mut manager = ShardManager::connect(&gateway_config, &ctx).await?;

    let app_state = AppState {
        shard_state: manager.state(),
        http: Arc::clone(&ctx.http),
        metrics: Arc::clone(&metrics),
    };
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    info!(port = gateway_config.http_port, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let http_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health::router(app_state)).await {
            error!(error = %e, "HTTP server error");
        }
    });

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("Shutdown signal received");
        }
        failures = manager.wait() => {
            for err in failures {
                error!(error = %err, "Shard ended with fatal error");
            }
            warn!("No shards left running");
        }
    }

    manager.disconnect();
    for err in manager.wait().await {
        error!(error = %err, "Shard ended with fatal error");
    }
    http_server.abort();

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}
