//! Price Stream Relay Binary
//!
//! Starts the price relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FINNHUB_API_KEY` or `TWELVE_DATA_API_KEY`: key for the selected provider
//!
//! ## Optional
//! - `STREAM_PROVIDER`: finnhub | twelvedata (default: finnhub)
//! - `STREAM_PROVIDER_URL`: override the provider WebSocket endpoint
//! - `RELAY_HOST`: client listener host (default: 0.0.0.0)
//! - `RELAY_PORT`: client listener port (default: 8765)
//! - `RELAY_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `RELAY_SESSION_QUEUE_CAPACITY`: per-client outbound queue (default: 1024)
//! - `RELAY_HEARTBEAT_INTERVAL_SECS`, `RELAY_IDLE_TIMEOUT_SECS`,
//!   `RELAY_CONNECT_TIMEOUT_SECS`: upstream link timing
//! - `RELAY_RECONNECT_DELAY_INITIAL_MS`, `RELAY_RECONNECT_DELAY_MAX_SECS`,
//!   `RELAY_RECONNECT_DELAY_MULTIPLIER`, `RELAY_MAX_RECONNECT_ATTEMPTS`:
//!   upstream backoff (0 attempts = retry forever)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: price-stream-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use price_stream_relay::infrastructure::health::{HealthServer, HealthServerState};
use price_stream_relay::infrastructure::provider::redact_url;
use price_stream_relay::infrastructure::telemetry;
use price_stream_relay::{
    ProviderConnection, ProviderConnectionConfig, RelayConfig, RelayServer, RelayServerConfig,
    SubscriptionMultiplexer, UpdateSink, build_provider, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let telemetry_guard = telemetry::init();

    tracing::info!(
        span_export = telemetry_guard.is_exporting(),
        "Starting Price Stream Relay"
    );

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    let shutdown_token = CancellationToken::new();

    // Upstream provider link
    let provider = build_provider(config.provider, config.credentials.clone());
    let base_url = config
        .provider_url
        .clone()
        .unwrap_or_else(|| provider.default_url().to_string());
    let provider_url = provider.connect_url(&base_url);
    log_config(&config, &provider_url);

    let (connection, provider_handle) = ProviderConnection::new(
        ProviderConnectionConfig::from_settings(provider_url, &config.websocket),
        provider,
        shutdown_token.clone(),
    );

    // Subscription multiplexer shared by every client session
    let multiplexer = Arc::new(SubscriptionMultiplexer::new(Arc::new(
        provider_handle.clone(),
    )));

    // Client listener
    let relay_server = RelayServer::bind(
        RelayServerConfig {
            bind_addr: config.server.bind_addr(),
            queue_capacity: config.session.queue_capacity,
        },
        Arc::clone(&multiplexer),
        shutdown_token.clone(),
    )
    .await
    .context("failed to start client listener")?;

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        provider_handle.status(),
        Arc::clone(&multiplexer),
        relay_server.client_count(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let sink: Arc<dyn UpdateSink> = multiplexer;
    let mut provider_task = tokio::spawn(connection.run(sink));
    let server_task = tokio::spawn(relay_server.run());

    tracing::info!("Price relay ready");

    let provider_finished = tokio::select! {
        () = await_signal() => false,
        result = &mut provider_task => {
            match result {
                Ok(Ok(())) => tracing::info!("Provider connection closed"),
                Ok(Err(e)) => tracing::error!(error = %e, "Provider connection failed"),
                Err(e) => tracing::error!(error = %e, "Provider task panicked"),
            }
            true
        }
    };

    shutdown_token.cancel();
    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );

    let drain = async {
        if let Err(e) = server_task.await {
            tracing::error!(error = %e, "Relay server task panicked");
        }
        if !provider_finished {
            match provider_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Provider connection ended with error"),
                Err(e) => tracing::error!(error = %e, "Provider task panicked"),
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Graceful shutdown timed out");
    }

    tracing::info!("Price relay stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig, provider_url: &str) {
    tracing::info!(
        provider = config.provider.as_str(),
        listen = %config.server.bind_addr(),
        health_port = config.server.health_port,
        queue_capacity = config.session.queue_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        provider_url = %redact_url(provider_url),
        heartbeat_secs = config.websocket.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.websocket.idle_timeout.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        "Provider endpoint"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
///
/// A handler that fails to install never fires; the other one still does.
async fn await_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
