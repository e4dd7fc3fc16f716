//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, relay status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (upstream connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::SubscriptionMultiplexer;
use crate::domain::streaming::ProviderConnectionState;
use crate::domain::subscription::SubscriptionStats;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::provider::{ProviderStatus, ProviderStatusSnapshot};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream provider link.
    pub upstream: ProviderStatusSnapshot,
    /// Connected client count.
    pub clients: usize,
    /// Subscription statistics.
    pub subscriptions: SubscriptionStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream connected.
    Healthy,
    /// Upstream connecting or reconnecting.
    Degraded,
    /// Upstream down for good or not yet attempted.
    Unhealthy,
}

impl HealthStatus {
    /// Derive the overall status from the upstream link state.
    #[must_use]
    pub const fn from_upstream(state: ProviderConnectionState) -> Self {
        match state {
            ProviderConnectionState::Connected => Self::Healthy,
            ProviderConnectionState::Connecting | ProviderConnectionState::Reconnecting => {
                Self::Degraded
            }
            ProviderConnectionState::Disconnected | ProviderConnectionState::Closed => {
                Self::Unhealthy
            }
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    provider: Arc<ProviderStatus>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    clients: Arc<AtomicUsize>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        provider: Arc<ProviderStatus>,
        multiplexer: Arc<SubscriptionMultiplexer>,
        clients: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            provider,
            multiplexer,
            clients,
        }
    }

    fn build_response(&self) -> HealthResponse {
        let upstream = self.provider.snapshot();

        HealthResponse {
            status: HealthStatus::from_upstream(upstream.state),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            upstream,
            clients: self.clients.load(Ordering::Relaxed),
            subscriptions: self.multiplexer.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.build_response();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.provider.state().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::response::Response;

    use super::*;
    use crate::application::ports::MockUpstreamControl;

    fn state() -> Arc<HealthServerState> {
        let multiplexer = Arc::new(SubscriptionMultiplexer::new(Arc::new(
            MockUpstreamControl::new(),
        )));
        Arc::new(HealthServerState::new(
            "test".to_string(),
            Arc::new(ProviderStatus::new("finnhub")),
            multiplexer,
            Arc::new(AtomicUsize::new(2)),
        ))
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_follows_upstream() {
        assert_eq!(
            HealthStatus::from_upstream(ProviderConnectionState::Connected),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::from_upstream(ProviderConnectionState::Reconnecting),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::from_upstream(ProviderConnectionState::Closed),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn response_reports_clients_and_upstream() {
        let state = state();
        state.provider.set_state(ProviderConnectionState::Connected);

        let response = state.build_response();

        assert_eq!(response.status, HealthStatus::Healthy);
        assert_eq!(response.clients, 2);
        assert_eq!(response.upstream.provider, "finnhub");
        assert!(response.upstream.last_connected_at.is_some());
        assert_eq!(response.subscriptions, SubscriptionStats::default());
    }

    #[tokio::test]
    async fn readiness_requires_connected_upstream() {
        let state = state();

        let response: Response = readiness_handler(State(Arc::clone(&state)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.provider.set_state(ProviderConnectionState::Connected);
        let response: Response = readiness_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_unavailable_while_disconnected() {
        let response: Response = health_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
