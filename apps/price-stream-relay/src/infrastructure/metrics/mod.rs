//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Updates**: Price updates received upstream, delivered and dropped
//! - **Connections**: Upstream link state and connected clients
//! - **Subscriptions**: Active symbols and subscriber references
//! - **Errors**: Upstream errors, reconnects and malformed messages
//! - **Latency**: Time spent fanning out one update
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Update counters
    describe_counter!(
        "price_relay_updates_received_total",
        "Total price updates received from the upstream provider"
    );
    describe_counter!(
        "price_relay_updates_delivered_total",
        "Total price updates queued to client sessions"
    );
    describe_counter!(
        "price_relay_updates_dropped_total",
        "Total price updates dropped for a session"
    );

    // Connection gauges
    describe_gauge!(
        "price_relay_upstream_connected",
        "1 while the upstream provider link is connected"
    );
    describe_gauge!("price_relay_clients", "Number of connected WebSocket clients");

    // Subscription gauges
    describe_gauge!(
        "price_relay_active_symbols",
        "Number of symbols with at least one subscriber"
    );

    // Error counters
    describe_counter!(
        "price_relay_upstream_errors_total",
        "Total upstream connection errors by type"
    );
    describe_counter!(
        "price_relay_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "price_relay_protocol_errors_total",
        "Total malformed messages by origin"
    );

    // Latency histograms
    describe_histogram!(
        "price_relay_dispatch_seconds",
        "Time to fan out one update to its subscribers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Where a malformed message came from.
#[derive(Debug, Clone, Copy)]
pub enum MessageOrigin {
    /// Upstream provider frame.
    Upstream,
    /// Downstream client command.
    Client,
}

impl MessageOrigin {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Client => "client",
        }
    }
}

/// Why an update was not delivered to a session.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Outbound queue full.
    Lagged,
    /// Session already gone.
    Closed,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Lagged => "lagged",
            Self::Closed => "closed",
        }
    }
}

/// Record a price update received from the provider.
pub fn record_update_received(provider: &'static str) {
    counter!(
        "price_relay_updates_received_total",
        "provider" => provider
    )
    .increment(1);
}

/// Record updates queued to sessions.
pub fn record_updates_delivered(count: u64) {
    counter!("price_relay_updates_delivered_total").increment(count);
}

/// Record an update dropped for one session.
pub fn record_update_dropped(reason: DropReason) {
    counter!(
        "price_relay_updates_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(provider: &'static str, connected: bool) {
    gauge!(
        "price_relay_upstream_connected",
        "provider" => provider
    )
    .set(if connected { 1.0 } else { 0.0 });
}

/// Update the connected client count.
pub fn set_clients(count: f64) {
    gauge!("price_relay_clients").set(count);
}

/// Update the active symbol count.
pub fn set_active_symbols(count: f64) {
    gauge!("price_relay_active_symbols").set(count);
}

/// Record an upstream connection error.
pub fn record_upstream_error(provider: &'static str, error_type: &str) {
    counter!(
        "price_relay_upstream_errors_total",
        "provider" => provider,
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(provider: &'static str) {
    counter!(
        "price_relay_reconnects_total",
        "provider" => provider
    )
    .increment(1);
}

/// Record a malformed message.
pub fn record_protocol_error(origin: MessageOrigin) {
    counter!(
        "price_relay_protocol_errors_total",
        "origin" => origin.as_str()
    )
    .increment(1);
}

/// Record fan-out duration for one update.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!("price_relay_dispatch_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
