//! Port Interfaces
//!
//! Contracts between the multiplexer and the adapters around it.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamControl`: issues subscribe/unsubscribe to the provider link
//! - `MarketDataProvider`: wire encoding and normalizer of one provider
//!
//! ## Driver Ports (Inbound)
//!
//! - `UpdateSink`: where the provider read loop hands normalized updates
//! - `DeliverFn`: per-subscriber delivery callback registered by sessions

use std::sync::Arc;

use crate::domain::streaming::{PriceUpdate, ProtocolError, Symbol};

// =============================================================================
// Upstream Control
// =============================================================================

/// Control surface of the upstream provider connection.
///
/// Calls never block and never fail: while the link is down the request is
/// queued and applied after the next successful connect.
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamControl: Send + Sync {
    /// Request an upstream subscription for `symbol`.
    fn subscribe(&self, symbol: &Symbol);

    /// Request removal of the upstream subscription for `symbol`.
    fn unsubscribe(&self, symbol: &Symbol);
}

// =============================================================================
// Update Sink
// =============================================================================

/// Receiver of normalized updates from the provider read loop.
pub trait UpdateSink: Send + Sync {
    /// Fan out one update. Must not block.
    fn dispatch(&self, update: PriceUpdate);
}

// =============================================================================
// Delivery
// =============================================================================

/// Why a subscriber could not take an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Outbound queue is full; this update is dropped for the subscriber.
    #[error("subscriber queue full")]
    Lagged,

    /// Subscriber is gone and will never accept another update.
    #[error("subscriber closed")]
    Closed,
}

/// Delivery callback registered per (symbol, subscriber).
pub type DeliverFn = Arc<dyn Fn(Arc<PriceUpdate>) -> Result<(), DeliveryError> + Send + Sync>;

// =============================================================================
// Market Data Provider
// =============================================================================

/// One decoded upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    /// Zero or more price updates.
    Prices(Vec<PriceUpdate>),
    /// Provider keepalive.
    Heartbeat,
    /// Subscription acknowledgement or other informational frame.
    Status(String),
    /// Error notice from the provider.
    Error(String),
    /// Valid JSON with a shape this provider does not define.
    Unrecognized,
}

/// Wire encoding and normalizer for one market data provider.
///
/// Implementations are pure: no I/O, no shared state.
pub trait MarketDataProvider: Send + Sync + std::fmt::Debug {
    /// Provider name, used as `source` on updates and as a metric label.
    fn name(&self) -> &'static str;

    /// Endpoint used when no override is configured.
    fn default_url(&self) -> &'static str;

    /// Add credentials to `base`, producing the URL to connect to.
    fn connect_url(&self, base: &str) -> String;

    /// Control frame subscribing to `symbol`.
    fn subscribe_frame(&self, symbol: &Symbol) -> String;

    /// Control frame unsubscribing from `symbol`.
    fn unsubscribe_frame(&self, symbol: &Symbol) -> String;

    /// Application-level keepalive the provider expects, if any.
    fn keepalive_frame(&self) -> Option<String> {
        None
    }

    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` when the frame is not JSON.
    fn decode(&self, text: &str) -> Result<ProviderFrame, ProtocolError>;
}

/// Append `key=value` to the query string of `base`.
#[must_use]
pub fn with_query_param(base: &str, key: &str, value: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{key}={value}")
}
