#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Price Stream Relay - Market Data Multiplexer
//!
//! A WebSocket relay that keeps a single connection to an upstream market
//! data provider (Finnhub or Twelve Data) and fans normalized price updates
//! out to many downstream WebSocket clients. Each symbol is subscribed
//! upstream once, no matter how many clients ask for it.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `streaming`: Symbols, price updates, connection states
//!   - `subscription`: Reference-counted subscription table
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream control, update sink, provider normalizer
//!   - `services`: Subscription multiplexer
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `provider`: Upstream WebSocket link, Finnhub and Twelve Data codecs
//!   - `session`: Client WebSocket listener and per-client sessions
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                      subscribe / unsubscribe
//!            +-----------------------------------------+
//!            v                                         |
//! Provider WS ---> Normalizer ---> Multiplexer ---> Session ---> Client 1
//!                                      |        +-> Session ---> Client 2
//!                                      +--------+-> Session ---> Client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{PriceUpdate, ProtocolError, ProviderConnectionState, Symbol};
pub use domain::subscription::{
    SubscribeOutcome, SubscriberId, SubscriptionStats, SubscriptionTable, UnsubscribeOutcome,
};

// Application
pub use application::ports::{
    DeliverFn, DeliveryError, MarketDataProvider, ProviderFrame, UpdateSink, UpstreamControl,
};
pub use application::services::SubscriptionMultiplexer;

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Credentials, ProviderKind, RelayConfig, ServerSettings, SessionSettings,
    WebSocketSettings,
};

// Upstream provider
pub use infrastructure::provider::{
    FinnhubProvider, ProviderConnection, ProviderConnectionConfig, ProviderError, ProviderHandle,
    ProviderStatus, TwelveDataProvider, build_provider,
};

// Client sessions
pub use infrastructure::session::{ClientSession, RelayServer, RelayServerConfig, RelayServerError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
