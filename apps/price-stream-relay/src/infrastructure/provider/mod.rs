//! Upstream market data provider adapters.
//!
//! - `connection`: the single provider link (reconnect, resubscribe, read loop)
//! - `finnhub` / `twelvedata`: per-provider wire encoding and normalizer
//! - `reconnect`: backoff policy

use std::sync::Arc;

use crate::application::ports::MarketDataProvider;
use crate::infrastructure::config::{Credentials, ProviderKind};

pub mod connection;
pub mod finnhub;
pub mod reconnect;
pub mod twelvedata;

pub use connection::{
    ProviderConnection, ProviderConnectionConfig, ProviderError, ProviderHandle, ProviderStatus,
    ProviderStatusSnapshot, redact_url,
};
pub use finnhub::FinnhubProvider;
pub use twelvedata::TwelveDataProvider;

/// Build the provider selected at startup.
#[must_use]
pub fn build_provider(kind: ProviderKind, credentials: Credentials) -> Arc<dyn MarketDataProvider> {
    match kind {
        ProviderKind::Finnhub => Arc::new(FinnhubProvider::new(credentials)),
        ProviderKind::TwelveData => Arc::new(TwelveDataProvider::new(credentials)),
    }
}
