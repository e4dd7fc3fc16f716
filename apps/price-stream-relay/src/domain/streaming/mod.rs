//! Market Data Streaming Types
//!
//! Core domain types for the relay: symbols, canonical price updates and
//! the upstream connection state. These types are provider-agnostic and
//! represent the canonical internal representation of a price event.

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

// =============================================================================
// Symbol
// =============================================================================

/// A ticker symbol, trimmed and upper-cased.
///
/// The only stable key shared between provider frames and client commands.
/// Two symbols are equal when their normalized strings are equal, so
/// `" aapl "` and `"AAPL"` name the same instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw ticker string.
    ///
    /// Returns `None` when nothing is left after trimming.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_uppercase()))
    }

    /// Parse a comma-separated symbol list such as `"aapl, msft"`.
    ///
    /// Empty items are skipped and duplicates are kept in first-seen order
    /// only once.
    #[must_use]
    pub fn parse_list(raw: &str) -> Vec<Self> {
        let mut symbols: Vec<Self> = Vec::new();
        for symbol in raw.split(',').filter_map(Self::parse) {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        symbols
    }

    /// Get the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Price Update
// =============================================================================

/// Canonical price update, emitted in this shape regardless of provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    /// Instrument the update belongs to.
    pub symbol: Symbol,
    /// Last traded price.
    pub price: f64,
    /// Traded volume, when the provider reports one.
    pub volume: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Name of the provider that produced the update.
    pub source: &'static str,
}

/// Resolution of a provider timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampResolution {
    /// Whole seconds since the epoch.
    Seconds,
    /// Milliseconds since the epoch.
    Millis,
    /// Nanoseconds since the epoch.
    Nanos,
}

impl TimestampResolution {
    /// Convert a raw provider timestamp to milliseconds since the epoch.
    ///
    /// Nanoseconds are truncated toward zero; seconds saturate instead of
    /// overflowing.
    #[must_use]
    pub const fn to_millis(self, raw: i64) -> i64 {
        match self {
            Self::Seconds => raw.saturating_mul(1_000),
            Self::Millis => raw,
            Self::Nanos => raw / 1_000_000,
        }
    }
}

// =============================================================================
// Client Events
// =============================================================================

/// Wire shape of a price push to clients.
///
/// ```json
/// {"event":"price","symbol":"AAPL","price":123.45,"volume":1000.0,"timestamp":1700000000000,"source":"finnhub"}
/// ```
#[derive(Debug, Serialize)]
pub struct PriceEvent<'a> {
    /// Always `"price"`.
    pub event: &'static str,
    /// Instrument symbol.
    pub symbol: &'a str,
    /// Last traded price.
    pub price: f64,
    /// Traded volume (omitted when absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Provider name.
    pub source: &'a str,
}

impl<'a> From<&'a PriceUpdate> for PriceEvent<'a> {
    fn from(update: &'a PriceUpdate) -> Self {
        Self {
            event: "price",
            symbol: update.symbol.as_str(),
            price: update.price,
            volume: update.volume,
            timestamp: update.timestamp,
            source: update.source,
        }
    }
}

impl PriceUpdate {
    /// Serialize as the client-facing JSON push message.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails (non-finite numbers are
    /// written as `null`, so in practice this does not happen).
    pub fn to_client_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&PriceEvent::from(self))
    }
}

// =============================================================================
// Upstream Connection State
// =============================================================================

/// State of the single upstream provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderConnectionState {
    /// No transport; initial state and the state after a failed connect.
    #[default]
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Transport established; control frames are sent immediately.
    Connected,
    /// Link lost, waiting out the backoff before the next connect.
    Reconnecting,
    /// Shut down for good.
    Closed,
}

impl ProviderConnectionState {
    /// Check if control frames can be sent right now.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// Malformed message from a client or from the upstream provider.
///
/// Always recoverable: the message is dropped and the connection continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON, or not the expected JSON shape.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Binary payload is not UTF-8.
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON parsed but the frame is not usable.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_is_trimmed_and_uppercased() {
        assert_eq!(Symbol::parse("  aapl ").unwrap().as_str(), "AAPL");
        assert_eq!(Symbol::parse("Msft").unwrap(), Symbol::parse("MSFT").unwrap());
    }

    #[test]
    fn blank_symbol_is_rejected() {
        assert!(Symbol::parse("").is_none());
        assert!(Symbol::parse("   ").is_none());
    }

    #[test]
    fn parse_list_skips_blanks_and_duplicates() {
        let symbols = Symbol::parse_list("aapl, msft,, AAPL , ");
        let names: Vec<_> = symbols.iter().map(Symbol::as_str).collect();
        assert_eq!(names, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn timestamp_resolution_conversions() {
        assert_eq!(
            TimestampResolution::Nanos.to_millis(1_700_000_000_123_000_000),
            1_700_000_000_123
        );
        assert_eq!(
            TimestampResolution::Seconds.to_millis(1_700_000_000),
            1_700_000_000_000
        );
        assert_eq!(
            TimestampResolution::Millis.to_millis(1_700_000_000_123),
            1_700_000_000_123
        );
        assert_eq!(TimestampResolution::Seconds.to_millis(i64::MAX), i64::MAX);
    }

    #[test]
    fn price_event_shape() {
        let update = PriceUpdate {
            symbol: Symbol::parse("AAPL").unwrap(),
            price: 123.45,
            volume: Some(1000.0),
            timestamp: 1_700_000_000_000,
            source: "finnhub",
        };

        let value: serde_json::Value =
            serde_json::from_str(&update.to_client_json().unwrap()).unwrap();

        assert_eq!(value["event"], "price");
        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(value["price"], 123.45);
        assert_eq!(value["volume"], 1000.0);
        assert_eq!(value["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(value["source"], "finnhub");
    }

    #[test]
    fn price_event_omits_missing_volume() {
        let update = PriceUpdate {
            symbol: Symbol::parse("EUR/USD").unwrap(),
            price: 1.08,
            volume: None,
            timestamp: 1,
            source: "twelvedata",
        };

        let json = update.to_client_json().unwrap();
        assert!(!json.contains("volume"));
    }

    #[test]
    fn connection_state_names() {
        assert_eq!(ProviderConnectionState::default(), ProviderConnectionState::Disconnected);
        assert!(ProviderConnectionState::Connected.is_connected());
        assert!(!ProviderConnectionState::Reconnecting.is_connected());
        assert_eq!(ProviderConnectionState::Closed.as_str(), "closed");
    }
}
