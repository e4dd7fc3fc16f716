//! Twelve Data Price Stream
//!
//! # Stream URL
//!
//! `wss://ws.twelvedata.com/v1/quotes/price?apikey=<API_KEY>`
//!
//! # Protocol
//!
//! ```json
//! {"action":"subscribe","params":{"symbols":"AAPL"}}
//! {"action":"unsubscribe","params":{"symbols":"AAPL"}}
//! {"action":"heartbeat"}
//! ```
//!
//! Prices arrive one per frame with `timestamp` in seconds:
//!
//! ```json
//! {"event":"price","symbol":"AAPL","price":190.12,"timestamp":1700000000,"day_volume":123456}
//! ```
//!
//! `subscribe-status` and `heartbeat` events are status frames. The server
//! expects a heartbeat action at least every 10 seconds.

use serde::{Deserialize, Serialize};

use crate::application::ports::{MarketDataProvider, ProviderFrame, with_query_param};
use crate::domain::streaming::{PriceUpdate, ProtocolError, Symbol, TimestampResolution};
use crate::infrastructure::config::Credentials;

const NAME: &str = "twelvedata";
const DEFAULT_URL: &str = "wss://ws.twelvedata.com/v1/quotes/price";

/// Inbound event. Fields outside `event` depend on the event kind.
#[derive(Debug, Deserialize)]
struct Event {
    event: Option<String>,
    symbol: Option<String>,
    price: Option<f64>,
    timestamp: Option<i64>,
    day_volume: Option<f64>,
    status: Option<String>,
    #[serde(default)]
    fails: Vec<serde_json::Value>,
    message: Option<String>,
}

impl Event {
    fn into_update(self) -> Option<PriceUpdate> {
        Some(PriceUpdate {
            symbol: Symbol::parse(self.symbol.as_deref()?)?,
            price: self.price.filter(|p| p.is_finite())?,
            volume: self.day_volume,
            timestamp: TimestampResolution::Seconds.to_millis(self.timestamp?),
            source: NAME,
        })
    }

    fn describe_status(&self) -> String {
        let status = self.status.as_deref().unwrap_or("unknown");
        if self.fails.is_empty() {
            status.to_string()
        } else {
            format!("{status} ({} failed)", self.fails.len())
        }
    }
}

#[derive(Serialize)]
struct Params<'a> {
    symbols: &'a str,
}

#[derive(Serialize)]
struct Action<'a> {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Params<'a>>,
}

impl Action<'_> {
    fn encode(&self) -> String {
        // Only string fields, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Twelve Data provider.
#[derive(Debug, Clone)]
pub struct TwelveDataProvider {
    credentials: Credentials,
}

impl TwelveDataProvider {
    /// Create a provider authenticating with `credentials`.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl MarketDataProvider for TwelveDataProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn default_url(&self) -> &'static str {
        DEFAULT_URL
    }

    fn connect_url(&self, base: &str) -> String {
        with_query_param(base, "apikey", self.credentials.api_key())
    }

    fn subscribe_frame(&self, symbol: &Symbol) -> String {
        Action {
            action: "subscribe",
            params: Some(Params {
                symbols: symbol.as_str(),
            }),
        }
        .encode()
    }

    fn unsubscribe_frame(&self, symbol: &Symbol) -> String {
        Action {
            action: "unsubscribe",
            params: Some(Params {
                symbols: symbol.as_str(),
            }),
        }
        .encode()
    }

    fn keepalive_frame(&self) -> Option<String> {
        Some(
            Action {
                action: "heartbeat",
                params: None,
            }
            .encode(),
        )
    }

    fn decode(&self, text: &str) -> Result<ProviderFrame, ProtocolError> {
        let event: Event = serde_json::from_str(text)?;

        let frame = match event.event.as_deref() {
            Some("price") => ProviderFrame::Prices(event.into_update().into_iter().collect()),
            Some("heartbeat") => ProviderFrame::Heartbeat,
            Some("subscribe-status" | "unsubscribe-status" | "reset-status") => {
                ProviderFrame::Status(event.describe_status())
            }
            Some("error") => ProviderFrame::Error(event.message.unwrap_or_default()),
            _ => ProviderFrame::Unrecognized,
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn provider() -> TwelveDataProvider {
        TwelveDataProvider::new(Credentials::new("secret".to_string()))
    }

    #[test]
    fn price_event_is_normalized() {
        let frame = provider()
            .decode(
                r#"{"event":"price","symbol":"aapl","currency":"USD","exchange":"NASDAQ","type":"Common Stock","timestamp":1700000000,"price":190.12,"day_volume":123456}"#,
            )
            .unwrap();

        assert_eq!(
            frame,
            ProviderFrame::Prices(vec![PriceUpdate {
                symbol: Symbol::parse("AAPL").unwrap(),
                price: 190.12,
                volume: Some(123_456.0),
                timestamp: 1_700_000_000_000,
                source: "twelvedata",
            }])
        );
    }

    #[test]
    fn forex_price_without_volume() {
        let frame = provider()
            .decode(r#"{"event":"price","symbol":"EUR/USD","timestamp":1700000000,"price":1.0812}"#)
            .unwrap();

        let ProviderFrame::Prices(updates) = frame else {
            panic!("expected prices");
        };
        assert_eq!(updates[0].symbol.as_str(), "EUR/USD");
        assert_eq!(updates[0].volume, None);
    }

    #[test_case(r#"{"event":"price","price":1.0,"timestamp":1}"# ; "missing symbol")]
    #[test_case(r#"{"event":"price","symbol":"AAPL","timestamp":1}"# ; "missing price")]
    #[test_case(r#"{"event":"price","symbol":"AAPL","price":1.0}"# ; "missing timestamp")]
    fn partial_price_events_are_dropped(text: &str) {
        assert_eq!(provider().decode(text).unwrap(), ProviderFrame::Prices(vec![]));
    }

    #[test_case(r#"{"event":"heartbeat","status":"ok"}"#, &ProviderFrame::Heartbeat ; "heartbeat")]
    #[test_case(r#"{"event":"subscribe-status","status":"ok","success":[{"symbol":"AAPL"}],"fails":[]}"#, &ProviderFrame::Status("ok".to_string()) ; "subscribe status")]
    #[test_case(r#"{"event":"subscribe-status","status":"error","fails":[{"symbol":"NOPE"}]}"#, &ProviderFrame::Status("error (1 failed)".to_string()) ; "subscribe status with failures")]
    #[test_case(r#"{"event":"error","message":"bad key"}"#, &ProviderFrame::Error("bad key".to_string()) ; "error")]
    #[test_case(r#"{"event":"quote"}"#, &ProviderFrame::Unrecognized ; "unknown event")]
    #[test_case(r#"{"status":"ok"}"#, &ProviderFrame::Unrecognized ; "no event")]
    fn non_price_frames(text: &str, expected: &ProviderFrame) {
        assert_eq!(&provider().decode(text).unwrap(), expected);
    }

    #[test]
    fn invalid_json_is_protocol_error() {
        assert!(provider().decode("{").is_err());
    }

    #[test]
    fn control_frames() {
        let symbol = Symbol::parse("AAPL").unwrap();
        let p = provider();

        assert_eq!(
            p.subscribe_frame(&symbol),
            r#"{"action":"subscribe","params":{"symbols":"AAPL"}}"#
        );
        assert_eq!(
            p.unsubscribe_frame(&symbol),
            r#"{"action":"unsubscribe","params":{"symbols":"AAPL"}}"#
        );
        assert_eq!(p.keepalive_frame().as_deref(), Some(r#"{"action":"heartbeat"}"#));
    }

    #[test]
    fn connect_url_carries_api_key() {
        let p = provider();
        assert_eq!(
            p.connect_url(p.default_url()),
            "wss://ws.twelvedata.com/v1/quotes/price?apikey=secret"
        );
    }
}
