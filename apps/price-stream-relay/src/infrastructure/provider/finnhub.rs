//! Finnhub Trade Stream
//!
//! # Stream URL
//!
//! `wss://ws.finnhub.io?token=<API_KEY>`
//!
//! # Protocol
//!
//! Control frames are one symbol each:
//!
//! ```json
//! {"type":"subscribe","symbol":"AAPL"}
//! {"type":"unsubscribe","symbol":"AAPL"}
//! ```
//!
//! Trades arrive batched, with `t` in nanoseconds since the epoch:
//!
//! ```json
//! {"type":"trade","data":[{"s":"AAPL","p":190.12,"t":1700000000123000000,"v":100}]}
//! ```
//!
//! `{"type":"ping"}` is a keepalive and `{"type":"error","msg":"..."}` an
//! error notice.

use serde::{Deserialize, Serialize};

use crate::application::ports::{MarketDataProvider, ProviderFrame, with_query_param};
use crate::domain::streaming::{PriceUpdate, ProtocolError, Symbol, TimestampResolution};
use crate::infrastructure::config::Credentials;

const NAME: &str = "finnhub";
const DEFAULT_URL: &str = "wss://ws.finnhub.io";

/// Inbound frame envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
    msg: Option<String>,
}

/// One trade inside a `trade` frame. Any field may be missing.
#[derive(Debug, Deserialize)]
struct Trade {
    s: Option<String>,
    p: Option<f64>,
    t: Option<i64>,
    v: Option<f64>,
}

impl Trade {
    fn into_update(self) -> Option<PriceUpdate> {
        Some(PriceUpdate {
            symbol: Symbol::parse(self.s.as_deref()?)?,
            price: self.p.filter(|p| p.is_finite())?,
            volume: self.v,
            timestamp: TimestampResolution::Nanos.to_millis(self.t?),
            source: NAME,
        })
    }
}

#[derive(Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    symbol: &'a str,
}

impl ControlFrame<'_> {
    fn encode(&self) -> String {
        // Two string fields cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Finnhub provider.
#[derive(Debug, Clone)]
pub struct FinnhubProvider {
    credentials: Credentials,
}

impl FinnhubProvider {
    /// Create a provider authenticating with `credentials`.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl MarketDataProvider for FinnhubProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn default_url(&self) -> &'static str {
        DEFAULT_URL
    }

    fn connect_url(&self, base: &str) -> String {
        with_query_param(base, "token", self.credentials.api_key())
    }

    fn subscribe_frame(&self, symbol: &Symbol) -> String {
        ControlFrame {
            kind: "subscribe",
            symbol: symbol.as_str(),
        }
        .encode()
    }

    fn unsubscribe_frame(&self, symbol: &Symbol) -> String {
        ControlFrame {
            kind: "unsubscribe",
            symbol: symbol.as_str(),
        }
        .encode()
    }

    fn decode(&self, text: &str) -> Result<ProviderFrame, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;

        let frame = match envelope.kind.as_deref() {
            Some("trade") => ProviderFrame::Prices(
                envelope
                    .data
                    .into_iter()
                    .filter_map(|entry| serde_json::from_value::<Trade>(entry).ok())
                    .filter_map(Trade::into_update)
                    .collect(),
            ),
            Some("ping") => ProviderFrame::Heartbeat,
            Some("error") => ProviderFrame::Error(envelope.msg.unwrap_or_default()),
            _ => ProviderFrame::Unrecognized,
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn provider() -> FinnhubProvider {
        FinnhubProvider::new(Credentials::new("secret".to_string()))
    }

    fn prices(text: &str) -> Vec<PriceUpdate> {
        match provider().decode(text).unwrap() {
            ProviderFrame::Prices(updates) => updates,
            other => panic!("expected prices, got {other:?}"),
        }
    }

    #[test]
    fn trade_frame_is_normalized() {
        let updates = prices(
            r#"{"type":"trade","data":[{"s":"aapl","p":190.12,"t":1700000000123000000,"v":100}]}"#,
        );

        assert_eq!(
            updates,
            vec![PriceUpdate {
                symbol: Symbol::parse("AAPL").unwrap(),
                price: 190.12,
                volume: Some(100.0),
                timestamp: 1_700_000_000_123,
                source: "finnhub",
            }]
        );
    }

    #[test]
    fn batched_trades_keep_order() {
        let updates = prices(
            r#"{"type":"trade","data":[
                {"s":"AAPL","p":1.0,"t":1000000,"v":1},
                {"s":"MSFT","p":2.0,"t":2000000,"v":2},
                {"s":"AAPL","p":3.0,"t":3000000,"v":3}
            ]}"#,
        );

        let seen: Vec<_> = updates.iter().map(|u| (u.symbol.as_str(), u.price)).collect();
        assert_eq!(seen, vec![("AAPL", 1.0), ("MSFT", 2.0), ("AAPL", 3.0)]);
    }

    #[test_case(r#"{"p":1.0,"t":1,"v":1}"# ; "missing symbol")]
    #[test_case(r#"{"s":"AAPL","t":1,"v":1}"# ; "missing price")]
    #[test_case(r#"{"s":"AAPL","p":1.0,"v":1}"# ; "missing timestamp")]
    #[test_case(r#"{"s":"  ","p":1.0,"t":1}"# ; "blank symbol")]
    #[test_case(r#"{"s":"AAPL","p":"1.0","t":1}"# ; "price as string")]
    fn partial_entries_are_dropped(entry: &str) {
        let updates = prices(&format!(r#"{{"type":"trade","data":[{entry}]}}"#));
        assert!(updates.is_empty());
    }

    #[test]
    fn missing_volume_is_absent() {
        let updates = prices(r#"{"type":"trade","data":[{"s":"AAPL","p":1.5,"t":1000000}]}"#);
        assert_eq!(updates[0].volume, None);
    }

    #[test_case(r#"{"type":"ping"}"#, &ProviderFrame::Heartbeat ; "ping")]
    #[test_case(r#"{"type":"error","msg":"Invalid symbol"}"#, &ProviderFrame::Error("Invalid symbol".to_string()) ; "error")]
    #[test_case(r#"{"type":"news","data":[]}"#, &ProviderFrame::Unrecognized ; "unknown type")]
    #[test_case(r#"{"hello":"world"}"#, &ProviderFrame::Unrecognized ; "no type")]
    #[test_case(r#"{"type":"trade"}"#, &ProviderFrame::Prices(vec![]) ; "trade without data")]
    fn non_price_frames(text: &str, expected: &ProviderFrame) {
        assert_eq!(&provider().decode(text).unwrap(), expected);
    }

    #[test]
    fn invalid_json_is_protocol_error() {
        assert!(matches!(
            provider().decode("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn control_frames() {
        let symbol = Symbol::parse("AAPL").unwrap();
        let p = provider();

        assert_eq!(p.subscribe_frame(&symbol), r#"{"type":"subscribe","symbol":"AAPL"}"#);
        assert_eq!(
            p.unsubscribe_frame(&symbol),
            r#"{"type":"unsubscribe","symbol":"AAPL"}"#
        );
        assert!(p.keepalive_frame().is_none());
    }

    #[test]
    fn connect_url_carries_token() {
        let p = provider();
        assert_eq!(p.connect_url(p.default_url()), "wss://ws.finnhub.io?token=secret");
    }
}
