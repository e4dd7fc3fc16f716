//! Client command protocol.
//!
//! ```json
//! {"action":"subscribe","params":{"symbols":"AAPL,MSFT"}}
//! {"action":"unsubscribe","params":{"symbols":"AAPL"}}
//! ```
//!
//! `symbols` may also be a JSON array of strings.

use serde::Deserialize;

use crate::domain::streaming::{ProtocolError, Symbol};

#[derive(Debug, Deserialize)]
struct RawCommand {
    action: Option<String>,
    #[serde(default)]
    params: RawParams,
}

#[derive(Debug, Default, Deserialize)]
struct RawParams {
    #[serde(default)]
    symbols: Option<SymbolList>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SymbolList {
    Joined(String),
    Items(Vec<String>),
}

impl SymbolList {
    fn into_symbols(self) -> Vec<Symbol> {
        match self {
            Self::Joined(joined) => Symbol::parse_list(&joined),
            Self::Items(items) => Symbol::parse_list(&items.join(",")),
        }
    }
}

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Start receiving updates for these symbols.
    Subscribe(Vec<Symbol>),
    /// Stop receiving updates for these symbols.
    Unsubscribe(Vec<Symbol>),
    /// Well-formed request with an action the relay does not handle.
    Unknown(String),
}

impl ClientCommand {
    /// Parse one text frame from a client.
    ///
    /// Symbols are trimmed, upper-cased and de-duplicated; blank entries are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` when the frame is not a JSON object with an
    /// `action` string.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawCommand = serde_json::from_str(text)?;
        let action = raw
            .action
            .ok_or_else(|| ProtocolError::InvalidFrame("missing action".to_string()))?;
        let symbols = raw
            .params
            .symbols
            .map(SymbolList::into_symbols)
            .unwrap_or_default();

        Ok(match action.as_str() {
            "subscribe" => Self::Subscribe(symbols),
            "unsubscribe" => Self::Unsubscribe(symbols),
            _ => Self::Unknown(action),
        })
    }
}
