//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    ConfigError, Credentials, ProviderKind, RelayConfig, ServerSettings, SessionSettings,
    WebSocketSettings,
};
