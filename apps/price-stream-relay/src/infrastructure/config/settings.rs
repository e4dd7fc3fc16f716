//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::time::Duration;

/// Upstream market data provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Finnhub trade stream.
    #[default]
    Finnhub,
    /// Twelve Data price stream.
    TwelveData,
}

impl ProviderKind {
    /// Parse provider from string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownProvider` for anything but `finnhub` or
    /// `twelvedata` (case-insensitive, `twelve_data` and `twelve-data`
    /// accepted).
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "finnhub" => Ok(Self::Finnhub),
            "twelvedata" | "twelve_data" | "twelve-data" => Ok(Self::TwelveData),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    /// Environment variable holding this provider's API key.
    #[must_use]
    pub const fn api_key_var(&self) -> &'static str {
        match self {
            Self::Finnhub => "FINNHUB_API_KEY",
            Self::TwelveData => "TWELVE_DATA_API_KEY",
        }
    }

    /// Get the provider name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Finnhub => "finnhub",
            Self::TwelveData => "twelvedata",
        }
    }
}

/// Provider API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Ping / keepalive interval.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the link is considered dead.
    pub idle_timeout: Duration,
    /// Handshake timeout for one connect attempt.
    pub connect_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Client session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Outbound queue capacity per client.
    pub queue_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Client listener host.
    pub host: String,
    /// Client WebSocket port.
    pub port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            health_port: 8082,
        }
    }
}

impl ServerSettings {
    /// Address the client listener binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream provider.
    pub provider: ProviderKind,
    /// Provider credentials.
    pub credentials: Credentials,
    /// Endpoint override; provider default when absent.
    pub provider_url: Option<String>,
    /// Listener settings.
    pub server: ServerSettings,
    /// Client session settings.
    pub session: SessionSettings,
    /// Upstream connection settings.
    pub websocket: WebSocketSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unknown or its API key is missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unknown or its API key is missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = lookup("STREAM_PROVIDER")
            .map(|s| ProviderKind::parse(&s))
            .transpose()?
            .unwrap_or_default();

        let key_var = provider.api_key_var();
        let api_key = lookup(key_var).ok_or_else(|| ConfigError::MissingEnvVar(key_var.to_string()))?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key_var.to_string()));
        }

        let provider_url = lookup("STREAM_PROVIDER_URL").filter(|url| !url.trim().is_empty());
        if let Some(url) = &provider_url
            && !(url.starts_with("ws://") || url.starts_with("wss://"))
        {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_PROVIDER_URL".to_string(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }

        let env = EnvReader { lookup: &lookup };

        let server = ServerSettings {
            host: lookup("RELAY_HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| ServerSettings::default().host),
            port: env.u16("RELAY_PORT", ServerSettings::default().port),
            health_port: env.u16("RELAY_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let session = SessionSettings {
            queue_capacity: env.nonzero_usize(
                "RELAY_SESSION_QUEUE_CAPACITY",
                SessionSettings::default().queue_capacity,
            ),
        };

        let defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: env
                .duration_secs("RELAY_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            idle_timeout: env.duration_secs("RELAY_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            connect_timeout: env
                .duration_secs("RELAY_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            reconnect_delay_initial: env.duration_millis(
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env
                .duration_secs("RELAY_RECONNECT_DELAY_MAX_SECS", defaults.reconnect_delay_max),
            reconnect_delay_multiplier: env.f64(
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env
                .u32("RELAY_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
        };

        Ok(Self {
            provider,
            credentials: Credentials::new(api_key.trim().to_string()),
            provider_url,
            server,
            session,
            websocket,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Provider selection is not supported.
    #[error("unknown stream provider '{0}' (expected finnhub or twelvedata)")]
    UnknownProvider(String),
    /// Environment variable is set but unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Typed reads with fallback to a default on absent or unparsable values.
struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.lookup)(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key).unwrap_or(default)
    }

    fn nonzero_usize(&self, key: &str, default: usize) -> usize {
        self.parsed(key).filter(|v| *v > 0).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed(key)
            .filter(|v: &f64| v.is_finite() && *v >= 1.0)
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key)
            .filter(|v| *v > 0)
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key)
            .filter(|v| *v > 0)
            .map_or(default, Duration::from_millis)
    }
}
