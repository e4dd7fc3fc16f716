//! Upstream Provider Connection
//!
//! Owns the single WebSocket link to the market data provider.
//!
//! Subscription requests reach the connection through an unbounded command
//! channel held by [`ProviderHandle`]. The connection keeps the set of
//! symbols that should be subscribed upstream; a command only produces a
//! control frame when it changes that set. While the link is down commands
//! are folded into the set without sending anything, and every (re)connect
//! subscribes the whole set once.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::reconnect::{Backoff, BackoffConfig};
use crate::application::ports::{MarketDataProvider, ProviderFrame, UpdateSink, UpstreamControl};
use crate::domain::streaming::{ProviderConnectionState, Symbol};
use crate::infrastructure::config::WebSocketSettings;
use crate::infrastructure::metrics::{self, MessageOrigin};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors from the upstream provider link.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport or handshake failure (includes rejected credentials).
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailure {
        /// Endpoint with credentials redacted.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// Handshake did not finish in time.
    #[error("connecting to {url} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Endpoint with credentials redacted.
        url: String,
        /// Configured handshake timeout.
        timeout: Duration,
    },

    /// WebSocket error on an established link.
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Provider closed the link.
    #[error("connection closed by provider")]
    ConnectionClosed,

    /// Nothing received for longer than the idle timeout.
    #[error("no frames from provider for {0:?}")]
    IdleTimeout(Duration),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl ProviderError {
    const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailure { .. } => "connect_failure",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Transport(_) => "transport",
            Self::ConnectionClosed => "closed",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::MaxReconnectAttemptsExceeded => "max_attempts",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the provider connection.
#[derive(Debug, Clone)]
pub struct ProviderConnectionConfig {
    /// Full endpoint including credentials.
    pub url: String,
    /// Backoff between connect attempts.
    pub reconnect: BackoffConfig,
    /// Ping / keepalive interval.
    pub heartbeat_interval: Duration,
    /// Inbound silence that counts as a dead link.
    pub idle_timeout: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl ProviderConnectionConfig {
    /// Build the configuration for `url` from the upstream settings.
    #[must_use]
    pub fn from_settings(url: String, settings: &WebSocketSettings) -> Self {
        Self {
            url,
            reconnect: BackoffConfig::from_settings(settings),
            heartbeat_interval: settings.heartbeat_interval,
            idle_timeout: settings.idle_timeout,
            connect_timeout: settings.connect_timeout,
        }
    }
}

/// Strip the query string, which carries the API key, for logging.
#[must_use]
pub fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?[REDACTED]"),
        None => url.to_string(),
    }
}

// =============================================================================
// Status Tracking
// =============================================================================

/// Observable state of the provider link.
#[derive(Debug)]
pub struct ProviderStatus {
    provider: &'static str,
    state: parking_lot::RwLock<ProviderConnectionState>,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_error: parking_lot::RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
    updates_received: AtomicU64,
    subscription_count: AtomicUsize,
}

impl ProviderStatus {
    /// Create a status tracker for `provider`, starting `Disconnected`.
    #[must_use]
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            state: parking_lot::RwLock::new(ProviderConnectionState::Disconnected),
            last_connected_at: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            frames_received: AtomicU64::new(0),
            updates_received: AtomicU64::new(0),
            subscription_count: AtomicUsize::new(0),
        }
    }

    /// Set the connection state.
    pub fn set_state(&self, state: ProviderConnectionState) {
        *self.state.write() = state;
        if state.is_connected() {
            *self.last_connected_at.write() = Some(Utc::now());
        }
        metrics::set_upstream_connected(self.provider, state.is_connected());
    }

    /// Record the most recent error.
    pub fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ProviderConnectionState {
        *self.state.read()
    }

    /// The link carried traffic: clear the retry count and last error.
    fn mark_healthy(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        *self.last_error.write() = None;
    }

    fn increment_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Capture the current values.
    #[must_use]
    pub fn snapshot(&self) -> ProviderStatusSnapshot {
        ProviderStatusSnapshot {
            provider: self.provider,
            state: self.state(),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            updates_received: self.updates_received.load(Ordering::Relaxed),
            subscription_count: self.subscription_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProviderStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusSnapshot {
    /// Provider name.
    pub provider: &'static str,
    /// Link state.
    pub state: ProviderConnectionState,
    /// When the link last came up.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent connection error.
    pub last_error: Option<String>,
    /// Attempts since the link last carried traffic.
    pub reconnect_attempts: u32,
    /// Inbound frames since start.
    pub frames_received: u64,
    /// Price updates since start.
    pub updates_received: u64,
    /// Symbols subscribed upstream.
    pub subscription_count: usize,
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Subscribe(Symbol),
    Unsubscribe(Symbol),
}

/// Cloneable control handle for a running [`ProviderConnection`].
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<ProviderStatus>,
    cancel: CancellationToken,
}

impl ProviderHandle {
    /// Shared status of the link.
    #[must_use]
    pub fn status(&self) -> Arc<ProviderStatus> {
        Arc::clone(&self.status)
    }

    /// Close the link (close frame) and stop reconnecting.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            tracing::debug!(command = ?e.0, "Provider connection gone, command dropped");
        }
    }
}

impl UpstreamControl for ProviderHandle {
    fn subscribe(&self, symbol: &Symbol) {
        self.send(Command::Subscribe(symbol.clone()));
    }

    fn unsubscribe(&self, symbol: &Symbol) {
        self.send(Command::Unsubscribe(symbol.clone()));
    }
}

// =============================================================================
// Provider Connection
// =============================================================================

/// Upstream provider link with reconnect and resubscribe.
pub struct ProviderConnection {
    config: ProviderConnectionConfig,
    provider: Arc<dyn MarketDataProvider>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: Arc<ProviderStatus>,
    cancel: CancellationToken,
    upstream: BTreeSet<Symbol>,
}

impl std::fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("provider", &self.provider.name())
            .field("url", &redact_url(&self.config.url))
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

impl ProviderConnection {
    /// Create a connection and its control handle.
    ///
    /// Nothing connects until [`ProviderConnection::run`] or
    /// [`ProviderConnection::connect`] is called. Cancelling `cancel` has the
    /// same effect as [`ProviderHandle::disconnect`].
    #[must_use]
    pub fn new(
        config: ProviderConnectionConfig,
        provider: Arc<dyn MarketDataProvider>,
        cancel: CancellationToken,
    ) -> (Self, ProviderHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(ProviderStatus::new(provider.name()));

        let handle = ProviderHandle {
            commands: tx,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };
        let connection = Self {
            config,
            provider,
            commands: rx,
            status,
            cancel,
            upstream: BTreeSet::new(),
        };
        (connection, handle)
    }

    /// Symbols currently meant to be subscribed upstream.
    #[must_use]
    pub const fn upstream_symbols(&self) -> &BTreeSet<Symbol> {
        &self.upstream
    }

    /// Establish the transport.
    ///
    /// `Disconnected → Connecting → Connected`, or back to `Disconnected` on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailure` or `ConnectTimeout`; the caller may retry.
    pub async fn connect(&mut self) -> Result<WsStream, ProviderError> {
        let redacted = redact_url(&self.config.url);
        self.status.set_state(ProviderConnectionState::Connecting);
        tracing::info!(provider = self.provider.name(), url = %redacted, "Connecting to provider");

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        )
        .await;

        let result = match attempt {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(ProviderError::ConnectFailure {
                url: redacted,
                reason: e.to_string(),
            }),
            Err(_) => Err(ProviderError::ConnectTimeout {
                url: redacted,
                timeout: self.config.connect_timeout,
            }),
        };

        match &result {
            Ok(_) => {
                self.status.set_state(ProviderConnectionState::Connected);
                tracing::info!(provider = self.provider.name(), "Provider connected");
            }
            Err(e) => {
                self.status.set_state(ProviderConnectionState::Disconnected);
                self.status.set_error(e.to_string());
                metrics::record_upstream_error(self.provider.name(), e.kind());
            }
        }
        result
    }

    /// Run the connection until cancelled.
    ///
    /// Reconnects with backoff on any failure and resubscribes every symbol
    /// in the upstream set after each connect. Updates are handed to `sink`
    /// in upstream order.
    ///
    /// # Errors
    ///
    /// Returns `MaxReconnectAttemptsExceeded` when a bounded retry budget runs
    /// out.
    pub async fn run(mut self, sink: Arc<dyn UpdateSink>) -> Result<(), ProviderError> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let provider = self.provider.name();

        loop {
            if self.cancel.is_cancelled() {
                self.status.set_state(ProviderConnectionState::Closed);
                tracing::info!(provider, "Provider connection cancelled");
                return Ok(());
            }

            match self.connect().await {
                Ok(ws) => {
                    match self.stream(ws, sink.as_ref(), &mut backoff).await {
                        Ok(()) => {
                            self.status.set_state(ProviderConnectionState::Closed);
                            tracing::info!(provider, "Provider connection closed");
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::warn!(provider, error = %e, "Provider connection lost");
                            self.status.set_error(e.to_string());
                            metrics::record_upstream_error(provider, e.kind());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(provider, error = %e, "Provider connect failed");
                }
            }

            let Some(delay) = backoff.next_delay() else {
                self.status.set_state(ProviderConnectionState::Disconnected);
                tracing::error!(provider, attempts = backoff.attempts(), "Giving up on provider");
                return Err(ProviderError::MaxReconnectAttemptsExceeded);
            };

            self.status.set_state(ProviderConnectionState::Reconnecting);
            let attempt = self.status.increment_reconnect_attempts();
            metrics::record_reconnect(provider);
            tracing::info!(
                provider,
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to provider"
            );

            if !self.wait_backoff(delay).await {
                self.status.set_state(ProviderConnectionState::Closed);
                tracing::info!(provider, "Provider connection cancelled during reconnect delay");
                return Ok(());
            }
        }
    }

    /// Sleep for `delay`, folding commands into the upstream set meanwhile.
    ///
    /// Returns `false` when cancelled.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    self.apply(command);
                }
            }
        }
    }

    /// Drive one established link until it fails or the connection is
    /// cancelled (`Ok`).
    ///
    /// `backoff` is reset once the link proves healthy: a decoded price,
    /// status or heartbeat frame, or a heartbeat tick after any inbound
    /// traffic. A handshake alone does not count.
    async fn stream(
        &mut self,
        ws: WsStream,
        sink: &dyn UpdateSink,
        backoff: &mut Backoff,
    ) -> Result<(), ProviderError> {
        let (mut write, mut read) = ws.split();

        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        for symbol in &self.upstream {
            write
                .send(Message::Text(self.provider.subscribe_frame(symbol).into()))
                .await?;
        }
        if !self.upstream.is_empty() {
            tracing::info!(
                provider = self.provider.name(),
                count = self.upstream.len(),
                "Subscribed upstream symbols"
            );
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let linked_at = Instant::now();
        let mut last_inbound = linked_at;
        let mut healthy = false;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "Failed to send close frame");
                    }
                    return Ok(());
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every handle dropped: nobody can subscribe anymore
                        if let Err(e) = write.send(Message::Close(None)).await {
                            tracing::debug!(error = %e, "Failed to send close frame");
                        }
                        return Ok(());
                    };
                    if let Some(frame) = self.apply(command) {
                        write.send(Message::Text(frame.into())).await?;
                    }
                }
                _ = heartbeat.tick() => {
                    let silent_for = last_inbound.elapsed();
                    if silent_for >= self.config.idle_timeout {
                        return Err(ProviderError::IdleTimeout(silent_for));
                    }
                    if last_inbound > linked_at {
                        self.mark_healthy(&mut healthy, backoff);
                    }
                    write.send(Message::Ping(Vec::new().into())).await?;
                    if let Some(frame) = self.provider.keepalive_frame() {
                        write.send(Message::Text(frame.into())).await?;
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(ProviderError::ConnectionClosed),
                    };
                    last_inbound = Instant::now();

                    match msg {
                        Message::Text(text) => {
                            if self.handle_text(text.as_str(), sink) {
                                self.mark_healthy(&mut healthy, backoff);
                            }
                        }
                        Message::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => {
                                if self.handle_text(text, sink) {
                                    self.mark_healthy(&mut healthy, backoff);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Non UTF-8 binary frame from provider");
                                metrics::record_protocol_error(MessageOrigin::Upstream);
                            }
                        },
                        Message::Ping(data) => write.send(Message::Pong(data)).await?,
                        Message::Close(frame) => {
                            tracing::info!(?frame, "Provider sent close frame");
                            return Err(ProviderError::ConnectionClosed);
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Fold a command into the upstream set.
    ///
    /// Returns the control frame to send when the set changed.
    fn apply(&mut self, command: Command) -> Option<String> {
        let frame = match command {
            Command::Subscribe(symbol) => {
                let frame = self.provider.subscribe_frame(&symbol);
                self.upstream.insert(symbol).then_some(frame)
            }
            Command::Unsubscribe(symbol) => {
                let frame = self.provider.unsubscribe_frame(&symbol);
                self.upstream.remove(&symbol).then_some(frame)
            }
        };
        self.status
            .subscription_count
            .store(self.upstream.len(), Ordering::Relaxed);
        frame
    }

    fn mark_healthy(&self, healthy: &mut bool, backoff: &mut Backoff) {
        if !*healthy {
            *healthy = true;
            backoff.reset();
            self.status.mark_healthy();
            tracing::debug!(provider = self.provider.name(), "Provider link healthy");
        }
    }

    /// Decode and dispatch one text frame.
    ///
    /// Returns `true` when the frame shows a working link (prices, status or
    /// heartbeat).
    fn handle_text(&self, text: &str, sink: &dyn UpdateSink) -> bool {
        let provider = self.provider.name();
        self.status.frames_received.fetch_add(1, Ordering::Relaxed);

        match self.provider.decode(text) {
            Ok(ProviderFrame::Prices(updates)) => {
                for update in updates {
                    metrics::record_update_received(provider);
                    self.status.updates_received.fetch_add(1, Ordering::Relaxed);
                    sink.dispatch(update);
                }
                true
            }
            Ok(ProviderFrame::Heartbeat) => {
                tracing::trace!(provider, "Provider heartbeat");
                true
            }
            Ok(ProviderFrame::Status(status)) => {
                tracing::debug!(provider, %status, "Provider status");
                true
            }
            Ok(ProviderFrame::Error(message)) => {
                tracing::warn!(provider, %message, "Provider error notice");
                metrics::record_upstream_error(provider, "notice");
                false
            }
            Ok(ProviderFrame::Unrecognized) => {
                tracing::trace!(provider, "Ignoring unrecognized provider frame");
                false
            }
            Err(e) => {
                tracing::warn!(provider, error = %e, "Malformed provider frame");
                metrics::record_protocol_error(MessageOrigin::Upstream);
                false
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::domain::streaming::PriceUpdate;
    use crate::infrastructure::config::Credentials;
    use crate::infrastructure::provider::finnhub::FinnhubProvider;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<PriceUpdate>>);

    impl UpdateSink for RecordingSink {
        fn dispatch(&self, update: PriceUpdate) {
            self.0.lock().unwrap().push(update);
        }
    }

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    /// Accepts every WebSocket handshake, optionally sends `greeting`, then
    /// drops the link. Returns the URL and the number of accepted sockets.
    async fn flapping_server(greeting: Option<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await
                    && let Some(text) = greeting
                {
                    let _ = ws.send(Message::Text(text.into())).await;
                }
            }
        });
        (url, accepted)
    }

    fn fast_retry(max_reconnect_attempts: u32) -> WebSocketSettings {
        WebSocketSettings {
            reconnect_delay_initial: Duration::from_millis(20),
            max_reconnect_attempts,
            ..WebSocketSettings::default()
        }
    }

    fn connection(url: &str) -> (ProviderConnection, ProviderHandle) {
        let mut settings = WebSocketSettings::default();
        settings.connect_timeout = Duration::from_secs(2);
        ProviderConnection::new(
            ProviderConnectionConfig::from_settings(url.to_string(), &settings),
            Arc::new(FinnhubProvider::new(Credentials::new("k".to_string()))),
            CancellationToken::new(),
        )
    }

    #[test]
    fn redact_url_hides_query() {
        assert_eq!(
            redact_url("wss://ws.finnhub.io?token=secret"),
            "wss://ws.finnhub.io?[REDACTED]"
        );
        assert_eq!(redact_url("ws://127.0.0.1:9000"), "ws://127.0.0.1:9000");
    }

    #[test]
    fn apply_only_emits_frames_on_change() {
        let (mut conn, _handle) = connection("ws://127.0.0.1:1");

        assert!(conn.apply(Command::Subscribe(sym("AAPL"))).is_some());
        assert!(conn.apply(Command::Subscribe(sym("AAPL"))).is_none());
        assert!(conn.apply(Command::Unsubscribe(sym("MSFT"))).is_none());
        assert_eq!(
            conn.apply(Command::Unsubscribe(sym("AAPL"))).as_deref(),
            Some(r#"{"type":"unsubscribe","symbol":"AAPL"}"#)
        );
        assert!(conn.upstream_symbols().is_empty());
    }

    #[test]
    fn handle_queues_commands_while_disconnected() {
        let (mut conn, handle) = connection("ws://127.0.0.1:1");

        handle.subscribe(&sym("AAPL"));
        handle.subscribe(&sym("MSFT"));
        handle.unsubscribe(&sym("AAPL"));

        while let Ok(command) = conn.commands.try_recv() {
            conn.apply(command);
        }
        assert_eq!(conn.upstream_symbols().iter().collect::<Vec<_>>(), vec![&sym("MSFT")]);
        assert_eq!(handle.status().state(), ProviderConnectionState::Disconnected);
        assert_eq!(handle.status().snapshot().subscription_count, 1);
    }

    #[test]
    fn text_frames_reach_sink() {
        let (conn, _handle) = connection("ws://127.0.0.1:1");
        let sink = RecordingSink::default();

        assert!(conn.handle_text(
            r#"{"type":"trade","data":[{"s":"AAPL","p":1.0,"t":1000000,"v":1}]}"#,
            &sink,
        ));
        assert!(conn.handle_text(r#"{"type":"ping"}"#, &sink));
        assert!(!conn.handle_text("garbage", &sink));

        assert_eq!(sink.0.lock().unwrap().len(), 1);
        let snapshot = conn.status.snapshot();
        assert_eq!(snapshot.frames_received, 3);
        assert_eq!(snapshot.updates_received, 1);
    }

    #[tokio::test]
    async fn connect_failure_leaves_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut conn, handle) = connection(&format!("ws://{addr}?token=secret"));

        let err = conn.connect().await.unwrap_err();

        assert!(matches!(err, ProviderError::ConnectFailure { .. }));
        assert!(!err.to_string().contains("secret"));
        assert_eq!(handle.status().state(), ProviderConnectionState::Disconnected);
        assert!(handle.status().snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut settings = WebSocketSettings::default();
        settings.reconnect_delay_initial = Duration::from_millis(5);
        settings.max_reconnect_attempts = 2;
        let (conn, handle) = ProviderConnection::new(
            ProviderConnectionConfig::from_settings(format!("ws://{addr}"), &settings),
            Arc::new(FinnhubProvider::new(Credentials::new("k".to_string()))),
            CancellationToken::new(),
        );

        let result = conn.run(Arc::new(RecordingSink::default())).await;

        assert!(matches!(result, Err(ProviderError::MaxReconnectAttemptsExceeded)));
        assert_eq!(handle.status().state(), ProviderConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_closes_while_reconnecting() {
        let (conn, handle) = connection("ws://127.0.0.1:1");
        let task = tokio::spawn(conn.run(Arc::new(RecordingSink::default())));

        handle.disconnect();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(handle.status().state(), ProviderConnectionState::Closed);
    }

    #[tokio::test]
    async fn handshake_then_drop_exhausts_retry_budget() {
        let (url, accepted) = flapping_server(None).await;
        let (conn, handle) = ProviderConnection::new(
            ProviderConnectionConfig::from_settings(url, &fast_retry(3)),
            Arc::new(FinnhubProvider::new(Credentials::new("k".to_string()))),
            CancellationToken::new(),
        );

        // 20 + 40 + 80 ms of backoff, plus jitter
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            conn.run(Arc::new(RecordingSink::default())),
        )
        .await
        .expect("backoff never grew");

        assert!(matches!(result, Err(ProviderError::MaxReconnectAttemptsExceeded)));
        assert!(accepted.load(Ordering::SeqCst) <= 4);
        assert_eq!(handle.status().snapshot().reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn provider_traffic_restores_retry_budget() {
        let (url, accepted) = flapping_server(Some(r#"{"type":"ping"}"#)).await;
        let cancel = CancellationToken::new();
        let (conn, _handle) = ProviderConnection::new(
            ProviderConnectionConfig::from_settings(url, &fast_retry(2)),
            Arc::new(FinnhubProvider::new(Credentials::new("k".to_string()))),
            cancel.clone(),
        );
        let task = tokio::spawn(conn.run(Arc::new(RecordingSink::default())));

        tokio::time::timeout(Duration::from_secs(2), async {
            while accepted.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection stopped retrying");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_the_link() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    let _ = closed_tx.send(());
                    break;
                }
            }
        });

        let (conn, handle) = connection(&url);
        let status = handle.status();
        let task = tokio::spawn(conn.run(Arc::new(RecordingSink::default())));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !status.state().is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(handle);

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(status.state(), ProviderConnectionState::Closed);
        assert!(tokio::time::timeout(Duration::from_secs(2), closed_rx.recv())
            .await
            .unwrap()
            .is_some());
    }
}
