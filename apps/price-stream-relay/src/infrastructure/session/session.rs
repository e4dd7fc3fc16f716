//! Client Session
//!
//! One session per accepted client connection. The session owns the set of
//! symbols the client subscribed to and keeps it reconciled with the
//! multiplexer: a symbol is only in the local set while the session is a
//! registered subscriber for it.
//!
//! # Lifecycle
//!
//! `Active → Closing → Closed`. Cleanup runs exactly once, on the
//! `Active → Closing` edge, whether the socket closed normally, the read loop
//! failed, the server was cancelled or the session was simply dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::command::ClientCommand;
use crate::application::ports::{DeliverFn, DeliveryError};
use crate::application::services::SubscriptionMultiplexer;
use crate::domain::streaming::{PriceUpdate, ProtocolError, Symbol};
use crate::domain::subscription::SubscriberId;
use crate::infrastructure::metrics::{self, MessageOrigin};

/// How long the writer may take to flush after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting commands.
    Active,
    /// Cleanup in progress.
    Closing,
    /// Cleaned up; commands are ignored.
    Closed,
}

// =============================================================================
// Outbound Queue
// =============================================================================

/// Item queued for a client's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Price push.
    Update(Arc<PriceUpdate>),
    /// Raw control frame (pong, close).
    Control(Message),
}

/// Build a non-blocking delivery callback feeding `tx`.
#[must_use]
pub fn queue_deliver(tx: mpsc::Sender<Outbound>) -> DeliverFn {
    Arc::new(move |update| match tx.try_send(Outbound::Update(update)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(DeliveryError::Lagged),
        Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
    })
}

// =============================================================================
// Client Session
// =============================================================================

/// Server-side state of one connected client.
pub struct ClientSession {
    id: SubscriberId,
    state: SessionState,
    symbols: HashSet<Symbol>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    deliver: DeliverFn,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("symbols", &self.symbols)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Create an active session delivering through `deliver`.
    #[must_use]
    pub fn new(id: SubscriberId, multiplexer: Arc<SubscriptionMultiplexer>, deliver: DeliverFn) -> Self {
        Self {
            id,
            state: SessionState::Active,
            symbols: HashSet::new(),
            multiplexer,
            deliver,
        }
    }

    /// Subscriber id of this session.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Symbols the client is subscribed to, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.symbols.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Handle one text frame from the client.
    ///
    /// Unknown actions are logged and ignored. Frames arriving after
    /// cleanup are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` for malformed frames; the session stays
    /// usable.
    pub fn on_message(&mut self, raw: &str) -> Result<(), ProtocolError> {
        if self.state != SessionState::Active {
            return Ok(());
        }

        match ClientCommand::parse(raw)? {
            ClientCommand::Subscribe(symbols) => self.subscribe(symbols),
            ClientCommand::Unsubscribe(symbols) => self.unsubscribe(&symbols),
            ClientCommand::Unknown(action) => {
                tracing::info!(subscriber_id = self.id, %action, "Ignoring unknown client action");
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, symbols: Vec<Symbol>) {
        for symbol in symbols {
            self.multiplexer
                .subscribe(&symbol, self.id, Arc::clone(&self.deliver));
            if self.symbols.insert(symbol.clone()) {
                tracing::debug!(subscriber_id = self.id, %symbol, "Client subscribed");
            }
        }
    }

    fn unsubscribe(&mut self, symbols: &[Symbol]) {
        for symbol in symbols {
            if self.symbols.remove(symbol) {
                self.multiplexer.unsubscribe(symbol, self.id);
                tracing::debug!(subscriber_id = self.id, %symbol, "Client unsubscribed");
            }
        }
    }

    /// Release every subscription. Runs once; later calls return 0.
    ///
    /// Returns the number of symbols released.
    pub fn cleanup(&mut self) -> usize {
        if self.state != SessionState::Active {
            return 0;
        }
        self.state = SessionState::Closing;

        let released = self.symbols.len();
        for symbol in self.symbols.drain() {
            self.multiplexer.unsubscribe(&symbol, self.id);
        }
        // Drops anything registered outside the local set
        self.multiplexer.remove_subscriber(self.id);

        self.state = SessionState::Closed;
        tracing::info!(subscriber_id = self.id, released, "Client session cleaned up");
        released
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// =============================================================================
// Connection Driver
// =============================================================================

/// Drive one accepted client connection until it closes or `cancel` fires.
///
/// Reads commands on the current task and writes through a dedicated writer
/// task fed by a bounded queue of `queue_capacity` items. Cleanup always
/// runs before this returns.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    id: SubscriberId,
    multiplexer: Arc<SubscriptionMultiplexer>,
    queue_capacity: usize,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, mut read) = ws.split();
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let mut session = ClientSession::new(id, multiplexer, queue_deliver(tx.clone()));
    let mut writer = tokio::spawn(write_loop(write, rx, id));

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = tx.try_send(Outbound::Control(Message::Close(None))) {
                    tracing::debug!(subscriber_id = id, error = %e, "Close frame not queued");
                }
                break;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&mut session, text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(&mut session, text),
                    Err(e) => report_protocol_error(id, &ProtocolError::Utf8(e)),
                },
                Some(Ok(Message::Ping(data))) => {
                    if tx.try_send(Outbound::Control(Message::Pong(data))).is_err() {
                        tracing::debug!(subscriber_id = id, "Outbound queue full, pong skipped");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(subscriber_id = id, error = %e, "Client read error");
                    break;
                }
            }
        }
    }

    session.cleanup();
    drop(session);
    drop(tx);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        tracing::debug!(subscriber_id = id, "Writer did not drain in time, aborting");
        writer.abort();
    }
}

fn handle_frame(session: &mut ClientSession, text: &str) {
    if let Err(e) = session.on_message(text) {
        report_protocol_error(session.id(), &e);
    }
}

fn report_protocol_error(id: SubscriberId, error: &ProtocolError) {
    tracing::warn!(subscriber_id = id, error = %error, "Malformed client message");
    metrics::record_protocol_error(MessageOrigin::Client);
}

/// Serialize queued items onto the socket until the queue closes.
///
/// A failed write is logged and the next item is attempted; only a closed
/// socket stops the writer.
async fn write_loop<W>(mut write: W, mut rx: mpsc::Receiver<Outbound>, id: SubscriberId)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(item) = rx.recv().await {
        let msg = match item {
            Outbound::Update(update) => match update.to_client_json() {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    tracing::warn!(subscriber_id = id, error = %e, "Failed to encode update");
                    continue;
                }
            },
            Outbound::Control(msg) => msg,
        };
        let closing = matches!(msg, Message::Close(_));

        match write.send(msg).await {
            Ok(()) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_)) => {
                tracing::debug!(subscriber_id = id, "Client socket closed, writer stopping");
                break;
            }
            Err(e) => {
                tracing::warn!(subscriber_id = id, error = %e, "Failed to write to client");
            }
        }

        if closing {
            break;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
