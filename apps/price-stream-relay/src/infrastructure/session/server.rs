//! Client WebSocket listener.
//!
//! Accepts TCP connections, performs the WebSocket handshake and runs one
//! [`run_session`] task per client, all bound to the same multiplexer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::session::run_session;
use crate::application::services::SubscriptionMultiplexer;
use crate::infrastructure::metrics;

/// Listener errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Could not bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Could not read the bound address.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay listener configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind, e.g. `0.0.0.0:8765`.
    pub bind_addr: String,
    /// Outbound queue capacity per client.
    pub queue_capacity: usize,
}

/// Client-facing WebSocket server.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    multiplexer: Arc<SubscriptionMultiplexer>,
    queue_capacity: usize,
    clients: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError::Bind` if the address is unavailable.
    pub async fn bind(
        config: RelayServerConfig,
        multiplexer: Arc<SubscriptionMultiplexer>,
        cancel: CancellationToken,
    ) -> Result<Self, RelayServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| RelayServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            multiplexer,
            queue_capacity: config.queue_capacity,
            clients: Arc::new(AtomicUsize::new(0)),
            cancel,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared count of connected clients.
    #[must_use]
    pub fn client_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.clients)
    }

    /// Accept clients until cancelled, then wait for every session to clean
    /// up.
    pub async fn run(self) {
        let tracker = TaskTracker::new();
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "Relay listening for clients"),
            Err(e) => tracing::warn!(error = %e, "Relay listening, address unavailable"),
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracker.spawn(handle_client(
                            stream,
                            peer,
                            Arc::clone(&self.multiplexer),
                            self.queue_capacity,
                            Arc::clone(&self.clients),
                            self.cancel.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept client"),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("Relay listener stopped");
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    multiplexer: Arc<SubscriptionMultiplexer>,
    queue_capacity: usize,
    clients: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "Client WebSocket handshake failed");
            return;
        }
    };

    let id = uuid::Uuid::new_v4().as_u64_pair().0;
    let connected = clients.fetch_add(1, Ordering::Relaxed) + 1;
    record_clients(connected);
    tracing::info!(subscriber_id = id, %peer, "Client connected");

    run_session(ws, id, multiplexer, queue_capacity, cancel).await;

    let connected = clients.fetch_sub(1, Ordering::Relaxed) - 1;
    record_clients(connected);
    tracing::info!(subscriber_id = id, %peer, "Client disconnected");
}

#[allow(clippy::cast_precision_loss)]
fn record_clients(count: usize) {
    metrics::set_clients(count as f64);
}
