//! Relay Streaming Integration Tests
//!
//! Runs the relay against a scripted in-process provider and real WebSocket
//! clients over loopback.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tokio_util::sync::CancellationToken;

use price_stream_relay::{
    Credentials, ProviderConnection, ProviderConnectionConfig, ProviderKind, RelayServer,
    RelayServerConfig, SubscriptionMultiplexer, UpdateSink, WebSocketSettings, build_provider,
};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Scripted provider
// =============================================================================

/// One accepted relay connection on the fake provider. Dropping it closes the
/// socket.
struct UpstreamLink {
    push: mpsc::UnboundedSender<Message>,
}

impl UpstreamLink {
    fn push(&self, frame: Value) {
        self.push.send(Message::Text(frame.to_string().into())).unwrap();
    }
}

struct FakeProvider {
    url: String,
    received: mpsc::UnboundedReceiver<Value>,
    links: mpsc::UnboundedReceiver<UpstreamLink>,
}

impl FakeProvider {
    async fn start() -> Self {
        Self::start_with(0).await
    }

    /// The first `silent_links` connections never read from the relay, so
    /// relay pings go unanswered.
    async fn start_with(silent_links: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (links_tx, links) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = accept_async(stream).await.unwrap();
                let (push, mut outgoing) = mpsc::unbounded_channel::<Message>();
                if links_tx.send(UpstreamLink { push }).is_err() {
                    return;
                }
                accepted += 1;

                if accepted <= silent_links {
                    tokio::spawn(async move {
                        while outgoing.recv().await.is_some() {}
                        drop(ws);
                    });
                    continue;
                }

                let received_tx = received_tx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            frame = outgoing.recv() => match frame {
                                Some(frame) => {
                                    if ws.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            },
                            incoming = ws.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    let value = serde_json::from_str(text.as_str()).unwrap();
                                    let _ = received_tx.send(value);
                                }
                                Some(Ok(_)) => {}
                                Some(Err(_)) | None => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            url,
            received,
            links,
        }
    }

    async fn next_link(&mut self) -> UpstreamLink {
        timeout(WAIT, self.links.recv()).await.unwrap().unwrap()
    }

    async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.received.recv()).await.unwrap().unwrap()
    }

    /// Collect `n` control frames as `(type, symbol)` pairs.
    async fn frames(&mut self, n: usize) -> BTreeSet<(String, String)> {
        let mut frames = BTreeSet::new();
        for _ in 0..n {
            let frame = self.next_frame().await;
            frames.insert((
                frame["type"].as_str().unwrap().to_string(),
                frame["symbol"].as_str().unwrap().to_string(),
            ));
        }
        frames
    }

    async fn assert_silent(&mut self, window: Duration) {
        if let Ok(Some(frame)) = timeout(window, self.received.recv()).await {
            panic!("unexpected upstream frame: {frame}");
        }
    }
}

fn pairs(kind: &str, symbols: &[&str]) -> BTreeSet<(String, String)> {
    symbols
        .iter()
        .map(|s| (kind.to_string(), (*s).to_string()))
        .collect()
}

fn trade(symbol: &str, price: f64, volume: f64, nanos: i64) -> Value {
    json!({"type": "trade", "data": [{"s": symbol, "p": price, "t": nanos, "v": volume}]})
}

// =============================================================================
// Relay harness
// =============================================================================

struct Relay {
    addr: SocketAddr,
    multiplexer: Arc<SubscriptionMultiplexer>,
    cancel: CancellationToken,
}

fn fast_settings() -> WebSocketSettings {
    WebSocketSettings {
        reconnect_delay_initial: Duration::from_millis(20),
        reconnect_delay_max: Duration::from_millis(100),
        ..WebSocketSettings::default()
    }
}

impl Relay {
    async fn start(provider_url: &str) -> Self {
        Self::start_with(provider_url, ProviderKind::Finnhub, fast_settings()).await
    }

    async fn start_with(provider_url: &str, kind: ProviderKind, settings: WebSocketSettings) -> Self {
        let cancel = CancellationToken::new();
        let provider = build_provider(kind, Credentials::new("test-key".into()));
        let config =
            ProviderConnectionConfig::from_settings(provider.connect_url(provider_url), &settings);
        let (connection, handle) = ProviderConnection::new(config, provider, cancel.clone());

        let multiplexer = Arc::new(SubscriptionMultiplexer::new(Arc::new(handle)));
        let sink: Arc<dyn UpdateSink> = Arc::clone(&multiplexer) as Arc<dyn UpdateSink>;
        tokio::spawn(connection.run(sink));

        let server = RelayServer::bind(
            RelayServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                queue_capacity: 64,
            },
            Arc::clone(&multiplexer),
            cancel.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Self {
            addr,
            multiplexer,
            cancel,
        }
    }

    async fn client(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
        ws
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send(client: &mut Client, action: &str, symbols: &str) {
    let frame = json!({"action": action, "params": {"symbols": symbols}});
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn next_push(client: &mut Client) -> Value {
    loop {
        match timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected client frame: {other:?}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn client_receives_normalized_updates_for_its_symbols() {
    let mut upstream = FakeProvider::start().await;
    let relay = Relay::start(&upstream.url).await;
    let link = upstream.next_link().await;

    let mut client = relay.client().await;
    send(&mut client, "subscribe", "aapl, msft").await;
    assert_eq!(
        upstream.frames(2).await,
        pairs("subscribe", &["AAPL", "MSFT"])
    );

    link.push(trade("TSLA", 250.0, 5.0, 1_700_000_000_000_000_000));
    link.push(trade("AAPL", 189.5, 100.0, 1_700_000_000_123_456_789));

    let push = next_push(&mut client).await;
    assert_eq!(
        push,
        json!({
            "event": "price",
            "symbol": "AAPL",
            "price": 189.5,
            "volume": 100.0,
            "timestamp": 1_700_000_000_123_i64,
            "source": "finnhub"
        })
    );
}

#[tokio::test]
async fn disconnect_releases_upstream_subscriptions() {
    let mut upstream = FakeProvider::start().await;
    let relay = Relay::start(&upstream.url).await;
    let _link = upstream.next_link().await;

    let mut client = relay.client().await;
    send(&mut client, "subscribe", "aapl, msft").await;
    upstream.frames(2).await;

    client.close(None).await.unwrap();

    assert_eq!(
        upstream.frames(2).await,
        pairs("unsubscribe", &["AAPL", "MSFT"])
    );
    assert!(relay.multiplexer.active_symbols().is_empty());
}

#[tokio::test]
async fn shared_symbol_is_subscribed_upstream_once() {
    let mut upstream = FakeProvider::start().await;
    let relay = Relay::start(&upstream.url).await;
    let link = upstream.next_link().await;

    let mut first = relay.client().await;
    let mut second = relay.client().await;

    send(&mut first, "subscribe", "AAPL").await;
    assert_eq!(upstream.frames(1).await, pairs("subscribe", &["AAPL"]));

    // The second AAPL request must not reach the provider; NVDA proves the
    // session processed both.
    send(&mut second, "subscribe", "AAPL,NVDA").await;
    assert_eq!(upstream.frames(1).await, pairs("subscribe", &["NVDA"]));
    assert_eq!(relay.multiplexer.reference_count("AAPL"), 2);

    link.push(trade("AAPL", 190.0, 1.0, 1_700_000_001_000_000_000));
    assert_eq!(next_push(&mut first).await["price"], 190.0);
    assert_eq!(next_push(&mut second).await["price"], 190.0);

    first.close(None).await.unwrap();
    send(&mut second, "unsubscribe", "NVDA").await;
    assert_eq!(upstream.frames(1).await, pairs("unsubscribe", &["NVDA"]));

    second.close(None).await.unwrap();
    assert_eq!(upstream.frames(1).await, pairs("unsubscribe", &["AAPL"]));
}

#[tokio::test]
async fn reconnect_resubscribes_each_symbol_exactly_once() {
    let mut upstream = FakeProvider::start().await;
    let relay = Relay::start(&upstream.url).await;
    let link = upstream.next_link().await;

    let mut client = relay.client().await;
    send(&mut client, "subscribe", "AAPL,MSFT,NVDA").await;
    upstream.frames(3).await;

    drop(link);
    let link = upstream.next_link().await;

    assert_eq!(
        upstream.frames(3).await,
        pairs("subscribe", &["AAPL", "MSFT", "NVDA"])
    );
    upstream.assert_silent(Duration::from_millis(200)).await;

    // The client session survived the upstream outage
    link.push(trade("MSFT", 410.25, 3.0, 1_700_000_002_000_000_000));
    assert_eq!(next_push(&mut client).await["symbol"], "MSFT");
}

#[tokio::test]
async fn malformed_client_frames_keep_the_session_open() {
    let mut upstream = FakeProvider::start().await;
    let relay = Relay::start(&upstream.url).await;
    let link = upstream.next_link().await;

    let mut client = relay.client().await;
    client
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    client
        .send(Message::Text(r#"{"action":"teleport"}"#.into()))
        .await
        .unwrap();
    send(&mut client, "subscribe", "aapl").await;

    assert_eq!(upstream.frames(1).await, pairs("subscribe", &["AAPL"]));
    link.push(trade("AAPL", 1.5, 2.0, 1_700_000_003_000_000_000));
    assert_eq!(next_push(&mut client).await["symbol"], "AAPL");
}

#[tokio::test]
async fn silent_provider_is_replaced_and_resubscribed() {
    let mut upstream = FakeProvider::start_with(1).await;
    let settings = WebSocketSettings {
        heartbeat_interval: Duration::from_millis(100),
        idle_timeout: Duration::from_millis(300),
        ..fast_settings()
    };
    let relay = Relay::start_with(&upstream.url, ProviderKind::Finnhub, settings).await;
    let _silent = upstream.next_link().await;

    let mut client = relay.client().await;
    send(&mut client, "subscribe", "AAPL").await;

    // No pongs on the first link: the idle timeout forces a new one
    let link = upstream.next_link().await;
    assert_eq!(upstream.frames(1).await, pairs("subscribe", &["AAPL"]));

    link.push(trade("AAPL", 191.0, 4.0, 1_700_000_004_000_000_000));
    assert_eq!(next_push(&mut client).await["price"], 191.0);
}

#[tokio::test]
async fn twelve_data_link_sends_heartbeat_actions() {
    let mut upstream = FakeProvider::start().await;
    let settings = WebSocketSettings {
        heartbeat_interval: Duration::from_millis(100),
        ..fast_settings()
    };
    let _relay = Relay::start_with(&upstream.url, ProviderKind::TwelveData, settings).await;
    let _link = upstream.next_link().await;

    assert_eq!(upstream.next_frame().await, json!({"action": "heartbeat"}));
    assert_eq!(upstream.next_frame().await, json!({"action": "heartbeat"}));
}
