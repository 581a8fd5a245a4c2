#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for lobby client integration tests.
//!
//! Provides a channel-based [`MockTransport`] whose far side is a scriptable
//! [`ServerEnd`], a [`MockConnector`] that hands out pre-built transports one
//! per channel generation, and helpers for building server pushes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use trivia_lobby_client::protocol::{PlayerEntry, RoomSettings, RoomUpdatePayload};
use trivia_lobby_client::{
    ClientMessage, Connector, LobbyConfig, LobbyError, LobbyEvent, LocalSessionCache, RoomView,
    ServerMessage, SessionClient, Transport,
};

/// Upper bound on any single wait in these tests. Generous because most
/// tests run with paused time, where it only matters if something hangs.
const WAIT: Duration = Duration::from_secs(120);

pub type Incoming = Option<Result<String, LobbyError>>;

// ── MockTransport / ServerEnd ───────────────────────────────────────

/// Client side of an in-memory channel.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    sent: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Server side of an in-memory channel: push frames, read commands.
pub struct ServerEnd {
    push: mpsc::UnboundedSender<Incoming>,
    sent: mpsc::UnboundedReceiver<String>,
    pub closed: Arc<AtomicBool>,
}

/// A connected transport and its server end.
pub fn pair() -> (MockTransport, ServerEnd) {
    let (push, incoming) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport {
            incoming,
            sent: sent_tx,
            closed: Arc::clone(&closed),
        },
        ServerEnd {
            push,
            sent: sent_rx,
            closed,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), LobbyError> {
        self.sent
            .send(message)
            .map_err(|_| LobbyError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
        match self.incoming.recv().await {
            Some(item) => item,
            // Server end dropped without scripting a close: stay open.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), LobbyError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl ServerEnd {
    pub fn push(&self, message: &ServerMessage) {
        let json = serde_json::to_string(message).unwrap();
        let _ = self.push.send(Some(Ok(json)));
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.push.send(Some(Ok(frame.to_string())));
    }

    pub fn welcome(&self, connection_id: &str) {
        self.push(&ServerMessage::Welcome {
            connection_id: connection_id.into(),
        });
    }

    /// Simulate a network failure on the open channel.
    pub fn drop_connection(&self) {
        let _ = self
            .push
            .send(Some(Err(LobbyError::TransportReceive("connection reset".into()))));
    }

    /// The server closes the channel cleanly.
    pub fn close(&self) {
        let _ = self.push.send(None);
    }

    /// Next command the client sent on this channel.
    pub async fn next_command(&mut self) -> ClientMessage {
        let raw = tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for a client command")
            .expect("client side of the channel is gone");
        serde_json::from_str(&raw).unwrap()
    }

    /// A command already sent, if any.
    pub fn try_next_command(&mut self) -> Option<ClientMessage> {
        self.sent
            .try_recv()
            .ok()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Hands out one queued transport per `connect()`; refuses once empty.
pub struct MockConnector {
    transports: StdMutex<VecDeque<MockTransport>>,
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self) -> Result<MockTransport, LobbyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.transports.lock().unwrap().pop_front();
        next.ok_or_else(|| LobbyError::Io(std::io::ErrorKind::ConnectionRefused.into()))
    }
}

/// A connector good for `channels` successful connects, plus their server ends
/// in the order they will be used.
pub fn connector(channels: usize) -> (MockConnector, VecDeque<ServerEnd>) {
    let (transports, servers): (VecDeque<_>, VecDeque<_>) = (0..channels).map(|_| pair()).unzip();
    let connector = MockConnector {
        transports: StdMutex::new(transports),
        attempts: Arc::default(),
    };
    (connector, servers)
}

// ── Client harness ──────────────────────────────────────────────────

pub struct Harness {
    pub client: SessionClient,
    pub events: mpsc::Receiver<LobbyEvent>,
    pub servers: VecDeque<ServerEnd>,
    pub attempts: Arc<AtomicUsize>,
    pub cache: Arc<LocalSessionCache>,
}

impl Harness {
    pub fn start(channels: usize, config: LobbyConfig) -> Self {
        Self::with_cache(channels, config, Arc::new(LocalSessionCache::in_memory()))
    }

    pub fn with_cache(channels: usize, config: LobbyConfig, cache: Arc<LocalSessionCache>) -> Self {
        init_tracing();
        let (connector, servers) = connector(channels);
        let attempts = Arc::clone(&connector.attempts);
        let (client, events) = SessionClient::start(connector, Arc::clone(&cache), config);
        Self {
            client,
            events,
            servers,
            attempts,
            cache,
        }
    }

    /// Server end of the next channel to be opened.
    pub fn next_server(&mut self) -> ServerEnd {
        self.servers.pop_front().expect("no more scripted channels")
    }

    /// Skip events until one matches `pred`, and return it.
    pub async fn wait_for(&mut self, pred: impl Fn(&LobbyEvent) -> bool) -> LobbyEvent {
        wait_for(&mut self.events, pred).await
    }

    /// The next reconciled room snapshot.
    pub async fn next_room(&mut self) -> RoomView {
        match self.wait_for(|e| matches!(e, LobbyEvent::RoomUpdated(_))).await {
            LobbyEvent::RoomUpdated(view) => *view,
            other => panic!("expected a room update, got {other:?}"),
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub async fn wait_for(
    events: &mut mpsc::Receiver<LobbyEvent>,
    pred: impl Fn(&LobbyEvent) -> bool,
) -> LobbyEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Route `tracing` output through the test harness. Controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Message builders ────────────────────────────────────────────────

pub fn player(connection_id: &str, display_name: &str) -> PlayerEntry {
    PlayerEntry {
        connection_id: connection_id.into(),
        display_name: display_name.into(),
        is_host: false,
    }
}

pub fn room_update(code: Option<&str>, host: &str, players: Vec<PlayerEntry>) -> ServerMessage {
    room_update_with(code, host, players, RoomSettings::default())
}

pub fn room_update_with(
    code: Option<&str>,
    host: &str,
    players: Vec<PlayerEntry>,
    settings: RoomSettings,
) -> ServerMessage {
    ServerMessage::RoomUpdate(Box::new(RoomUpdatePayload {
        room_code: code.map(Into::into),
        host_connection_id: host.into(),
        players,
        settings,
    }))
}

pub fn room_error(message: &str, fatal: bool) -> ServerMessage {
    ServerMessage::RoomError {
        message: message.into(),
        fatal,
    }
}
