//! # Custom Transport Example
//!
//! Implements [`Connector`] and [`Transport`] over in-process channels and
//! plays a tiny scripted lobby server against a real [`SessionClient`]:
//! the client hosts a room, a second player shows up, and the host starts
//! the game.
//!
//! Useful as a template for other backends (TCP, QUIC, WebRTC data channels)
//! and for driving the client in tests without a network.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=trivia_lobby_client=debug cargo run --example custom_transport
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use trivia_lobby_client::protocol::{PlayerEntry, RoomUpdatePayload};
use trivia_lobby_client::{
    ClientMessage, Connector, LobbyConfig, LobbyError, LobbyEvent, LocalSessionCache,
    RoomSettings, ServerMessage, SessionClient, Transport,
};

// ─────────────────────────────────────────────────────────────────────
// Step 1: a channel-backed transport and a connector that hands it out
// ─────────────────────────────────────────────────────────────────────

/// Client half of an in-process channel.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), LobbyError> {
        self.tx
            .send(message)
            .map_err(|e| LobbyError::TransportSend(e.to_string()))
    }

    /// `None` once the server half is dropped: a clean close.
    async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), LobbyError> {
        self.rx.close();
        Ok(())
    }
}

/// Spawns a fresh scripted server for every channel the client opens.
pub struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, LobbyError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(scripted_server(server_rx, server_tx));
        Ok(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: a toy server speaking the lobby wire format
// ─────────────────────────────────────────────────────────────────────

fn frame(message: &ServerMessage) -> String {
    serde_json::to_string(message).unwrap_or_default()
}

fn snapshot(players: &[(&str, &str)], settings: RoomSettings) -> ServerMessage {
    ServerMessage::RoomUpdate(Box::new(RoomUpdatePayload {
        room_code: Some("DEMO42".into()),
        host_connection_id: "conn-1".into(),
        players: players
            .iter()
            .map(|(id, name)| PlayerEntry {
                connection_id: (*id).into(),
                display_name: (*name).into(),
                is_host: false,
            })
            .collect(),
        settings,
    }))
}

async fn scripted_server(
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
) {
    let _ = to_client.send(frame(&ServerMessage::Welcome {
        connection_id: "conn-1".into(),
    }));

    let mut settings = RoomSettings::default();
    while let Some(raw) = from_client.recv().await {
        let Ok(command) = serde_json::from_str::<ClientMessage>(&raw) else {
            continue;
        };
        tracing::info!("server received {}", command.name());
        let reply = match command {
            ClientMessage::CreateRoom {
                display_name,
                settings: requested,
            } => {
                settings = requested;
                // The host is alone first; a guest arrives right after.
                let host = display_name.as_str();
                let _ = to_client.send(frame(&snapshot(&[("conn-1", host)], settings)));
                snapshot(&[("conn-1", host), ("conn-2", "Misty")], settings)
            }
            ClientMessage::StartGame { .. } => ServerMessage::GameStarted { settings },
            ClientMessage::LeaveRoom { .. } => break,
            _ => continue,
        };
        let _ = to_client.send(frame(&reply));
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: run a session against it
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cache = Arc::new(LocalSessionCache::in_memory());
    let (mut client, mut events) =
        SessionClient::start(LoopbackConnector, cache, LobbyConfig::new());

    client.host("Ash", RoomSettings::default()).await?;

    while let Some(event) = events.recv().await {
        match event {
            LobbyEvent::RoomEstablished { room_code, is_host } => {
                tracing::info!("room {room_code} established (host: {is_host})");
            }
            LobbyEvent::RoomUpdated(view) => {
                tracing::info!("{} player(s) in the room", view.player_count());
                if client.start_game().await? {
                    tracing::info!("start_game sent");
                }
            }
            LobbyEvent::GameStarted { settings } => {
                tracing::info!(
                    "game started: {} questions, {}s each",
                    settings.question_count,
                    settings.per_question_time_limit
                );
                break;
            }
            LobbyEvent::ConnectionLost { reason } => {
                tracing::warn!("connection lost: {reason}");
                break;
            }
            other => tracing::debug!(?other, "event"),
        }
    }

    client.leave().await?;
    client.shutdown().await;
    tracing::info!("done");
    Ok(())
}
