//! # Lobby Session Example
//!
//! Connects to a trivia lobby server over WebSocket, hosts or joins a room,
//! and prints lobby events until the game starts or the connection is lost.
//! The identity is cached under `.lobby-session/`, so running it again with
//! no arguments rejoins the last room.
//!
//! ## Running
//!
//! ```sh
//! # host a new room
//! TRIVIA_LOBBY_URL=ws://localhost:8080/lobby cargo run --example lobby_session -- host Ash
//! # join an existing one
//! cargo run --example lobby_session -- join Misty AB12CD
//! # resume the cached identity
//! cargo run --example lobby_session
//! ```

use std::sync::Arc;

use trivia_lobby_client::{
    CacheOptions, FileStore, LobbyConfig, LobbyEvent, LocalSessionCache, RoomSettings,
    SessionClient, WebSocketConnector,
};

const DEFAULT_URL: &str = "ws://localhost:8080/lobby";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trivia_lobby_client=debug".into()),
        )
        .init();

    let url = std::env::var("TRIVIA_LOBBY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let cache = Arc::new(LocalSessionCache::open(
        FileStore::new(".lobby-session"),
        CacheOptions::new(),
    ));
    let (mut client, mut events) = SessionClient::start(
        WebSocketConnector::new(url.as_str()),
        cache,
        LobbyConfig::new(),
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let generation = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["host", name] => client.host(name, RoomSettings::default()).await?,
        ["join", name, code] => client.join(name, code).await?,
        [] => client.connect().await?,
        _ => {
            eprintln!("usage: lobby_session [host <name> | join <name> <code>]");
            return Ok(());
        }
    };
    tracing::info!(%generation, %url, "channel opening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, leaving the room");
                client.leave().await?;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    LobbyEvent::StatusChanged(state) => tracing::info!("status: {state}"),
                    LobbyEvent::RoomEstablished { room_code, is_host } => {
                        tracing::info!("room {room_code} ready (host: {is_host})");
                    }
                    LobbyEvent::RoomUpdated(view) => {
                        let names: Vec<_> = view.roster.iter().map(|p| p.display_name.as_str()).collect();
                        tracing::info!("players: {}", names.join(", "));
                        if client.start_game().await? {
                            tracing::info!("asked the server to start");
                        }
                    }
                    LobbyEvent::RoomError { message, fatal } => {
                        tracing::warn!(fatal, "room error: {message}");
                        if fatal {
                            break;
                        }
                    }
                    LobbyEvent::NeedsRoomCode { reason } => {
                        tracing::warn!("{reason}; run again with `join <name> <code>`");
                        break;
                    }
                    LobbyEvent::Reconnecting { attempt, delay } => {
                        tracing::warn!("reconnecting (attempt {attempt}) in {delay:?}");
                    }
                    LobbyEvent::ConnectionLost { reason } => {
                        tracing::error!("connection lost: {reason}");
                        break;
                    }
                    LobbyEvent::GameStarted { settings } => {
                        tracing::info!(?settings, "game started");
                        break;
                    }
                    other => tracing::debug!(?other, "event"),
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
