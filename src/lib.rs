//! # Trivia Lobby Client
//!
//! Session layer for a multiplayer trivia lobby: it keeps one logical player
//! session alive across an unreliable duplex channel.
//!
//! ## Features
//!
//! - **Generation-stamped channels**: every reconnect gets a fresh
//!   [`Generation`]; late results from abandoned channels are dropped
//! - **Bounded reconnection**: a fixed number of automatic retries, then a
//!   manual reconnect that resets the budget
//! - **Authoritative snapshots**: each `room_update` replaces the local room
//!   view wholesale, with host status re-derived from the connection id
//! - **Durable identity**: display name, role and room code survive restarts
//!   via [`LocalSessionCache`]
//! - **Transport-agnostic**: implement [`Connector`] and [`Transport`] for any
//!   backend; the default `transport-websocket` feature provides
//!   [`WebSocketConnector`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let cache = Arc::new(LocalSessionCache::open(FileStore::new(".session"), CacheOptions::new()));
//! let (client, mut events) =
//!     SessionClient::start(WebSocketConnector::new(url), cache, LobbyConfig::new());
//! client.host("Ash", RoomSettings::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let LobbyEvent::RoomEstablished { room_code, .. } = event {
//!         println!("share this code: {room_code}");
//!     }
//! }
//! ```

pub mod cache;
pub mod client;
pub mod connection;
pub mod error;
pub mod event;
pub mod negotiator;
pub mod protocol;
pub mod reconciler;
pub mod reconnect;
pub mod start_gate;
pub mod transport;
pub mod transports;
pub mod validation;

// Re-export primary types for ergonomic imports.
pub use cache::{
    CacheOptions, FileStore, LocalSessionCache, MemoryStore, Role, SessionIdentity, SessionPatch,
    SessionStore,
};
pub use client::{LobbyConfig, SessionClient};
pub use connection::{ConnectionManager, ConnectionState, Generation, Stamped};
pub use error::{ErrorKind, LobbyError, Result, ValidationError};
pub use event::LobbyEvent;
pub use protocol::{ClientMessage, PlayerEntry, RoomSettings, ServerMessage};
pub use reconciler::RoomView;
pub use reconnect::PolicyState;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
