//! Events delivered to the UI / gameplay collaborator.

use std::time::Duration;

use crate::connection::ConnectionState;
use crate::error::LobbyError;
use crate::protocol::{ConnectionId, RoomSettings};
use crate::reconciler::RoomView;

/// Everything the [`SessionClient`](crate::client::SessionClient) reports.
///
/// Connection-level trouble appears only as [`StatusChanged`](Self::StatusChanged)
/// and [`Reconnecting`](Self::Reconnecting) until automatic retries are
/// exhausted, at which point [`ConnectionLost`](Self::ConnectionLost) asks
/// for a manual reconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyEvent {
    /// The connection status changed.
    StatusChanged(ConnectionState),
    /// Handshake complete on a new channel.
    Connected { connection_id: ConnectionId },
    /// A fresh authoritative snapshot was reconciled (boxed to reduce enum size).
    RoomUpdated(Box<RoomView>),
    /// The room now has a code; reveal it and enable host controls.
    RoomEstablished { room_code: String, is_host: bool },
    /// The server rejected a command. Fatal errors send the player back to
    /// the entry screen; non-fatal ones can be retried inline.
    RoomError { message: String, fatal: bool },
    /// Negotiation could not start because the room code is missing or
    /// malformed. The UI should re-prompt.
    NeedsRoomCode { reason: String },
    /// A command got no answer in time.
    CommandTimedOut { command: &'static str },
    /// Automatic retry `attempt` will run after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic retries are exhausted; a manual reconnect is required.
    ConnectionLost { reason: String },
    /// The room entered active play; settings as echoed by the server.
    GameStarted { settings: RoomSettings },
    /// Gameplay push: next question.
    GameQuestion(serde_json::Value),
    /// Gameplay push: correct answer reveal.
    ShowAnswer(serde_json::Value),
    /// Gameplay push: final results.
    GameOver(serde_json::Value),
}

impl LobbyEvent {
    /// The error this event reports, for callers that funnel failures
    /// through one `LobbyError` path.
    ///
    /// `None` for events that are not failures. Connection trouble below
    /// the retry limit (`Reconnecting`) is not an error either.
    pub fn error(&self) -> Option<LobbyError> {
        match self {
            Self::RoomError { message, fatal } => Some(LobbyError::Server {
                message: message.clone(),
                fatal: *fatal,
            }),
            Self::CommandTimedOut { .. } => Some(LobbyError::Timeout),
            Self::NeedsRoomCode { .. } => Some(LobbyError::MissingRoomCode),
            Self::ConnectionLost { .. } => Some(LobbyError::NotConnected),
            _ => None,
        }
    }
}
