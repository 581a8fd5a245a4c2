//! Wire types for the lobby duplex channel.
//!
//! Every frame is a JSON text message of the form
//! `{"type": "<snake_case name>", "data": { ... }}` with camelCase field
//! names, matching what the game server emits and accepts.
//!
//! Gameplay pushes (`game_question`, `show_answer`, `game_over`) belong to the
//! gameplay collaborator; their payloads are kept as opaque
//! [`serde_json::Value`]s and forwarded untouched.

use serde::{Deserialize, Serialize};

/// Server-assigned identifier of one channel instance.
///
/// Valid only for the lifetime of that channel; every reconnect yields a new one.
pub type ConnectionId = String;

/// Default number of questions in a round.
pub const DEFAULT_QUESTION_COUNT: u32 = 5;

/// Default per-question time limit, in seconds.
pub const DEFAULT_PER_QUESTION_TIME_LIMIT: u32 = 5;

/// Default room capacity.
pub const DEFAULT_MAX_PLAYERS: u32 = 8;

// ── Structs ─────────────────────────────────────────────────────────

/// Host-controlled room settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    /// Number of questions in a round.
    pub question_count: u32,
    /// Seconds each player gets per question.
    pub per_question_time_limit: u32,
    /// Maximum number of players admitted to the room.
    pub max_players: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            question_count: DEFAULT_QUESTION_COUNT,
            per_question_time_limit: DEFAULT_PER_QUESTION_TIME_LIMIT,
            max_players: DEFAULT_MAX_PLAYERS,
        }
    }
}

/// One roster entry as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntry {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// Host flag as claimed by the server payload. Not trusted; see
    /// [`RoomStateReconciler`](crate::reconciler::RoomStateReconciler).
    #[serde(default)]
    pub is_host: bool,
}

/// Payload for the `room_update` push: the full authoritative room snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdatePayload {
    /// `None` (or empty) until the server has assigned a code.
    #[serde(default)]
    pub room_code: Option<String>,
    pub host_connection_id: ConnectionId,
    /// Roster in server order.
    #[serde(default)]
    pub players: Vec<PlayerEntry>,
    pub settings: RoomSettings,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Host asks for a new room. The server answers with a `room_update`
    /// carrying the assigned room code.
    CreateRoom {
        display_name: String,
        settings: RoomSettings,
    },
    /// Guest asks to join an existing room.
    JoinRoom {
        display_name: String,
        room_code: String,
    },
    /// Host changes question count / time limit.
    UpdateRoomSettings {
        room_code: String,
        settings: RoomSettings,
    },
    /// Host moves the room into active play.
    StartGame { room_code: String },
    /// Any player's answer during active play.
    SubmitAnswer { answer: String },
    /// Leave the room voluntarily.
    LeaveRoom { room_code: String },
}

impl ClientMessage {
    /// Wire name of this message, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create_room",
            Self::JoinRoom { .. } => "join_room",
            Self::UpdateRoomSettings { .. } => "update_room_settings",
            Self::StartGame { .. } => "start_game",
            Self::SubmitAnswer { .. } => "submit_answer",
            Self::LeaveRoom { .. } => "leave_room",
        }
    }
}

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Handshake completion; carries this channel's connection id.
    Welcome { connection_id: ConnectionId },
    /// Authoritative full room snapshot (boxed to reduce enum size).
    RoomUpdate(Box<RoomUpdatePayload>),
    /// A command was rejected.
    RoomError {
        message: String,
        /// Fatal errors force the player back to the entry screen.
        #[serde(default)]
        fatal: bool,
    },
    /// The room entered active play with these settings.
    GameStarted { settings: RoomSettings },
    /// Next question (gameplay collaborator).
    GameQuestion(serde_json::Value),
    /// Reveal of the correct answer (gameplay collaborator).
    ShowAnswer(serde_json::Value),
    /// Final results (gameplay collaborator).
    GameOver(serde_json::Value),
}

impl ServerMessage {
    /// Wire name of this message, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::RoomUpdate(_) => "room_update",
            Self::RoomError { .. } => "room_error",
            Self::GameStarted { .. } => "game_started",
            Self::GameQuestion(_) => "game_question",
            Self::ShowAnswer(_) => "show_answer",
            Self::GameOver(_) => "game_over",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_room_wire_shape() {
        let msg = ClientMessage::CreateRoom {
            display_name: "Ash".into(),
            settings: RoomSettings::default(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "create_room",
                "data": {
                    "displayName": "Ash",
                    "settings": {
                        "questionCount": 5,
                        "perQuestionTimeLimit": 5,
                        "maxPlayers": 8
                    }
                }
            })
        );
    }

    #[test]
    fn join_room_wire_shape() {
        let msg = ClientMessage::JoinRoom {
            display_name: "Misty".into(),
            room_code: "AB12CD".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "join_room");
        assert_eq!(value["data"]["roomCode"], "AB12CD");
        assert_eq!(value["data"]["displayName"], "Misty");
    }

    #[test]
    fn room_update_parses_server_json() {
        let raw = r#"{
            "type": "room_update",
            "data": {
                "roomCode": "AB12CD",
                "hostConnectionId": "c1",
                "players": [
                    {"connectionId": "c1", "displayName": "Ash", "isHost": true},
                    {"connectionId": "c2", "displayName": "Misty"}
                ],
                "settings": {"questionCount": 10, "perQuestionTimeLimit": 15, "maxPlayers": 4}
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::RoomUpdate(payload) = msg else {
            panic!("expected room_update");
        };
        assert_eq!(payload.room_code.as_deref(), Some("AB12CD"));
        assert_eq!(payload.players.len(), 2);
        assert!(!payload.players[1].is_host);
        assert_eq!(payload.settings.question_count, 10);
    }

    #[test]
    fn room_update_without_code_parses() {
        let raw = r#"{"type":"room_update","data":{"hostConnectionId":"c1","settings":{"questionCount":5,"perQuestionTimeLimit":5,"maxPlayers":8}}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::RoomUpdate(payload) = msg else {
            panic!("expected room_update");
        };
        assert!(payload.room_code.is_none());
        assert!(payload.players.is_empty());
    }

    #[test]
    fn room_error_fatal_defaults_to_false() {
        let raw = r#"{"type":"room_error","data":{"message":"room is full"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ServerMessage::RoomError {
                message: "room is full".into(),
                fatal: false
            }
        );
    }

    #[test]
    fn gameplay_pushes_keep_opaque_payload() {
        let raw = r#"{"type":"game_question","data":{"index":3,"image":"x.png"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.name(), "game_question");
        assert_eq!(
            msg,
            ServerMessage::GameQuestion(json!({"index": 3, "image": "x.png"}))
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"lobby_update","data":[]}"#;
        assert!(serde_json::from_str::<ServerMessage>(raw).is_err());
    }
}
