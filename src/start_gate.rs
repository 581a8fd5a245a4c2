//! Host-only game start, gated on roster size.

use tracing::{debug, warn};

use crate::connection::Generation;
use crate::protocol::ClientMessage;
use crate::reconciler::RoomView;

/// Smallest roster that may start a game.
pub const MIN_PLAYERS_TO_START: usize = 2;

/// Sends `start_game` at most once per generation, and only for a host with
/// company.
#[derive(Debug, Default)]
pub struct GameStartGate {
    started: Option<Generation>,
}

impl GameStartGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `is_host && roster.len() >= 2`, for a room with a code that has not
    /// started yet on this generation.
    pub fn can_start(&self, view: Option<&RoomView>) -> bool {
        let Some(view) = view else {
            return false;
        };
        view.is_host
            && view.roster.len() >= MIN_PLAYERS_TO_START
            && view.room_code.is_some()
            && self.started != Some(view.generation)
    }

    /// The `start_game` command to send, or `None` (logged) when the gate is closed.
    pub fn start(&mut self, view: Option<&RoomView>) -> Option<ClientMessage> {
        if !self.can_start(view) {
            match view {
                None => warn!("start_game refused: no room"),
                Some(v) if self.started == Some(v.generation) => {
                    warn!(generation = %v.generation, "start_game refused: already sent");
                }
                Some(v) => warn!(
                    is_host = v.is_host,
                    players = v.roster.len(),
                    "start_game refused: need host and at least {MIN_PLAYERS_TO_START} players"
                ),
            }
            return None;
        }
        let view = view?;
        let room_code = view.room_code.clone()?;
        debug!(generation = %view.generation, %room_code, "starting game");
        self.started = Some(view.generation);
        Some(ClientMessage::StartGame { room_code })
    }

    /// The server rejected the start (non-fatal); allow another attempt.
    pub fn rearm(&mut self) {
        self.started = None;
    }

    /// Whether `start_game` went out on `generation` and was not rejected.
    pub fn has_started(&self, generation: Generation) -> bool {
        self.started == Some(generation)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{PlayerEntry, RoomSettings};

    fn view(is_host: bool, players: usize) -> RoomView {
        let roster = (0..players)
            .map(|i| PlayerEntry {
                connection_id: format!("c{i}"),
                display_name: format!("player{i}"),
                is_host: i == 0,
            })
            .collect();
        RoomView {
            generation: Generation::INITIAL.next(),
            room_code: Some("AB12CD".into()),
            host_connection_id: "c0".into(),
            roster,
            settings: RoomSettings::default(),
            self_connection_id: if is_host { "c0".into() } else { "c1".into() },
            is_host,
            established: true,
        }
    }

    #[test]
    fn host_alone_cannot_start() {
        let gate = GameStartGate::new();
        assert!(!gate.can_start(Some(&view(true, 1))));
        assert!(!gate.can_start(None));
    }

    #[test]
    fn guest_cannot_start() {
        let mut gate = GameStartGate::new();
        assert!(!gate.can_start(Some(&view(false, 3))));
        assert!(gate.start(Some(&view(false, 3))).is_none());
    }

    #[test]
    fn start_is_sent_exactly_once() {
        let mut gate = GameStartGate::new();
        let v = view(true, 2);
        assert!(gate.can_start(Some(&v)));
        assert_eq!(
            gate.start(Some(&v)),
            Some(ClientMessage::StartGame {
                room_code: "AB12CD".into()
            })
        );
        assert!(gate.has_started(v.generation));
        assert!(!gate.can_start(Some(&v)));
        assert!(gate.start(Some(&v)).is_none());
    }

    #[test]
    fn a_new_generation_may_start_again() {
        let mut gate = GameStartGate::new();
        let old = view(true, 2);
        gate.start(Some(&old)).unwrap();

        let fresh = RoomView {
            generation: old.generation.next(),
            ..old.clone()
        };
        assert!(gate.has_started(old.generation));
        assert!(!gate.has_started(fresh.generation));
        assert!(gate.can_start(Some(&fresh)));
    }

    #[test]
    fn rearm_allows_a_retry_after_rejection() {
        let mut gate = GameStartGate::new();
        let v = view(true, 2);
        gate.start(Some(&v)).unwrap();
        gate.rearm();
        assert!(!gate.has_started(v.generation));
        assert!(gate.start(Some(&v)).is_some());
    }
}
