//! Room negotiation: one `create_room` or `join_room` per channel generation.

use tracing::{debug, warn};

use crate::cache::{Role, SessionIdentity};
use crate::connection::Generation;
use crate::error::{LobbyError, Result};
use crate::protocol::{ClientMessage, RoomSettings};
use crate::validation;

/// Default pause between the handshake and the negotiation request.
pub const DEFAULT_SETTLE_DELAY: std::time::Duration = std::time::Duration::from_millis(300);

/// Which request a generation issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Create,
    Join,
}

/// Negotiation progress for the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationStatus {
    /// Nothing issued yet.
    #[default]
    Pending,
    /// Request sent, no answer yet.
    Issued(RequestKind),
    /// The server answered (snapshot or `room_error`).
    Resolved(RequestKind),
    /// Could not issue a request (e.g. no room code for a guest).
    Failed,
}

/// Issues exactly one room request per generation, chosen by cached role.
#[derive(Debug, Default)]
pub struct SessionNegotiator {
    generation: Generation,
    status: NegotiationStatus,
}

impl SessionNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> NegotiationStatus {
        self.status
    }

    /// Build the request for `generation`, or `Ok(None)` if this generation
    /// already issued one (or is older than one already seen).
    ///
    /// # Errors
    ///
    /// - [`LobbyError::MissingRoomCode`] for a guest without a cached room code.
    /// - [`LobbyError::Validation`] for a guest whose cached code is malformed.
    ///
    /// Nothing is issued in either case.
    pub fn request(
        &mut self,
        generation: Generation,
        identity: &SessionIdentity,
        settings: RoomSettings,
    ) -> Result<Option<ClientMessage>> {
        if generation < self.generation {
            debug!(%generation, current = %self.generation, "negotiation for stale generation");
            return Ok(None);
        }
        if generation > self.generation {
            self.generation = generation;
            self.status = NegotiationStatus::Pending;
        }
        if self.status != NegotiationStatus::Pending {
            debug!(%generation, status = ?self.status, "negotiation already handled");
            return Ok(None);
        }

        let display_name = identity.display_name.trim().to_string();
        let (kind, message) = match identity.role {
            Role::Host => (
                RequestKind::Create,
                ClientMessage::CreateRoom {
                    display_name,
                    settings,
                },
            ),
            Role::Guest => {
                let Some(raw) = identity.room_code.as_deref().filter(|c| !c.trim().is_empty())
                else {
                    warn!(%generation, "guest has no room code; not joining");
                    self.status = NegotiationStatus::Failed;
                    return Err(LobbyError::MissingRoomCode);
                };
                let room_code = validation::room_code(raw).inspect_err(|_| {
                    self.status = NegotiationStatus::Failed;
                })?;
                (
                    RequestKind::Join,
                    ClientMessage::JoinRoom {
                        display_name,
                        room_code,
                    },
                )
            }
        };

        debug!(%generation, request = message.name(), "negotiating room");
        self.status = NegotiationStatus::Issued(kind);
        Ok(Some(message))
    }

    /// Record the server's answer. Returns `true` if it resolved the
    /// request of `generation`.
    pub fn on_response(&mut self, generation: Generation) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.status {
            NegotiationStatus::Issued(kind) => {
                self.status = NegotiationStatus::Resolved(kind);
                true
            }
            _ => false,
        }
    }

    /// Whether `generation` has a request in flight.
    pub fn is_awaiting(&self, generation: Generation) -> bool {
        generation == self.generation && matches!(self.status, NegotiationStatus::Issued(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn host() -> SessionIdentity {
        SessionIdentity {
            display_name: "Ash".into(),
            role: Role::Host,
            ..SessionIdentity::default()
        }
    }

    fn guest(room_code: Option<&str>) -> SessionIdentity {
        SessionIdentity {
            display_name: "Misty".into(),
            role: Role::Guest,
            room_code: room_code.map(Into::into),
            ..SessionIdentity::default()
        }
    }

    #[test]
    fn host_creates_a_room() {
        let mut n = SessionNegotiator::new();
        let g1 = Generation::INITIAL.next();
        let msg = n.request(g1, &host(), RoomSettings::default()).unwrap();
        assert_eq!(
            msg,
            Some(ClientMessage::CreateRoom {
                display_name: "Ash".into(),
                settings: RoomSettings::default()
            })
        );
        assert_eq!(n.status(), NegotiationStatus::Issued(RequestKind::Create));
    }

    #[test]
    fn guest_joins_with_normalized_code() {
        let mut n = SessionNegotiator::new();
        let msg = n
            .request(Generation::INITIAL.next(), &guest(Some("ab12cd")), RoomSettings::default())
            .unwrap();
        assert_eq!(
            msg,
            Some(ClientMessage::JoinRoom {
                display_name: "Misty".into(),
                room_code: "AB12CD".into()
            })
        );
    }

    #[test]
    fn guest_without_code_fails_and_sends_nothing() {
        let mut n = SessionNegotiator::new();
        let g1 = Generation::INITIAL.next();
        let err = n.request(g1, &guest(None), RoomSettings::default()).unwrap_err();
        assert!(matches!(err, LobbyError::MissingRoomCode));
        assert_eq!(n.status(), NegotiationStatus::Failed);

        // Blank codes count as missing.
        let mut n = SessionNegotiator::new();
        assert!(matches!(
            n.request(g1, &guest(Some("  ")), RoomSettings::default()),
            Err(LobbyError::MissingRoomCode)
        ));
    }

    #[test]
    fn at_most_one_request_per_generation() {
        let mut n = SessionNegotiator::new();
        let g1 = Generation::INITIAL.next();
        assert!(n.request(g1, &host(), RoomSettings::default()).unwrap().is_some());
        assert!(n.request(g1, &host(), RoomSettings::default()).unwrap().is_none());

        assert!(n.on_response(g1));
        assert!(n.request(g1, &host(), RoomSettings::default()).unwrap().is_none());
        assert_eq!(n.status(), NegotiationStatus::Resolved(RequestKind::Create));
    }

    #[test]
    fn new_generation_gets_a_fresh_request() {
        let mut n = SessionNegotiator::new();
        let g1 = Generation::INITIAL.next();
        let g2 = g1.next();
        n.request(g1, &guest(Some("AB12CD")), RoomSettings::default()).unwrap();
        assert!(n.is_awaiting(g1));

        assert!(n.request(g2, &guest(Some("AB12CD")), RoomSettings::default()).unwrap().is_some());
        assert!(!n.is_awaiting(g1));
        assert!(n.is_awaiting(g2));

        // A late answer for g1 resolves nothing.
        assert!(!n.on_response(g1));
        assert!(n.is_awaiting(g2));

        // And g1 can never issue again.
        assert!(n.request(g1, &guest(Some("AB12CD")), RoomSettings::default()).unwrap().is_none());
    }
}
