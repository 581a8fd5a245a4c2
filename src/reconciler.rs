//! Reconciliation of server-pushed room snapshots.
//!
//! The server is authoritative: every `room_update` replaces the local view
//! wholesale. Nothing from an earlier snapshot survives a push, and the
//! roster keeps exactly the order the server sent.
//!
//! Host status is never taken from the payload's per-entry flags. It is
//! re-derived from the channel's own connection id: the local player is host
//! iff `self_connection_id == host_connection_id`, and the one roster entry
//! flagged as host is the entry whose id equals `host_connection_id`.

use tracing::{debug, warn};

use crate::connection::Generation;
use crate::protocol::{ConnectionId, PlayerEntry, RoomSettings, RoomUpdatePayload};

/// The reconciled room as seen by the local player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomView {
    /// Generation whose channel delivered this snapshot.
    pub generation: Generation,
    /// Room code, once assigned.
    pub room_code: Option<String>,
    pub host_connection_id: ConnectionId,
    /// Server order, host flags recomputed.
    pub roster: Vec<PlayerEntry>,
    pub settings: RoomSettings,
    /// This channel's connection id.
    pub self_connection_id: ConnectionId,
    /// Whether the local player is the host.
    pub is_host: bool,
    /// A room code has been assigned; the UI may reveal it and enable host controls.
    pub established: bool,
}

impl RoomView {
    pub fn host(&self) -> Option<&PlayerEntry> {
        self.roster.iter().find(|p| p.is_host)
    }

    pub fn player_count(&self) -> usize {
        self.roster.len()
    }
}

/// Result of feeding one snapshot to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The view was replaced. `newly_established` is set on the first
    /// snapshot of the generation that carries a room code.
    Applied { newly_established: bool },
    /// The snapshot belongs to a superseded generation.
    Stale,
    /// The snapshot contradicts the room code already assigned.
    Rejected,
}

/// Holds the current [`RoomView`] for one generation at a time.
#[derive(Debug, Default)]
pub struct RoomStateReconciler {
    generation: Generation,
    view: Option<RoomView>,
    assigned_code: Option<String>,
}

impl RoomStateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and start tracking `generation`.
    pub fn reset(&mut self, generation: Generation) {
        self.generation = generation;
        self.view = None;
        self.assigned_code = None;
    }

    pub fn view(&self) -> Option<&RoomView> {
        self.view.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.assigned_code.is_some()
    }

    /// Replace the local view with `payload`.
    pub fn apply(
        &mut self,
        generation: Generation,
        self_connection_id: &str,
        payload: RoomUpdatePayload,
    ) -> ReconcileOutcome {
        if generation < self.generation {
            debug!(%generation, current = %self.generation, "ignoring stale room snapshot");
            return ReconcileOutcome::Stale;
        }
        if generation > self.generation {
            self.reset(generation);
        }

        let room_code = payload
            .room_code
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty());

        if let Some(assigned) = &self.assigned_code {
            if room_code.as_ref() != Some(assigned) {
                warn!(
                    %generation,
                    assigned = %assigned,
                    received = ?room_code,
                    "room snapshot contradicts assigned room code; ignoring"
                );
                return ReconcileOutcome::Rejected;
            }
        }

        let host_connection_id = payload.host_connection_id;
        let roster: Vec<PlayerEntry> = payload
            .players
            .into_iter()
            .map(|player| {
                let is_host = player.connection_id == host_connection_id;
                PlayerEntry { is_host, ..player }
            })
            .collect();
        let is_host = !self_connection_id.is_empty() && self_connection_id == host_connection_id;

        let newly_established = self.assigned_code.is_none() && room_code.is_some();
        if newly_established {
            self.assigned_code.clone_from(&room_code);
            debug!(%generation, room_code = ?room_code, "room established");
        }

        self.view = Some(RoomView {
            generation,
            established: room_code.is_some(),
            room_code,
            host_connection_id,
            roster,
            settings: payload.settings,
            self_connection_id: self_connection_id.to_string(),
            is_host,
        });
        ReconcileOutcome::Applied { newly_established }
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

    fn player(id: &str, name: &str, is_host: bool) -> PlayerEntry {
        PlayerEntry {
            connection_id: id.into(),
            display_name: name.into(),
            is_host,
        }
    }

    fn snapshot(code: Option<&str>, host: &str, players: Vec<PlayerEntry>) -> RoomUpdatePayload {
        RoomUpdatePayload {
            room_code: code.map(Into::into),
            host_connection_id: host.into(),
            players,
            settings: RoomSettings::default(),
        }
    }

    fn g(n: u64) -> Generation {
        (0..n).fold(Generation::INITIAL, |g, _| g.next())
    }

    #[test]
    fn host_is_derived_from_connection_id_not_flags() {
        let mut r = RoomStateReconciler::new();
        // Payload lies: flags the guest as host.
        let payload = snapshot(
            Some("AB12CD"),
            "c1",
            vec![player("c1", "Ash", false), player("c2", "Misty", true)],
        );
        r.apply(g(1), "c2", payload);

        let view = r.view().unwrap();
        assert!(!view.is_host);
        assert!(view.roster[0].is_host);
        assert!(!view.roster[1].is_host);
        assert_eq!(view.host().unwrap().display_name, "Ash");
    }

    #[test]
    fn last_snapshot_wins_wholesale() {
        let mut r = RoomStateReconciler::new();
        let snapshots = [
            snapshot(
                Some("AB12CD"),
                "c1",
                vec![player("c1", "Ash", true), player("c2", "Misty", false)],
            ),
            snapshot(
                Some("AB12CD"),
                "c1",
                vec![
                    player("c1", "Ash", true),
                    player("c2", "Misty", false),
                    player("c3", "Brock", false),
                ],
            ),
            RoomUpdatePayload {
                settings: RoomSettings {
                    question_count: 12,
                    ..RoomSettings::default()
                },
                ..snapshot(
                    Some("AB12CD"),
                    "c3",
                    vec![player("c3", "Brock", false), player("c1", "Ash", false)],
                )
            },
        ];
        for s in snapshots.iter().cloned() {
            r.apply(g(1), "c1", s);
        }

        let last = snapshots.last().unwrap();
        let view = r.view().unwrap();
        assert_eq!(view.host_connection_id, last.host_connection_id);
        assert_eq!(view.settings, last.settings);
        let ids: Vec<_> = view.roster.iter().map(|p| p.connection_id.as_str()).collect();
        assert_eq!(ids, ["c3", "c1"]);
        assert!(view.roster[0].is_host);
        assert!(!view.is_host);
    }

    #[test]
    fn first_code_establishes_the_room() {
        let mut r = RoomStateReconciler::new();
        assert_eq!(
            r.apply(g(1), "c1", snapshot(None, "c1", vec![player("c1", "Ash", true)])),
            ReconcileOutcome::Applied {
                newly_established: false
            }
        );
        assert!(!r.is_established());

        assert_eq!(
            r.apply(g(1), "c1", snapshot(Some("AB12CD"), "c1", vec![player("c1", "Ash", true)])),
            ReconcileOutcome::Applied {
                newly_established: true
            }
        );
        assert!(r.view().unwrap().established);

        assert_eq!(
            r.apply(g(1), "c1", snapshot(Some("AB12CD"), "c1", vec![player("c1", "Ash", true)])),
            ReconcileOutcome::Applied {
                newly_established: false
            }
        );
    }

    #[test]
    fn room_code_is_immutable_once_assigned() {
        let mut r = RoomStateReconciler::new();
        r.apply(g(1), "c1", snapshot(Some("AB12CD"), "c1", vec![]));
        assert_eq!(
            r.apply(g(1), "c1", snapshot(Some("ZZ99ZZ"), "c1", vec![])),
            ReconcileOutcome::Rejected
        );
        assert_eq!(r.view().unwrap().room_code.as_deref(), Some("AB12CD"));
    }

    #[test]
    fn stale_generation_snapshots_are_ignored() {
        let mut r = RoomStateReconciler::new();
        r.apply(g(2), "c9", snapshot(Some("AB12CD"), "c9", vec![player("c9", "Ash", true)]));
        assert_eq!(
            r.apply(g(1), "c1", snapshot(Some("AB12CD"), "c1", vec![])),
            ReconcileOutcome::Stale
        );
        assert_eq!(r.view().unwrap().self_connection_id, "c9");
    }

    #[test]
    fn new_generation_discards_previous_view() {
        let mut r = RoomStateReconciler::new();
        r.apply(g(1), "c1", snapshot(Some("AB12CD"), "c1", vec![]));
        r.reset(g(2));
        assert!(r.view().is_none());
        assert!(!r.is_established());

        // A fresh generation may be assigned a new code.
        assert_eq!(
            r.apply(g(2), "c5", snapshot(Some("QW34ER"), "c5", vec![])),
            ReconcileOutcome::Applied {
                newly_established: true
            }
        );
    }

    #[test]
    fn unknown_self_id_is_never_host() {
        let mut r = RoomStateReconciler::new();
        r.apply(g(1), "", snapshot(Some("AB12CD"), "", vec![]));
        assert!(!r.view().unwrap().is_host);
    }
}
