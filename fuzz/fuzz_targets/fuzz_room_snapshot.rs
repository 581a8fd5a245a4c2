#![no_main]

use libfuzzer_sys::fuzz_target;
use trivia_lobby_client::connection::Generation;
use trivia_lobby_client::protocol::RoomUpdatePayload;
use trivia_lobby_client::reconciler::{ReconcileOutcome, RoomStateReconciler};

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<RoomUpdatePayload>(data) else {
        return;
    };
    let self_id = payload
        .players
        .first()
        .map(|p| p.connection_id.clone())
        .unwrap_or_default();

    let mut reconciler = RoomStateReconciler::new();
    let generation = Generation::INITIAL.next();
    if let ReconcileOutcome::Applied { .. } = reconciler.apply(generation, &self_id, payload) {
        let view = reconciler.view().expect("applied snapshot has a view");
        // Host flags are derived, never copied.
        for player in &view.roster {
            assert_eq!(player.is_host, player.connection_id == view.host_connection_id);
        }
        assert_eq!(view.is_host, !self_id.is_empty() && self_id == view.host_connection_id);
    }
});
