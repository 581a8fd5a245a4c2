//! End-to-end session tests.
//!
//! Each test drives a real `SessionClient` against in-memory channels from
//! `tests/common`, scripting the server side frame by frame. Time is paused,
//! so settle delays, retry delays and command deadlines elapse instantly and
//! deterministically.

mod common;

use std::sync::Arc;
use std::time::Duration;

use trivia_lobby_client::protocol::PlayerEntry;
use trivia_lobby_client::{
    CacheOptions, ClientMessage, ConnectionState, FileStore, LobbyConfig, LobbyError, LobbyEvent,
    LocalSessionCache, PolicyState, Role, RoomSettings, ServerMessage, SessionPatch,
};

use common::{player, room_error, room_update, room_update_with, Harness};

fn join_room(display_name: &str, room_code: &str) -> ClientMessage {
    ClientMessage::JoinRoom {
        display_name: display_name.into(),
        room_code: room_code.into(),
    }
}

// ════════════════════════════════════════════════════════════════════
// Establishing a room
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn host_creates_room_and_caches_the_code() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    let generation = h.client.host("  Ash ", RoomSettings::default()).await.unwrap();
    assert_eq!(generation.get(), 1);

    server.welcome("c1");
    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Connected)))
        .await;
    assert_eq!(
        server.next_command().await,
        ClientMessage::CreateRoom {
            display_name: "Ash".into(),
            settings: RoomSettings::default(),
        }
    );

    server.push(&room_update(Some("AB12CD"), "c1", vec![player("c1", "Ash")]));
    let established = h
        .wait_for(|e| matches!(e, LobbyEvent::RoomEstablished { .. }))
        .await;
    assert_eq!(
        established,
        LobbyEvent::RoomEstablished {
            room_code: "AB12CD".into(),
            is_host: true,
        }
    );

    let identity = h.cache.get();
    assert_eq!(identity.display_name, "Ash");
    assert_eq!(identity.role, Role::Host);
    assert_eq!(identity.room_code.as_deref(), Some("AB12CD"));
    assert!(identity.last_updated.is_some());

    // Alone in the room: the gate stays closed.
    assert!(!tokio_test::assert_ok!(h.client.start_game().await));

    server.push(&room_update(
        Some("AB12CD"),
        "c1",
        vec![player("c1", "Ash"), player("c2", "Misty")],
    ));
    let view = h.next_room().await;
    assert_eq!(view.player_count(), 2);
    assert!(view.is_host);

    assert!(tokio_test::assert_ok!(h.client.start_game().await));
    assert_eq!(
        server.next_command().await,
        ClientMessage::StartGame {
            room_code: "AB12CD".into()
        }
    );
    // At most once per channel.
    assert!(!h.client.start_game().await.unwrap());
    assert!(server.try_next_command().is_none());

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn negotiation_waits_for_the_settle_delay() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    server.welcome("c2");
    h.wait_for(|e| matches!(e, LobbyEvent::Connected { .. })).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.try_next_command().is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.next_command().await, join_room("Misty", "AB12CD"));

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn identity_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open_cache = || {
        Arc::new(LocalSessionCache::open(
            FileStore::new(dir.path()),
            CacheOptions::new(),
        ))
    };

    // First run: a guest joins and the server confirms the room.
    {
        let mut h = Harness::with_cache(1, LobbyConfig::new(), open_cache());
        let mut server = h.next_server();
        h.client.join("Misty", "ab12cd").await.unwrap();
        server.welcome("c2");
        assert_eq!(server.next_command().await, join_room("Misty", "AB12CD"));
        server.push(&room_update(
            Some("AB12CD"),
            "c1",
            vec![player("c1", "Ash"), player("c2", "Misty")],
        ));
        h.wait_for(|e| matches!(e, LobbyEvent::RoomEstablished { .. }))
            .await;
        h.client.shutdown().await;
    }

    // Second run: the cached identity rejoins the same room.
    let mut h = Harness::with_cache(1, LobbyConfig::new(), open_cache());
    let identity = h.client.identity();
    assert_eq!(identity.display_name, "Misty");
    assert_eq!(identity.role, Role::Guest);
    assert_eq!(identity.room_code.as_deref(), Some("AB12CD"));

    let mut server = h.next_server();
    h.client.connect().await.unwrap();
    server.welcome("c7");
    assert_eq!(server.next_command().await, join_room("Misty", "AB12CD"));

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Snapshot reconciliation
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn snapshots_replace_the_view_and_rederive_the_host() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    server.welcome("c2");
    assert_eq!(server.next_command().await, join_room("Misty", "AB12CD"));

    let twelve_questions = RoomSettings {
        question_count: 12,
        ..RoomSettings::default()
    };
    server.push(&room_update(
        Some("AB12CD"),
        "c1",
        vec![player("c1", "Ash"), player("c2", "Misty")],
    ));
    server.push(&room_update(
        Some("AB12CD"),
        "c1",
        vec![player("c1", "Ash"), player("c2", "Misty"), player("c3", "Brock")],
    ));
    // Ash left; Misty inherits the room. The payload's own flags are wrong.
    server.push(&room_update_with(
        Some("AB12CD"),
        "c2",
        vec![
            PlayerEntry {
                is_host: true,
                ..player("c3", "Brock")
            },
            player("c2", "Misty"),
        ],
        twelve_questions,
    ));

    let first = h.next_room().await;
    assert!(!first.is_host);
    assert_eq!(first.host().unwrap().display_name, "Ash");

    let _second = h.next_room().await;
    let last = h.next_room().await;
    let ids: Vec<_> = last.roster.iter().map(|p| p.connection_id.as_str()).collect();
    assert_eq!(ids, ["c3", "c2"]);
    assert!(!last.roster[0].is_host);
    assert!(last.roster[1].is_host);
    assert!(last.is_host);
    assert_eq!(last.host_connection_id, "c2");
    assert_eq!(last.settings, twelve_questions);

    // The new host may start.
    assert!(h.client.start_game().await.unwrap());
    assert_eq!(
        server.next_command().await,
        ClientMessage::StartGame {
            room_code: "AB12CD".into()
        }
    );
    assert_eq!(h.client.room().await.as_ref(), Some(&last));

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn retry_after_drop_issues_one_join_per_channel() {
    let mut h = Harness::start(2, LobbyConfig::new());
    let mut first = h.next_server();
    let mut second = h.next_server();

    let g1 = h.client.join("Misty", "AB12CD").await.unwrap();
    first.welcome("c1");
    assert_eq!(first.next_command().await, join_room("Misty", "AB12CD"));

    // The channel drops before the join is acknowledged.
    first.drop_connection();
    let retry = h
        .wait_for(|e| matches!(e, LobbyEvent::Reconnecting { .. }))
        .await;
    assert_eq!(
        retry,
        LobbyEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(2),
        }
    );

    second.welcome("c2");
    assert_eq!(second.next_command().await, join_room("Misty", "AB12CD"));
    second.push(&room_update(
        Some("AB12CD"),
        "c9",
        vec![player("c9", "Ash"), player("c2", "Misty")],
    ));

    let view = h.next_room().await;
    assert!(view.generation > g1);
    assert_eq!(view.self_connection_id, "c2");
    assert!(!view.is_host);

    assert!(first.try_next_command().is_none());
    assert!(second.try_next_command().is_none());
    assert_eq!(h.connect_attempts(), 2);
    // A guest's start request round-trips the driver, so shared state is current.
    assert!(!h.client.start_game().await.unwrap());
    assert_eq!(h.client.policy_state().await, PolicyState::Stable);

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_manual_reconnect_resets_them() {
    let mut h = Harness::start(4, LobbyConfig::new().with_max_retries(2));
    let first = h.next_server();
    let second = h.next_server();
    let third = h.next_server();
    let fourth = h.next_server();

    h.client.host("Ash", RoomSettings::default()).await.unwrap();
    first.welcome("c1");
    h.wait_for(|e| matches!(e, LobbyEvent::Connected { .. })).await;

    first.drop_connection();
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 1, .. }))
        .await;
    // Neither retry gets as far as a handshake.
    second.drop_connection();
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 2, .. }))
        .await;
    third.drop_connection();
    h.wait_for(|e| matches!(e, LobbyEvent::ConnectionLost { .. }))
        .await;
    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Failed)))
        .await;

    assert_eq!(h.client.policy_state().await, PolicyState::GivenUp);
    assert_eq!(h.connect_attempts(), 3);

    // Nothing else happens on its own.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connect_attempts(), 3);

    h.client.reconnect().await.unwrap();
    fourth.welcome("c4");
    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Connected)))
        .await;
    assert_eq!(h.client.policy_state().await, PolicyState::Stable);
    assert_eq!(h.connect_attempts(), 4);

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn handshakes_without_a_room_still_exhaust_retries() {
    let max_retries = 2;
    let mut h = Harness::start(5, LobbyConfig::new().with_max_retries(max_retries));
    let mut servers: Vec<_> = (0..5).map(|_| h.next_server()).collect();
    // Every channel handshakes; none ever produces a room.
    for server in &servers {
        server.welcome("c1");
    }

    h.client.host("Ash", RoomSettings::default()).await.unwrap();

    // First channel: create_room goes unanswered past the deadline.
    assert!(matches!(
        servers[0].next_command().await,
        ClientMessage::CreateRoom { .. }
    ));
    h.wait_for(|e| matches!(e, LobbyEvent::CommandTimedOut { .. }))
        .await;
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 1, .. }))
        .await;

    // Second channel: drops right after create_room.
    assert!(matches!(
        servers[1].next_command().await,
        ClientMessage::CreateRoom { .. }
    ));
    servers[1].drop_connection();
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 2, .. }))
        .await;

    // Third channel: silent again. That was the last allowed retry.
    assert!(matches!(
        servers[2].next_command().await,
        ClientMessage::CreateRoom { .. }
    ));
    h.wait_for(|e| matches!(e, LobbyEvent::ConnectionLost { .. }))
        .await;
    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Failed)))
        .await;

    assert_eq!(h.connect_attempts(), max_retries as usize + 1);
    assert_eq!(h.client.policy_state().await, PolicyState::GivenUp);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.connect_attempts(), max_retries as usize + 1);
    assert!(servers[3].try_next_command().is_none());

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn negotiated_room_resets_the_retry_count() {
    let mut h = Harness::start(4, LobbyConfig::new().with_max_retries(1));
    let first = h.next_server();
    let mut second = h.next_server();
    let mut third = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    first.welcome("c1");
    h.wait_for(|e| matches!(e, LobbyEvent::Connected { .. })).await;
    first.drop_connection();
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 1, .. }))
        .await;

    // The retry gets all the way to a room, which clears the count.
    second.welcome("c2");
    assert_eq!(second.next_command().await, join_room("Misty", "AB12CD"));
    second.push(&room_update(
        Some("AB12CD"),
        "c9",
        vec![player("c9", "Ash"), player("c2", "Misty")],
    ));
    h.next_room().await;
    assert!(!h.client.start_game().await.unwrap());
    assert_eq!(h.client.policy_state().await, PolicyState::Stable);

    // So the next drop gets a fresh retry instead of giving up.
    second.drop_connection();
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 1, .. }))
        .await;
    third.welcome("c3");
    assert_eq!(third.next_command().await, join_room("Misty", "AB12CD"));
    assert_eq!(h.connect_attempts(), 3);

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn server_close_is_not_retried() {
    let mut h = Harness::start(2, LobbyConfig::new());
    let first = h.next_server();

    h.client.host("Ash", RoomSettings::default()).await.unwrap();
    first.welcome("c1");
    h.wait_for(|e| matches!(e, LobbyEvent::Connected { .. })).await;

    first.close();
    let mut retried = false;
    loop {
        match h.events.recv().await.unwrap() {
            LobbyEvent::Reconnecting { .. } => retried = true,
            LobbyEvent::StatusChanged(ConnectionState::Failed) => break,
            _ => {}
        }
    }
    assert!(!retried);
    assert_eq!(h.client.policy_state().await, PolicyState::GivenUp);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connect_attempts(), 1);

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_join_counts_as_a_lost_channel() {
    let mut h = Harness::start(2, LobbyConfig::new());
    let mut first = h.next_server();
    let mut second = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    first.welcome("c1");
    assert_eq!(first.next_command().await, join_room("Misty", "AB12CD"));

    // The server never answers.
    let timed_out = h
        .wait_for(|e| matches!(e, LobbyEvent::CommandTimedOut { .. }))
        .await;
    assert_eq!(
        timed_out,
        LobbyEvent::CommandTimedOut {
            command: "join_room"
        }
    );
    h.wait_for(|e| matches!(e, LobbyEvent::Reconnecting { attempt: 1, .. }))
        .await;
    assert!(first.is_closed());

    second.welcome("c2");
    assert_eq!(second.next_command().await, join_room("Misty", "AB12CD"));

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn fatal_room_error_returns_to_the_entry_screen() {
    let mut h = Harness::start(2, LobbyConfig::new());
    let mut first = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    first.welcome("c1");
    assert_eq!(first.next_command().await, join_room("Misty", "AB12CD"));

    first.push(&room_error("room no longer exists", true));
    let event = h
        .wait_for(|e| matches!(e, LobbyEvent::RoomError { .. }))
        .await;
    assert_eq!(
        event,
        LobbyEvent::RoomError {
            message: "room no longer exists".into(),
            fatal: true,
        }
    );
    assert!(matches!(
        event.error(),
        Some(LobbyError::Server { fatal: true, .. })
    ));
    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Disconnected)))
        .await;

    let identity = h.cache.get();
    assert_eq!(identity.room_code, None);
    assert_eq!(identity.display_name, "Misty");
    assert!(first.is_closed());
    assert_eq!(h.client.policy_state().await, PolicyState::GivenUp);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connect_attempts(), 1);

    // A guest must pick a new room before reconnecting.
    let err = h.client.connect().await.unwrap_err();
    assert!(matches!(err, LobbyError::MissingRoomCode));

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_room_code_at_negotiation_asks_for_one() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    // The code disappears before the handshake settles.
    h.cache.set(SessionPatch::new().without_room_code());
    server.welcome("c1");

    let event = h
        .wait_for(|e| matches!(e, LobbyEvent::NeedsRoomCode { .. }))
        .await;
    assert!(matches!(event, LobbyEvent::NeedsRoomCode { .. }));
    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Disconnected)))
        .await;

    assert!(server.try_next_command().is_none());
    assert!(server.is_closed());
    assert_eq!(h.client.policy_state().await, PolicyState::Stable);

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_start_can_be_retried_until_the_game_starts() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.host("Ash", RoomSettings::default()).await.unwrap();
    server.welcome("c1");
    assert!(matches!(
        server.next_command().await,
        ClientMessage::CreateRoom { .. }
    ));
    server.push(&room_update(
        Some("QW34ER"),
        "c1",
        vec![player("c1", "Ash"), player("c2", "Misty")],
    ));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomEstablished { .. }))
        .await;

    assert!(h.client.start_game().await.unwrap());
    assert!(matches!(
        server.next_command().await,
        ClientMessage::StartGame { .. }
    ));

    server.push(&room_error("question bank unavailable", false));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomError { fatal: false, .. }))
        .await;
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);

    assert!(h.client.start_game().await.unwrap());
    assert!(matches!(
        server.next_command().await,
        ClientMessage::StartGame { .. }
    ));

    let settings = RoomSettings::default();
    server.push(&ServerMessage::GameStarted { settings });
    let started = h
        .wait_for(|e| matches!(e, LobbyEvent::GameStarted { .. }))
        .await;
    assert_eq!(started, LobbyEvent::GameStarted { settings });
    assert!(!h.client.start_game().await.unwrap());

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn room_error_answers_the_oldest_pending_command() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.host("Ash", RoomSettings::default()).await.unwrap();
    server.welcome("c1");
    server.next_command().await;
    server.push(&room_update(
        Some("QW34ER"),
        "c1",
        vec![player("c1", "Ash"), player("c2", "Misty")],
    ));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomEstablished { .. }))
        .await;

    let settings = RoomSettings {
        question_count: 10,
        ..RoomSettings::default()
    };
    h.client.update_settings(settings).await.unwrap();
    assert!(h.client.start_game().await.unwrap());
    assert!(matches!(
        server.next_command().await,
        ClientMessage::UpdateRoomSettings { .. }
    ));
    assert!(matches!(
        server.next_command().await,
        ClientMessage::StartGame { .. }
    ));

    // This rejects the settings change; start_game is still in flight.
    server.push(&room_error("settings are locked", false));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomError { fatal: false, .. }))
        .await;
    assert!(!h.client.start_game().await.unwrap());
    assert!(server.try_next_command().is_none());

    // This one rejects the start.
    server.push(&room_error("question bank unavailable", false));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomError { fatal: false, .. }))
        .await;
    assert!(h.client.start_game().await.unwrap());
    assert!(matches!(
        server.next_command().await,
        ClientMessage::StartGame { .. }
    ));

    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Room commands and gameplay handoff
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn settings_updates_are_validated_and_host_only() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.host("Ash", RoomSettings::default()).await.unwrap();
    server.welcome("c1");
    server.next_command().await;
    server.push(&room_update(Some("AB12CD"), "c1", vec![player("c1", "Ash")]));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomEstablished { .. }))
        .await;

    let too_many = RoomSettings {
        question_count: 50,
        ..RoomSettings::default()
    };
    let err = h.client.update_settings(too_many).await.unwrap_err();
    assert!(matches!(err, LobbyError::Validation(_)));
    assert!(server.try_next_command().is_none());

    let settings = RoomSettings {
        question_count: 12,
        per_question_time_limit: 20,
        ..RoomSettings::default()
    };
    tokio_test::assert_ok!(h.client.update_settings(settings).await);
    assert_eq!(
        server.next_command().await,
        ClientMessage::UpdateRoomSettings {
            room_code: "AB12CD".into(),
            settings,
        }
    );

    server.push(&room_update_with(Some("AB12CD"), "c1", vec![player("c1", "Ash")], settings));
    assert_eq!(h.next_room().await.settings, settings);

    // Host migrates away; the local player is a guest now.
    server.push(&room_update(
        Some("AB12CD"),
        "c2",
        vec![player("c2", "Misty"), player("c1", "Ash")],
    ));
    h.next_room().await;
    let err = h.client.update_settings(settings).await.unwrap_err();
    assert!(matches!(err, LobbyError::NotHost));

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn gameplay_pushes_are_forwarded() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    server.welcome("c2");
    server.next_command().await;

    let question = serde_json::json!({ "index": 0, "text": "2 + 2?", "choices": ["3", "4"] });
    server.push(&ServerMessage::GameQuestion(question.clone()));
    assert_eq!(
        h.wait_for(|e| matches!(e, LobbyEvent::GameQuestion(_))).await,
        LobbyEvent::GameQuestion(question)
    );

    h.client.submit_answer("4").await.unwrap();
    assert_eq!(
        server.next_command().await,
        ClientMessage::SubmitAnswer { answer: "4".into() }
    );

    server.push(&ServerMessage::ShowAnswer(serde_json::json!({ "correct": "4" })));
    h.wait_for(|e| matches!(e, LobbyEvent::ShowAnswer(_))).await;
    server.push(&ServerMessage::GameOver(serde_json::json!({ "winner": "c2" })));
    h.wait_for(|e| matches!(e, LobbyEvent::GameOver(_))).await;

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn leaving_closes_the_channel_and_forgets_the_room() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    server.welcome("c2");
    server.next_command().await;
    server.push(&room_update(
        Some("AB12CD"),
        "c1",
        vec![player("c1", "Ash"), player("c2", "Misty")],
    ));
    h.wait_for(|e| matches!(e, LobbyEvent::RoomEstablished { .. }))
        .await;

    h.client.leave().await.unwrap();
    assert_eq!(
        server.next_command().await,
        ClientMessage::LeaveRoom {
            room_code: "AB12CD".into()
        }
    );
    assert!(server.is_closed());
    assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.cache.get().room_code, None);

    h.wait_for(|e| matches!(e, LobbyEvent::StatusChanged(ConnectionState::Disconnected)))
        .await;
    assert_eq!(h.client.room().await, None);
    assert!(!h.client.can_start());

    h.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_do_not_disturb_the_session() {
    let mut h = Harness::start(1, LobbyConfig::new());
    let mut server = h.next_server();

    h.client.join("Misty", "AB12CD").await.unwrap();
    server.push_raw("{not json");
    server.push_raw(r#"{"type":"mystery","data":{}}"#);
    server.welcome("c2");

    assert_eq!(server.next_command().await, join_room("Misty", "AB12CD"));
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);

    h.client.shutdown().await;
}
