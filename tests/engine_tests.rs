//! Integration tests for `QuizSession` over a loopback Event Bus.
//!
//! Uses the shared `LoopbackConnector` and `MemoryDirectory` from
//! `tests/common` to drive complete sessions: entry snapshots, live events,
//! reconnects, teacher commands, and the end-of-session summary.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use live_quiz_engine::protocol::SessionStatus;
use live_quiz_engine::{
    ConnectionManager, LiveQuizError, Participant, QuizSession, ReconciliationStrategy, Role,
    Session, SessionConfig, SessionDirectory, SessionLookup, SessionParams, UserId,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use common::{
    answer_json, envelope_json, eventually, fast_connection_config, init_tracing, minigame_json,
    next_bus, participant_joined_json, participant_left_json, progress_json,
    question_advanced_json, session_finished_json, session_started_json, wait_for_view, BusSide,
    LoopbackConnector, MemoryDirectory,
};

const SESSION: u64 = 42;

// ════════════════════════════════════════════════════════════════════
// Helper: one connection, one directory
// ════════════════════════════════════════════════════════════════════

struct Harness {
    manager: ConnectionManager,
    buses: mpsc::UnboundedReceiver<BusSide>,
    directory: Arc<MemoryDirectory>,
    refuse: Arc<AtomicBool>,
}

impl Harness {
    /// Start a connection manager and return the first bus connection.
    async fn start() -> (Self, BusSide) {
        init_tracing();
        let (connector, mut buses) = LoopbackConnector::new();
        let refuse = Arc::clone(&connector.refuse);
        let manager = ConnectionManager::start(connector, fast_connection_config());
        let bus = next_bus(&mut buses).await;
        let harness = Self {
            manager,
            buses,
            directory: MemoryDirectory::new(SESSION),
            refuse,
        };
        (harness, bus)
    }

    fn open(&self, params: SessionParams) -> QuizSession {
        self.open_with(params, SessionConfig::default())
    }

    fn open_with(&self, params: SessionParams, config: SessionConfig) -> QuizSession {
        let directory: Arc<dyn SessionDirectory> = self.directory.clone();
        QuizSession::open(&self.manager.handle(), directory, params, config)
    }

    /// Drop `bus` and wait for the engine to reconnect.
    async fn reconnect(&mut self, bus: BusSide) -> BusSide {
        drop(bus);
        next_bus(&mut self.buses).await
    }
}

async fn ready(session: &QuizSession) {
    wait_for_view(session, |view| view.lookup == SessionLookup::Ready).await;
}

fn student(user_id: &str) -> SessionParams {
    SessionParams::new(SESSION, Role::Student).with_user_id(user_id)
}

// ════════════════════════════════════════════════════════════════════
// Entry snapshot
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn entry_snapshot_populates_view() {
    let (harness, _bus) = Harness::start().await;
    harness.directory.set_participants(vec![
        Participant::new("a", "Ada").with_score(4.0),
        Participant::new("b", "Bo").with_score(9.0),
    ]);
    harness.directory.set_session(Session {
        session_id: SESSION,
        status: SessionStatus::Active,
        total_questions: 5,
        current_question: Some(2),
    });

    let session = harness.open(student("a"));
    let view = wait_for_view(&session, |view| view.lookup == SessionLookup::Ready).await;

    assert_eq!(view.participants.len(), 2);
    assert_eq!(view.leaderboard[0].display_name, "Bo");
    assert_eq!(view.leaderboard[0].rank, 1);
    assert_eq!(view.leaderboard[1].user_id, UserId::from("a"));
    assert_eq!(view.status(), SessionStatus::Active);
    assert_eq!(view.session.as_ref().unwrap().current_question, Some(2));
    assert!(view.summary.is_none());
    assert_eq!(harness.directory.participant_loads(), 1);
}

#[tokio::test]
async fn tied_scores_rank_above_lower_score() {
    let (harness, _bus) = Harness::start().await;
    harness.directory.set_participants(vec![
        Participant::new("A", "Ada").with_score(80.0),
        Participant::new("B", "Bo").with_score(95.0),
        Participant::new("C", "Cy").with_score(95.0),
    ]);

    let session = harness.open(student("A"));
    let view = wait_for_view(&session, |view| view.leaderboard.len() == 3).await;

    let order: Vec<_> = view.leaderboard.iter().map(|e| e.user_id.clone()).collect();
    assert_eq!(
        order,
        vec![UserId::from("B"), UserId::from("C"), UserId::from("A")]
    );
    assert_eq!(view.leaderboard[2].rank, 3);
}

#[tokio::test]
async fn unknown_session_is_reported_as_not_found() {
    let (harness, bus) = Harness::start().await;
    harness.directory.set_not_found(true);

    let session = harness.open(SessionParams::new(SESSION, Role::Monitor));
    let view = wait_for_view(&session, |view| view.lookup == SessionLookup::NotFound).await;
    assert!(view.participants.is_empty());

    // Live events for an unknown session still arrive but never resurrect it.
    bus.push(participant_joined_json(SESSION, "a", "Ada", 1.0));
    let view = wait_for_view(&session, |view| !view.participants.is_empty()).await;
    assert_eq!(view.lookup, SessionLookup::NotFound);
}

// ════════════════════════════════════════════════════════════════════
// Live events
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn live_events_update_participants_and_leaderboard() {
    let (harness, bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("a", "Ada").with_score(3.0)]);
    let session = harness.open(SessionParams::new(SESSION, Role::Teacher));
    ready(&session).await;

    bus.push(participant_joined_json(SESSION, "b", "Bo", 0.0));
    bus.push(progress_json(SESSION, "b", 7.0));
    let view = wait_for_view(&session, |view| {
        view.participant(&UserId::from("b"))
            .is_some_and(|bo| bo.score == 7.0)
    })
    .await;
    assert_eq!(view.leaderboard[0].user_id, UserId::from("b"));

    // A lower score never overwrites a higher one.
    bus.push(progress_json(SESSION, "b", 2.0));
    bus.push(participant_left_json(SESSION, "a"));
    let view = wait_for_view(&session, |view| view.participants.len() == 1).await;
    assert_eq!(view.participants[0].score, 7.0);
    assert_eq!(view.leaderboard.len(), 1);
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_skipped() {
    let (harness, bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("a", "Ada")]);
    let session = harness.open(SessionParams::new(SESSION, Role::Monitor));
    ready(&session).await;

    bus.push("not json at all");
    bus.push(envelope_json(SESSION, "participants_snapshot", json!({ "nope": 1 })));
    bus.push(envelope_json(SESSION, "confetti_fired", json!({})));
    bus.push(json!({ "type": "participant_joined", "payload": {} }).to_string());
    bus.push(participant_joined_json(SESSION, "b", "Bo", 0.0));

    let view = wait_for_view(&session, |view| view.participants.len() == 2).await;
    assert!(view.participant(&UserId::from("a")).is_some());
    assert!(view.participant(&UserId::from("b")).is_some());
}

#[tokio::test]
async fn events_for_other_sessions_are_isolated() {
    let (harness, bus) = Harness::start().await;
    let other_directory = MemoryDirectory::new(43);
    let first = harness.open(SessionParams::new(SESSION, Role::Monitor));
    let second = QuizSession::open(
        &harness.manager.handle(),
        other_directory,
        SessionParams::new(43, Role::Monitor),
        SessionConfig::default(),
    );
    ready(&first).await;
    ready(&second).await;

    bus.push(participant_joined_json(43, "x", "Xena", 0.0));
    bus.push(participant_joined_json(SESSION, "a", "Ada", 0.0));

    let view = wait_for_view(&second, |view| view.participants.len() == 1).await;
    assert_eq!(view.participants[0].user_id, UserId::from("x"));

    let view = wait_for_view(&first, |view| !view.participants.is_empty()).await;
    assert_eq!(view.participants.len(), 1);
    assert_eq!(view.participants[0].user_id, UserId::from("a"));
}

// ════════════════════════════════════════════════════════════════════
// Rooms and connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rooms_widen_once_identity_resolves() {
    let (harness, mut bus) = Harness::start().await;
    let mut session = harness.open(SessionParams::new(SESSION, Role::Student));

    assert_eq!(bus.joined_rooms(1).await, vec!["session:42"]);

    assert_ok!(session.resolve_identity("u1"));
    assert_eq!(
        bus.joined_rooms(2).await,
        vec!["session:42:role:student", "session:42:user:u1"]
    );
    assert_eq!(session.user_id(), Some(&UserId::from("u1")));
}

#[tokio::test]
async fn reconnect_rejoins_rooms_and_reloads_snapshot() {
    let (mut harness, mut bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("a", "Ada")]);
    let session = harness.open(SessionParams::new(SESSION, Role::Monitor).with_user_id("m"));
    assert_eq!(bus.joined_rooms(3).await.len(), 3);
    ready(&session).await;
    assert_eq!(harness.directory.participant_loads(), 1);

    // Events missed while disconnected only show up in the directory.
    harness.directory.set_participants(vec![
        Participant::new("a", "Ada"),
        Participant::new("b", "Bo"),
    ]);
    let mut bus = harness.reconnect(bus).await;

    assert_eq!(
        bus.joined_rooms(3).await,
        vec!["session:42", "session:42:role:monitor", "session:42:user:m"]
    );
    let view = wait_for_view(&session, |view| view.participants.len() == 2).await;
    assert!(view.is_connected);
    assert!(harness.directory.participant_loads() >= 2);
}

#[tokio::test]
async fn connection_loss_is_surfaced_then_cleared() {
    let (mut harness, bus) = Harness::start().await;
    let session = harness.open(SessionParams::new(SESSION, Role::Monitor));
    wait_for_view(&session, |view| view.is_connected).await;

    harness.refuse.store(true, Ordering::SeqCst);
    drop(bus);
    let view = wait_for_view(&session, |view| {
        !view.is_connected && view.connection_error.is_some()
    })
    .await;
    assert!(!view.connection_error.as_deref().unwrap().is_empty());

    harness.refuse.store(false, Ordering::SeqCst);
    let _bus = next_bus(&mut harness.buses).await;
    let view = wait_for_view(&session, |view| view.is_connected).await;
    assert!(view.connection_error.is_none());
}

// ════════════════════════════════════════════════════════════════════
// Rounds and summary
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_session_produces_summary() {
    let (harness, bus) = Harness::start().await;
    harness.directory.set_participants(vec![
        Participant::new("me", "Me"),
        Participant::new("you", "You"),
    ]);
    let session = harness.open(student("me"));
    ready(&session).await;

    bus.push(session_started_json(SESSION, 6));
    bus.push(answer_json(SESSION, "me", 1, true));
    bus.push(answer_json(SESSION, "me", 2, false));
    bus.push(answer_json(SESSION, "you", 3, true));
    bus.push(question_advanced_json(SESSION, 3, 6, 2, false));
    bus.push(answer_json(SESSION, "me", 3, true));
    bus.push(answer_json(SESSION, "me", 3, true));
    bus.push(question_advanced_json(SESSION, 5, 6, 3, true));
    bus.push(answer_json(SESSION, "me", 5, true));
    bus.push(minigame_json(SESSION, "me", 70));
    bus.push(progress_json(SESSION, "me", 12.0));
    bus.push(progress_json(SESSION, "you", 8.0));
    bus.push(session_finished_json(SESSION));

    let view = wait_for_view(&session, |view| view.summary.is_some()).await;
    let summary = view.summary.as_ref().unwrap();

    assert_eq!(view.status(), SessionStatus::Finished);
    assert_eq!(summary.round_history.len(), 2);
    assert_eq!(summary.round_history[0].correct_answers, 1);
    assert_eq!(summary.round_history[0].incorrect_answers, 1);
    assert_eq!(summary.round_history[1].questions_attempted, vec![3]);
    assert_eq!(summary.correct_answers, 2);
    assert_eq!(summary.total_questions, 6);
    assert!((summary.final_score_percent - 100.0 / 3.0).abs() < 1e-9);

    let bonus = summary.bonus_round.as_ref().unwrap();
    assert!(bonus.is_bonus);
    assert_eq!(bonus.round_number, 3);
    assert_eq!(bonus.correct_answers, 1);

    assert_eq!(summary.minigame_score, Some(70));
    assert_eq!(summary.user_rank, Some(1));
    assert_eq!(summary.total_participants, 2);
    assert!(!summary.reconstructed);
}

#[tokio::test]
async fn skipped_rounds_are_reconstructed_in_summary() {
    let (harness, bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("me", "Me")]);
    let session = harness.open(student("me"));
    ready(&session).await;

    bus.push(session_started_json(SESSION, 8));
    bus.push(answer_json(SESSION, "me", 1, true));
    bus.push(question_advanced_json(SESSION, 6, 8, 4, false));
    bus.push(session_finished_json(SESSION));

    let view = wait_for_view(&session, |view| view.summary.is_some()).await;
    let summary = view.summary.as_ref().unwrap();
    let rounds: Vec<_> = summary
        .round_history
        .iter()
        .map(|round| (round.round_number, round.reconstructed))
        .collect();
    assert_eq!(rounds, vec![(1, false), (2, true), (3, true), (4, false)]);
    assert!(summary.reconstructed);
}

#[tokio::test]
async fn string_participants_snapshot_is_discarded() {
    let (harness, bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("a", "Ada")]);
    let session = harness.open(student("a"));
    ready(&session).await;

    bus.push(envelope_json(SESSION, "participants_snapshot", json!("everyone")));
    bus.push(participant_joined_json(SESSION, "b", "Bo", 1.0));

    let view = wait_for_view(&session, |view| view.participants.len() == 2).await;
    assert!(view.participant(&UserId::from("a")).is_some());
    assert!(view.participant(&UserId::from("b")).is_some());
}

#[tokio::test]
async fn summary_is_fixed_once_built() {
    let (harness, bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("me", "Me")]);
    let session = harness.open(student("me"));
    ready(&session).await;

    bus.push(session_started_json(SESSION, 2));
    bus.push(answer_json(SESSION, "me", 1, true));
    bus.push(session_finished_json(SESSION));
    let first = wait_for_view(&session, |view| view.summary.is_some()).await;

    bus.push(answer_json(SESSION, "me", 2, true));
    assert_ok!(session.report_minigame_score(99));
    let later = wait_for_view(&session, |view| view.minigame_score == Some(99)).await;

    assert!(Arc::ptr_eq(
        first.summary.as_ref().unwrap(),
        later.summary.as_ref().unwrap()
    ));
    assert_eq!(later.summary.as_ref().unwrap().correct_answers, 1);
    assert_eq!(later.summary.as_ref().unwrap().minigame_score, None);
}

#[tokio::test]
async fn finished_snapshot_finishes_session() {
    let (harness, _bus) = Harness::start().await;
    harness.directory.set_participants(vec![
        Participant::new("me", "Me").with_score(1.0),
        Participant::new("you", "You").with_score(5.0),
    ]);
    harness.directory.set_session(Session {
        session_id: SESSION,
        status: SessionStatus::Finished,
        total_questions: 4,
        current_question: None,
    });

    let session = harness.open(student("me"));
    let view = wait_for_view(&session, |view| view.summary.is_some()).await;
    let summary = view.summary.as_ref().unwrap();
    assert_eq!(summary.total_questions, 4);
    assert_eq!(summary.user_rank, Some(2));
    assert_eq!(summary.final_score_percent, 0.0);
}

// ════════════════════════════════════════════════════════════════════
// Reconciliation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stale_snapshot_is_not_applied() {
    let (harness, _bus) = Harness::start().await;
    harness
        .directory
        .set_participants(vec![Participant::new("old", "Old")]);
    let session = harness.open(SessionParams::new(SESSION, Role::Monitor));
    ready(&session).await;

    // The next load captures the old list but finishes late.
    harness
        .directory
        .delay_next_participant_load(Duration::from_millis(300));
    assert_ok!(session.refresh());
    let directory = Arc::clone(&harness.directory);
    eventually(|| directory.participant_loads() == 2).await;

    harness
        .directory
        .set_participants(vec![Participant::new("new", "New")]);
    assert_ok!(session.refresh());
    wait_for_view(&session, |view| {
        view.participant(&UserId::from("new")).is_some()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    let view = session.view();
    assert_eq!(view.participants.len(), 1);
    assert_eq!(view.participants[0].user_id, UserId::from("new"));
}

#[tokio::test]
async fn polling_reloads_snapshots() {
    let (harness, _bus) = Harness::start().await;
    let session = harness.open_with(
        SessionParams::new(SESSION, Role::Monitor),
        SessionConfig::default().with_polling(Duration::from_millis(20)),
    );
    ready(&session).await;

    harness
        .directory
        .set_participants(vec![Participant::new("late", "Late")]);
    let view = wait_for_view(&session, |view| view.participants.len() == 1).await;
    assert_eq!(view.participants[0].display_name, "Late");
    assert!(harness.directory.participant_loads() >= 2);
}

#[tokio::test]
async fn push_only_strategy_loads_on_entry_only() {
    let (harness, _bus) = Harness::start().await;
    let session = harness.open_with(
        SessionParams::new(SESSION, Role::Monitor),
        SessionConfig::default().with_reconciliation(ReconciliationStrategy::PushOnly),
    );
    ready(&session).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.directory.participant_loads(), 1);
}

// ════════════════════════════════════════════════════════════════════
// Commands and leaving
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn only_teachers_control_the_session() {
    let (harness, _bus) = Harness::start().await;
    let student_session = harness.open(student("s"));
    let err = assert_err!(student_session.start_session().await);
    assert!(matches!(
        err,
        LiveQuizError::RoleNotPermitted {
            command: "start_session",
            role: Role::Student
        }
    ));
    assert_err!(student_session.reshuffle_questions().await);
    assert_eq!(harness.directory.starts(), 0);
    drop(student_session);

    let teacher = harness.open(SessionParams::new(SESSION, Role::Teacher));
    ready(&teacher).await;
    assert_ok!(teacher.start_session().await);
    assert_ok!(teacher.reshuffle_questions().await);
    assert_eq!(harness.directory.starts(), 1);
    assert_eq!(harness.directory.reshuffles(), 1);

    assert_ok!(teacher.refresh());
    let view = wait_for_view(&teacher, |view| view.status() == SessionStatus::Active).await;
    assert_eq!(view.lookup, SessionLookup::Ready);
}

#[tokio::test]
async fn leave_releases_rooms_and_stops_updates() {
    let (harness, mut bus) = Harness::start().await;
    let mut session = harness.open(student("u1"));
    assert_eq!(bus.joined_rooms(3).await.len(), 3);
    ready(&session).await;

    session.leave().await;
    assert!(session.is_detached());

    let mut left = vec![
        bus.next_left_room().await,
        bus.next_left_room().await,
        bus.next_left_room().await,
    ];
    left.sort();
    assert_eq!(
        left,
        vec!["session:42", "session:42:role:student", "session:42:user:u1"]
    );

    let err = assert_err!(session.refresh());
    assert!(matches!(err, LiveQuizError::SessionDetached(SESSION)));
    assert_err!(session.start_session().await);

    bus.push(participant_joined_json(SESSION, "late", "Late", 0.0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.view().participants.is_empty());

    // A second leave is a no-op.
    session.leave().await;
}

#[tokio::test]
async fn dropping_a_session_leaves_its_rooms() {
    let (harness, mut bus) = Harness::start().await;
    let session = harness.open(SessionParams::new(SESSION, Role::Monitor));
    assert_eq!(bus.joined_rooms(1).await, vec!["session:42"]);

    drop(session);
    assert_eq!(bus.next_left_room().await, "session:42");
}
