#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for live quiz engine integration tests.
//!
//! Provides a channel-based [`LoopbackConnector`] whose bus halves are handed
//! to the test, an in-memory [`MemoryDirectory`], and helpers for building
//! Event Bus frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use live_quiz_engine::protocol::SessionStatus;
use live_quiz_engine::{
    BackoffPolicy, ClientMessage, ConnectionConfig, Connector, LiveQuizError, Participant,
    QuizSession, Session, SessionDirectory, SessionId, SessionView, Transport,
};

/// Upper bound for every wait in the integration tests.
pub const WAIT: Duration = Duration::from_secs(3);

/// Install a `tracing` subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connection config with fast retries and no heartbeat.
pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_backoff(BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        })
        .with_heartbeat_interval(None)
}

// ── LoopbackConnector ───────────────────────────────────────────────

/// Client half of an in-process bus connection.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), LiveQuizError> {
        self.tx
            .send(message)
            .map_err(|e| LiveQuizError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, LiveQuizError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), LiveQuizError> {
        Ok(())
    }
}

/// Bus half of an in-process connection. Dropping it drops the connection.
pub struct BusSide {
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
}

impl BusSide {
    /// Next frame the engine sent.
    pub async fn next_frame(&mut self) -> ClientMessage {
        let text = tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("frame in time")
            .expect("connection open");
        serde_json::from_str(&text).expect("valid client frame")
    }

    /// Read frames until `count` room joins were seen; returns the room names sorted.
    pub async fn joined_rooms(&mut self, count: usize) -> Vec<String> {
        let mut rooms = Vec::new();
        while rooms.len() < count {
            if let ClientMessage::JoinRoom { room } = self.next_frame().await {
                rooms.push(room);
            }
        }
        rooms.sort();
        rooms
    }

    /// Read frames until a `leave_room` arrives; returns its room name.
    pub async fn next_left_room(&mut self) -> String {
        loop {
            if let ClientMessage::LeaveRoom { room } = self.next_frame().await {
                return room;
            }
        }
    }

    /// Deliver a raw frame to the engine.
    pub fn push(&self, frame: impl Into<String>) {
        self.push.send(frame.into()).expect("engine side open");
    }
}

/// A [`Connector`] that creates in-process connections and hands each bus
/// half to the test. Connections are refused while `refuse` is set.
pub struct LoopbackConnector {
    buses: mpsc::UnboundedSender<BusSide>,
    pub attempts: Arc<AtomicUsize>,
    pub refuse: Arc<AtomicBool>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusSide>) {
        let (buses_tx, buses_rx) = mpsc::unbounded_channel();
        let connector = Self {
            buses: buses_tx,
            attempts: Arc::new(AtomicUsize::new(0)),
            refuse: Arc::new(AtomicBool::new(false)),
        };
        (connector, buses_rx)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&mut self) -> Result<LoopbackTransport, LiveQuizError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(LiveQuizError::TransportSend("connection refused".into()));
        }
        let (client_tx, sent) = mpsc::unbounded_channel();
        let (push, client_rx) = mpsc::unbounded_channel();
        let _ = self.buses.send(BusSide { sent, push });
        Ok(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

/// Wait for the next bus connection the engine opens.
pub async fn next_bus(buses: &mut mpsc::UnboundedReceiver<BusSide>) -> BusSide {
    tokio::time::timeout(WAIT, buses.recv())
        .await
        .expect("connection in time")
        .expect("connector alive")
}

// ── MemoryDirectory ─────────────────────────────────────────────────

#[derive(Debug)]
struct DirectoryState {
    participants: Vec<Participant>,
    session: Session,
    not_found: bool,
    participant_delays: VecDeque<Duration>,
    participant_loads: usize,
    starts: usize,
    reshuffles: usize,
}

/// In-memory [`SessionDirectory`] for one session.
#[derive(Debug)]
pub struct MemoryDirectory {
    session_id: SessionId,
    state: StdMutex<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new(session_id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            state: StdMutex::new(DirectoryState {
                participants: Vec::new(),
                session: Session::pending(session_id),
                not_found: false,
                participant_delays: VecDeque::new(),
                participant_loads: 0,
                starts: 0,
                reshuffles: 0,
            }),
        })
    }

    pub fn set_participants(&self, participants: Vec<Participant>) {
        self.state.lock().unwrap().participants = participants;
    }

    pub fn set_session(&self, session: Session) {
        self.state.lock().unwrap().session = session;
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.state.lock().unwrap().session.status = status;
    }

    pub fn set_not_found(&self, not_found: bool) {
        self.state.lock().unwrap().not_found = not_found;
    }

    /// Delay the next participant load by `delay`. The returned data is the
    /// data at call time, not at completion time.
    pub fn delay_next_participant_load(&self, delay: Duration) {
        self.state.lock().unwrap().participant_delays.push_back(delay);
    }

    pub fn participant_loads(&self) -> usize {
        self.state.lock().unwrap().participant_loads
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn reshuffles(&self) -> usize {
        self.state.lock().unwrap().reshuffles
    }

    fn check(&self, session_id: SessionId) -> Result<(), LiveQuizError> {
        if session_id != self.session_id || self.state.lock().unwrap().not_found {
            return Err(LiveQuizError::SessionNotFound(session_id));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn load_participants(&self, session_id: SessionId) -> Result<Vec<Participant>, LiveQuizError> {
        self.check(session_id)?;
        let (participants, delay) = {
            let mut state = self.state.lock().unwrap();
            state.participant_loads += 1;
            (state.participants.clone(), state.participant_delays.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(participants)
    }

    async fn load_session(&self, session_id: SessionId) -> Result<Session, LiveQuizError> {
        self.check(session_id)?;
        Ok(self.state.lock().unwrap().session.clone())
    }

    async fn start_session(&self, session_id: SessionId) -> Result<(), LiveQuizError> {
        self.check(session_id)?;
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        state.session.status = SessionStatus::Active;
        Ok(())
    }

    async fn reshuffle_questions(&self, session_id: SessionId) -> Result<(), LiveQuizError> {
        self.check(session_id)?;
        self.state.lock().unwrap().reshuffles += 1;
        Ok(())
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Wait until the session publishes a view satisfying `predicate`.
pub async fn wait_for_view(
    session: &QuizSession,
    mut predicate: impl FnMut(&SessionView) -> bool,
) -> Arc<SessionView> {
    let mut views = session.subscribe();
    let view = tokio::time::timeout(WAIT, views.wait_for(|view| predicate(view)))
        .await
        .expect("view condition reached in time")
        .expect("view channel open");
    Arc::clone(&view)
}

/// Wait until `condition` holds, polling every few milliseconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

// ── JSON helper functions ───────────────────────────────────────────

/// Returns the JSON text of an Event Bus envelope.
pub fn envelope_json(session_id: SessionId, kind: &str, payload: Value) -> String {
    json!({ "type": kind, "session_id": session_id, "payload": payload }).to_string()
}

pub fn participant_joined_json(session_id: SessionId, user_id: &str, name: &str, score: f64) -> String {
    envelope_json(
        session_id,
        "participant_joined",
        json!({ "user_id": user_id, "display_name": name, "score": score }),
    )
}

pub fn participant_left_json(session_id: SessionId, user_id: &str) -> String {
    envelope_json(session_id, "participant_left", json!({ "user_id": user_id }))
}

pub fn progress_json(session_id: SessionId, user_id: &str, score: f64) -> String {
    envelope_json(
        session_id,
        "participant_progress",
        json!({ "user_id": user_id, "score": score }),
    )
}

pub fn session_started_json(session_id: SessionId, total_questions: u32) -> String {
    envelope_json(
        session_id,
        "session_started",
        json!({ "current_question": 1, "total_questions": total_questions, "round": 1 }),
    )
}

pub fn question_advanced_json(
    session_id: SessionId,
    current_question: u32,
    total_questions: u32,
    round: u32,
    is_bonus_round: bool,
) -> String {
    envelope_json(
        session_id,
        "question_advanced",
        json!({
            "current_question": current_question,
            "total_questions": total_questions,
            "round": round,
            "is_bonus_round": is_bonus_round,
        }),
    )
}

pub fn answer_json(session_id: SessionId, user_id: &str, question_id: u64, correct: bool) -> String {
    envelope_json(
        session_id,
        "answer_submitted",
        json!({ "user_id": user_id, "question_id": question_id, "correct": correct }),
    )
}

pub fn minigame_json(session_id: SessionId, user_id: &str, score: u32) -> String {
    envelope_json(
        session_id,
        "minigame_scored",
        json!({ "user_id": user_id, "score": score }),
    )
}

pub fn session_finished_json(session_id: SessionId) -> String {
    envelope_json(session_id, "session_finished", json!({}))
}
