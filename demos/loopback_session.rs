//! # Loopback Session Example
//!
//! Runs a complete quiz session in-process: a channel-based bus connection
//! stands in for the Event Bus and an in-memory directory serves the
//! snapshots. Shows how to implement [`Connector`], [`Transport`] and
//! [`SessionDirectory`] for your own backends.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use live_quiz_engine::protocol::{AnswerSubmitted, QuestionUpdate};
use live_quiz_engine::{
    ConnectionConfig, ConnectionManager, Connector, LiveQuizError, Participant, QuizSession,
    Role, Session, SessionConfig, SessionDirectory, SessionEvent, SessionId, SessionLookup,
    SessionParams, Transport,
};
use tokio::sync::mpsc;

const SESSION: SessionId = 7;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based bus connection
// ─────────────────────────────────────────────────────────────────────

/// Engine half of the loopback connection.
struct LoopbackTransport {
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

/// Bus half of the loopback connection.
struct FakeBus {
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
}

/// Hands out a single connection; later attempts fail.
struct LoopbackConnector {
    pending: Option<LoopbackTransport>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&mut self) -> Result<LoopbackTransport, LiveQuizError> {
        self.pending.take().ok_or(LiveQuizError::TransportClosed)
    }
}

fn loopback() -> (LoopbackConnector, FakeBus) {
    let (client_tx, sent) = mpsc::unbounded_channel();
    let (push, client_rx) = mpsc::unbounded_channel();
    let connector = LoopbackConnector {
        pending: Some(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }),
    };
    (connector, FakeBus { sent, push })
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: An in-memory directory
// ─────────────────────────────────────────────────────────────────────

struct StaticDirectory {
    participants: Vec<Participant>,
    session: Mutex<Session>,
}

#[async_trait]
impl SessionDirectory for StaticDirectory {
    async fn load_participants(&self, _: SessionId) -> Result<Vec<Participant>, LiveQuizError> {
        Ok(self.participants.clone())
    }

    async fn load_session(&self, _: SessionId) -> Result<Session, LiveQuizError> {
        let session = self
            .session
            .lock()
            .map_err(|_| LiveQuizError::DirectoryUnavailable("poisoned".into()))?;
        Ok(session.clone())
    }

    async fn start_session(&self, _: SessionId) -> Result<(), LiveQuizError> {
        Ok(())
    }

    async fn reshuffle_questions(&self, _: SessionId) -> Result<(), LiveQuizError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Drive a session
// ─────────────────────────────────────────────────────────────────────

fn frame(event: SessionEvent) -> Result<String, LiveQuizError> {
    Ok(serde_json::to_string(&event.into_envelope(SESSION)?)?)
}

fn answer(question_id: u64, correct: bool) -> SessionEvent {
    SessionEvent::AnswerSubmitted(AnswerSubmitted {
        user_id: "ada".into(),
        question_id,
        correct,
    })
}

fn question(current_question: u32, round: u32, is_bonus_round: bool) -> QuestionUpdate {
    QuestionUpdate {
        current_question,
        total_questions: 4,
        round: Some(round),
        is_bonus_round,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (connector, mut bus) = loopback();
    let mut manager = ConnectionManager::start(connector, ConnectionConfig::default());

    let directory = Arc::new(StaticDirectory {
        participants: vec![
            Participant::new("ada", "Ada"),
            Participant::new("bo", "Bo"),
        ],
        session: Mutex::new(Session::pending(SESSION)),
    });

    let mut session = QuizSession::open(
        &manager.handle(),
        directory,
        SessionParams::new(SESSION, Role::Student).with_user_id("ada"),
        SessionConfig::default(),
    );

    // ── Wait for the room joins and the entry snapshot ──────────────
    for _ in 0..3 {
        let Some(join) = bus.sent.recv().await else {
            return Err("engine closed the bus before joining".into());
        };
        tracing::info!("Bus received: {join}");
    }
    let mut views = session.subscribe();
    views
        .wait_for(|view| view.lookup == SessionLookup::Ready)
        .await?;

    // ── Play the session ────────────────────────────────────────────
    let script = vec![
        SessionEvent::SessionStarted(question(1, 1, false)),
        answer(1, true),
        answer(2, false),
        SessionEvent::QuestionAdvanced(question(3, 2, false)),
        answer(3, true),
        SessionEvent::QuestionAdvanced(question(4, 3, true)),
        answer(4, true),
        SessionEvent::MinigameScored {
            user_id: "ada".into(),
            score: 42,
        },
        SessionEvent::SessionFinished,
    ];
    for event in script {
        bus.push.send(frame(event)?)?;
    }

    let view = views.wait_for(|view| view.summary.is_some()).await?.clone();
    if let Some(summary) = &view.summary {
        tracing::info!(
            "Finished: {:.1}% ({}/{}), rank {:?} of {}, minigame {:?}",
            summary.final_score_percent,
            summary.correct_answers,
            summary.total_questions,
            summary.user_rank,
            summary.total_participants,
            summary.minigame_score,
        );
        for round in &summary.round_history {
            tracing::info!(
                "Round {}: {} correct, {} incorrect",
                round.round_number,
                round.correct_answers,
                round.incorrect_answers
            );
        }
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    session.leave().await;
    manager.shutdown().await;
    Ok(())
}
