//! Event reconciler: the single writer of one session's local state.
//!
//! The [`Reconciler`] merges Event Bus envelopes and directory snapshots into
//! a [`SessionStore`], drives the [`RoundTracker`], keeps the leaderboard in
//! step with every mutation, and builds the [`SessionSummary`] exactly once
//! when the session finishes. Every merge rule is idempotent, so replaying an
//! envelope or re-applying a snapshot never changes the outcome.
//!
//! Malformed payloads and envelopes addressed to other sessions are logged and
//! discarded; the state is left untouched.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::LiveQuizError;
use crate::leaderboard::{leaderboard, LeaderboardEntry};
use crate::protocol::{
    EventEnvelope, Participant, QuestionUpdate, Session, SessionEvent, SessionId, SessionStatus,
    UserId,
};
use crate::rounds::{Round, RoundTracker};
use crate::store::SessionStore;
use crate::summary::{build_summary, SessionSummary, SummaryInputs};

/// Outcome of looking the session up in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLookup {
    /// No snapshot has arrived yet.
    #[default]
    Loading,
    Ready,
    /// The directory does not know this session. Terminal.
    NotFound,
}

/// Read-only snapshot of a session for presentation code.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: SessionId,
    /// Participants in `user_id` order.
    pub participants: Vec<Participant>,
    pub is_connected: bool,
    pub connection_error: Option<String>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub round_history: Vec<Round>,
    pub current_round: Option<Round>,
    pub bonus_round: Option<Round>,
    pub minigame_score: Option<u32>,
    pub summary: Option<Arc<SessionSummary>>,
    pub session: Option<Session>,
    pub lookup: SessionLookup,
}

impl SessionView {
    /// View of a session nothing is known about yet.
    pub fn loading(session_id: SessionId) -> Self {
        Self {
            session_id,
            participants: Vec::new(),
            is_connected: false,
            connection_error: None,
            leaderboard: Vec::new(),
            round_history: Vec::new(),
            current_round: None,
            bonus_round: None,
            minigame_score: None,
            summary: None,
            session: None,
            lookup: SessionLookup::Loading,
        }
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn status(&self) -> SessionStatus {
        self.session
            .as_ref()
            .map(|session| session.status)
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Reconciler {
    store: SessionStore,
    rounds: RoundTracker,
    leaderboard: Vec<LeaderboardEntry>,
    minigame_score: Option<u32>,
    summary: Option<Arc<SessionSummary>>,
    lookup: SessionLookup,
}

impl Reconciler {
    /// Reconciler for `session_id`, tallying answers of `subject` once known.
    pub fn new(session_id: SessionId, subject: Option<UserId>) -> Self {
        Self {
            store: SessionStore::new(session_id),
            rounds: RoundTracker::new(subject),
            leaderboard: Vec::new(),
            minigame_score: None,
            summary: None,
            lookup: SessionLookup::Loading,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.store.session_id()
    }

    pub fn subject(&self) -> Option<&UserId> {
        self.rounds.subject()
    }

    pub fn set_subject(&mut self, subject: UserId) {
        self.rounds.set_subject(subject);
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn rounds(&self) -> &RoundTracker {
        &self.rounds
    }

    pub fn leaderboard(&self) -> &[LeaderboardEntry] {
        &self.leaderboard
    }

    pub fn summary(&self) -> Option<&Arc<SessionSummary>> {
        self.summary.as_ref()
    }

    pub fn lookup(&self) -> SessionLookup {
        self.lookup
    }

    /// Verify, decode, and apply one bus envelope. Returns `true` if the
    /// state changed.
    pub fn apply_envelope(&mut self, envelope: &EventEnvelope) -> bool {
        let session_id = self.session_id();
        if envelope.session_id != Some(session_id) {
            warn!(
                session_id,
                envelope_session = ?envelope.session_id,
                kind = %envelope.kind,
                "dropping envelope addressed to another session"
            );
            return false;
        }

        match envelope.decode() {
            Ok(event) => self.apply(event),
            Err(LiveQuizError::UnknownEvent(kind)) => {
                debug!(session_id, %kind, "ignoring unknown event type");
                false
            }
            Err(e) => {
                warn!(session_id, kind = %envelope.kind, "discarding event: {e}");
                false
            }
        }
    }

    /// Apply one decoded event. Returns `true` if the state changed.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        let session_id = self.session_id();
        debug!(session_id, kind = event.kind(), "applying event");

        let changed = match event {
            SessionEvent::ParticipantJoined(participant) => self.store.upsert(participant),
            SessionEvent::ParticipantsSnapshot(participants) => {
                return self.apply_participants_snapshot(participants);
            }
            SessionEvent::ParticipantLeft { user_id } => self.store.remove(&user_id),
            SessionEvent::ParticipantProgress(progress) => self.store.merge_progress(progress),
            SessionEvent::SessionStarted(update) => self.start(&update),
            SessionEvent::QuestionAdvanced(update) => self.advance(&update),
            SessionEvent::AnswerSubmitted(answer) => self.rounds.record_answer(&answer),
            SessionEvent::SessionFinished => self.finish(),
            SessionEvent::MinigameScored { user_id, score } => {
                if self.subject() == Some(&user_id) {
                    self.record_minigame_score(score)
                } else {
                    false
                }
            }
        };

        if changed {
            self.refresh_leaderboard();
        }
        changed
    }

    /// Replace all participants with an authoritative snapshot.
    pub fn apply_participants_snapshot(&mut self, participants: Vec<Participant>) -> bool {
        let before = self.store.participants();
        self.store.replace(participants);
        self.mark_ready();
        let changed = self.store.participants() != before;
        if changed {
            self.refresh_leaderboard();
        }
        changed
    }

    /// Merge the directory's session record. Status never moves backwards; a
    /// finished record finishes the session locally.
    pub fn apply_session_snapshot(&mut self, snapshot: Session) -> bool {
        let session_id = self.session_id();
        if snapshot.session_id != session_id {
            warn!(
                session_id,
                snapshot_session = snapshot.session_id,
                "dropping session record for another session"
            );
            return false;
        }
        self.mark_ready();

        // Live events may be ahead of the directory: status and the current
        // question never move backwards, and an unknown total keeps ours.
        let before = self.store.session().cloned();
        let merged = match before.as_ref() {
            None => snapshot,
            Some(local) => Session {
                session_id,
                status: local.status.max(snapshot.status),
                total_questions: if snapshot.total_questions > 0 {
                    snapshot.total_questions
                } else {
                    local.total_questions
                },
                current_question: local.current_question.max(snapshot.current_question),
            },
        };
        let status = merged.status;
        self.store.set_session(merged);

        let mut changed = self.store.session() != before.as_ref();
        if status == SessionStatus::Finished {
            changed |= self.finish();
        }
        changed
    }

    /// Record that the directory does not know this session.
    pub fn mark_not_found(&mut self) -> bool {
        let changed = self.lookup != SessionLookup::NotFound;
        self.lookup = SessionLookup::NotFound;
        changed
    }

    /// Attach the bonus-round minigame score for the subject.
    pub fn record_minigame_score(&mut self, score: u32) -> bool {
        if self.summary.is_some() {
            debug!(score, "minigame score after summary; summary unchanged");
        }
        let changed = self.minigame_score != Some(score);
        self.minigame_score = Some(score);
        changed
    }

    /// Snapshot of the current state.
    pub fn view(&self, is_connected: bool, connection_error: Option<String>) -> SessionView {
        SessionView {
            session_id: self.session_id(),
            participants: self.store.participants(),
            is_connected,
            connection_error,
            leaderboard: self.leaderboard.clone(),
            round_history: self.rounds.history().to_vec(),
            current_round: self.rounds.current_round(),
            bonus_round: self.rounds.bonus_round().cloned(),
            minigame_score: self.minigame_score,
            summary: self.summary.clone(),
            session: self.store.session().cloned(),
            lookup: self.lookup,
        }
    }

    fn start(&mut self, update: &QuestionUpdate) -> bool {
        if !self.accepts_question(update) {
            return false;
        }
        let session = self.store.session_mut();
        if session.status != SessionStatus::Pending {
            debug!(status = ?session.status, "session_started ignored");
            return false;
        }
        session.status = SessionStatus::Active;
        session.current_question = Some(update.current_question);
        session.total_questions = update.total_questions;
        self.rounds.on_question(update);
        true
    }

    fn advance(&mut self, update: &QuestionUpdate) -> bool {
        if !self.accepts_question(update) {
            return false;
        }
        let session = self.store.session_mut();
        if session.status == SessionStatus::Finished {
            debug!("question_advanced after finish ignored");
            return false;
        }
        let before = session.clone();
        session.status = SessionStatus::Active;
        session.current_question = Some(update.current_question);
        if update.total_questions > 0 {
            session.total_questions = update.total_questions;
        }
        let changed = *session != before;
        self.rounds.on_question(update) || changed
    }

    fn finish(&mut self) -> bool {
        let session = self.store.session_mut();
        let mut changed = session.status != SessionStatus::Finished;
        session.status = SessionStatus::Finished;
        let total_questions = session.total_questions;

        changed |= self.rounds.finish();

        if self.summary.is_none() {
            self.refresh_leaderboard();
            let summary = build_summary(SummaryInputs {
                subject: self.rounds.subject(),
                round_history: self.rounds.history(),
                bonus_round: self.rounds.bonus_round(),
                minigame_score: self.minigame_score,
                total_questions,
                leaderboard: &self.leaderboard,
                reconstructed: self.rounds.is_reconstructed(),
            });
            info!(
                session_id = self.session_id(),
                percent = summary.final_score_percent,
                rank = ?summary.user_rank,
                "session finished, summary built"
            );
            self.summary = Some(Arc::new(summary));
            changed = true;
        }
        changed
    }

    fn accepts_question(&self, update: &QuestionUpdate) -> bool {
        let accepted = self.rounds.accepts(update);
        if !accepted {
            warn!(
                session_id = self.session_id(),
                round = ?update.round,
                "discarding question update with implausible round tag"
            );
        }
        accepted
    }

    fn mark_ready(&mut self) {
        if self.lookup == SessionLookup::Loading {
            self.lookup = SessionLookup::Ready;
        }
    }

    fn refresh_leaderboard(&mut self) {
        self.leaderboard = leaderboard(&self.store.participants());
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
    use crate::protocol::{AnswerSubmitted, ParticipantProgress};
    use serde_json::json;

    const SESSION: SessionId = 42;

    fn reconciler() -> Reconciler {
        Reconciler::new(SESSION, Some(UserId::from("me")))
    }

    fn envelope(kind: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            kind: kind.to_string(),
            session_id: Some(SESSION),
            payload,
        }
    }

    fn question(current: u32, round: Option<u32>) -> QuestionUpdate {
        QuestionUpdate {
            current_question: current,
            total_questions: 4,
            round,
            is_bonus_round: false,
        }
    }

    #[test]
    fn joined_event_inserts_and_ranks() {
        let mut r = reconciler();
        assert!(r.apply_envelope(&envelope(
            "participant_joined",
            json!({"user_id": "a", "display_name": "Ada", "score": 2})
        )));
        assert_eq!(r.store().len(), 1);
        assert_eq!(r.leaderboard()[0].display_name, "Ada");
    }

    #[test]
    fn envelope_for_other_session_is_dropped() {
        let mut r = reconciler();
        let mut foreign = envelope(
            "participant_joined",
            json!({"user_id": "a", "display_name": "Ada"}),
        );
        foreign.session_id = Some(SESSION + 1);
        assert!(!r.apply_envelope(&foreign));
        assert!(r.store().is_empty());
    }

    #[test]
    fn malformed_snapshot_leaves_state_unchanged() {
        let mut r = reconciler();
        r.apply(SessionEvent::ParticipantJoined(Participant::new("a", "Ada")));

        assert!(!r.apply_envelope(&envelope("participants_snapshot", json!({"oops": 1}))));
        assert!(!r.apply_envelope(&envelope(
            "participants_snapshot",
            json!([{"user_id": "b", "display_name": "Bo", "score": -4}])
        )));
        assert_eq!(r.store().len(), 1);
        assert!(r.store().get(&UserId::from("a")).is_some());
    }

    #[test]
    fn unknown_event_is_ignored() {
        let mut r = reconciler();
        assert!(!r.apply_envelope(&envelope("confetti", json!({}))));
    }

    #[test]
    fn replaying_events_is_idempotent() {
        let mut r = reconciler();
        let events = vec![
            envelope("participant_joined", json!({"user_id": "a", "display_name": "Ada"})),
            envelope("participant_joined", json!({"user_id": "b", "display_name": "Bo"})),
            envelope("participant_left", json!({"user_id": "b"})),
            envelope("session_started", json!({"current_question": 1, "total_questions": 4})),
        ];
        for event in &events {
            r.apply_envelope(event);
        }
        let once = r.view(true, None);
        for event in &events {
            r.apply_envelope(event);
        }
        assert_eq!(r.view(true, None), once);
    }

    #[test]
    fn session_started_only_moves_pending_to_active() {
        let mut r = reconciler();
        assert!(r.apply(SessionEvent::SessionStarted(question(1, None))));
        let session = r.store().session().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_question, Some(1));
        assert_eq!(session.total_questions, 4);

        assert!(!r.apply(SessionEvent::SessionStarted(question(3, None))));
        assert_eq!(r.store().session().unwrap().current_question, Some(1));
    }

    #[test]
    fn question_advanced_replaces_current_and_promotes_pending() {
        let mut r = reconciler();
        assert!(r.apply(SessionEvent::QuestionAdvanced(question(2, Some(1)))));
        let session = r.store().session().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_question, Some(2));

        r.apply(SessionEvent::SessionFinished);
        assert!(!r.apply(SessionEvent::QuestionAdvanced(question(3, Some(1)))));
        assert_eq!(r.store().session().unwrap().current_question, Some(2));
    }

    #[test]
    fn progress_event_updates_existing_participant() {
        let mut r = reconciler();
        r.apply(SessionEvent::ParticipantJoined(Participant::new("a", "Ada")));
        assert!(r.apply(SessionEvent::ParticipantProgress(ParticipantProgress {
            user_id: UserId::from("a"),
            score: Some(6.0),
            ..Default::default()
        })));
        assert_eq!(r.leaderboard()[0].score, 6.0);
    }

    #[test]
    fn finish_builds_summary_once() {
        let mut r = reconciler();
        r.apply(SessionEvent::ParticipantJoined(Participant::new("me", "Me").with_score(3.0)));
        r.apply(SessionEvent::ParticipantJoined(Participant::new("you", "You").with_score(8.0)));
        r.apply(SessionEvent::SessionStarted(question(1, Some(1))));
        r.apply(SessionEvent::AnswerSubmitted(AnswerSubmitted {
            user_id: UserId::from("me"),
            question_id: 10,
            correct: true,
        }));
        r.apply(SessionEvent::MinigameScored {
            user_id: UserId::from("me"),
            score: 55,
        });

        assert!(r.apply(SessionEvent::SessionFinished));
        let summary = Arc::clone(r.summary().unwrap());
        assert_eq!(summary.correct_answers, 1);
        assert_eq!(summary.total_questions, 4);
        assert_eq!(summary.user_rank, Some(2));
        assert_eq!(summary.minigame_score, Some(55));
        assert_eq!(summary.round_history.len(), 1);

        // A second finish (event or snapshot) keeps the same summary.
        assert!(!r.apply(SessionEvent::SessionFinished));
        r.apply_session_snapshot(Session {
            session_id: SESSION,
            status: SessionStatus::Finished,
            total_questions: 9,
            current_question: None,
        });
        assert!(Arc::ptr_eq(r.summary().unwrap(), &summary));
    }

    #[test]
    fn minigame_score_for_other_user_is_ignored() {
        let mut r = reconciler();
        assert!(!r.apply(SessionEvent::MinigameScored {
            user_id: UserId::from("you"),
            score: 10,
        }));
        assert_eq!(r.view(false, None).minigame_score, None);
    }

    #[test]
    fn session_snapshot_never_regresses_status() {
        let mut r = reconciler();
        r.apply(SessionEvent::SessionStarted(question(2, None)));
        r.apply_session_snapshot(Session::pending(SESSION));
        assert_eq!(r.store().session().unwrap().status, SessionStatus::Active);
        assert_eq!(r.lookup(), SessionLookup::Ready);
    }

    #[test]
    fn session_snapshot_keeps_newer_live_progress() {
        let mut r = reconciler();
        r.apply(SessionEvent::SessionStarted(question(1, None)));
        r.apply(SessionEvent::QuestionAdvanced(question(3, None)));

        r.apply_session_snapshot(Session {
            session_id: SESSION,
            status: SessionStatus::Active,
            total_questions: 0,
            current_question: Some(1),
        });
        let session = r.store().session().unwrap();
        assert_eq!(session.total_questions, 4);
        assert_eq!(session.current_question, Some(3));

        r.apply_session_snapshot(Session {
            session_id: SESSION,
            status: SessionStatus::Active,
            total_questions: 6,
            current_question: Some(5),
        });
        let session = r.store().session().unwrap();
        assert_eq!(session.total_questions, 6);
        assert_eq!(session.current_question, Some(5));
    }

    #[test]
    fn implausible_round_tag_is_discarded() {
        let mut r = reconciler();
        r.apply(SessionEvent::SessionStarted(question(1, Some(1))));

        assert!(!r.apply_envelope(&envelope(
            "question_advanced",
            json!({"current_question": 2, "total_questions": 4, "round": u32::MAX})
        )));
        let view = r.view(true, None);
        assert!(view.round_history.is_empty());
        assert_eq!(view.current_round.unwrap().round_number, 1);
        assert_eq!(view.session.unwrap().current_question, Some(1));
    }

    #[test]
    fn open_round_is_flushed_into_history_on_finish() {
        let mut r = reconciler();
        let tagged = |current: u32, round: u32| QuestionUpdate {
            current_question: current,
            total_questions: 15,
            round: Some(round),
            is_bonus_round: false,
        };
        r.apply(SessionEvent::SessionStarted(tagged(1, 1)));
        r.apply(SessionEvent::QuestionAdvanced(tagged(6, 2)));
        r.apply(SessionEvent::QuestionAdvanced(tagged(11, 3)));
        for (question_id, correct) in [(11, true), (12, false)] {
            r.apply(SessionEvent::AnswerSubmitted(AnswerSubmitted {
                user_id: UserId::from("me"),
                question_id,
                correct,
            }));
        }

        assert!(r.apply(SessionEvent::SessionFinished));
        let summary = r.summary().unwrap();
        let last = summary.round_history.last().unwrap();
        assert_eq!(summary.round_history.len(), 3);
        assert_eq!(last.round_number, 3);
        assert_eq!(last.questions_attempted, vec![11, 12]);
        assert_eq!(last.correct_answers, 1);
        assert_eq!(last.incorrect_answers, 1);
    }

    #[test]
    fn round_gap_marks_summary_reconstructed() {
        let mut r = reconciler();
        r.apply(SessionEvent::SessionStarted(question(1, Some(1))));
        r.apply(SessionEvent::QuestionAdvanced(question(3, Some(3))));
        r.apply(SessionEvent::SessionFinished);

        let summary = r.summary().unwrap();
        let numbers: Vec<_> = summary.round_history.iter().map(|r| r.round_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(summary.round_history[1].reconstructed);
        assert!(summary.reconstructed);
    }

    #[test]
    fn string_snapshot_payload_is_discarded() {
        let mut r = reconciler();
        r.apply_participants_snapshot(vec![Participant::new("a", "Ada")]);

        assert!(!r.apply_envelope(&envelope("participants_snapshot", json!("everyone"))));
        assert_eq!(r.store().len(), 1);
        assert!(r.store().get(&UserId::from("a")).is_some());
    }

    #[test]
    fn finished_snapshot_finishes_session() {
        let mut r = reconciler();
        assert!(r.apply_session_snapshot(Session {
            session_id: SESSION,
            status: SessionStatus::Finished,
            total_questions: 5,
            current_question: Some(5),
        }));
        assert!(r.summary().is_some());
        assert_eq!(r.summary().unwrap().total_questions, 5);
    }

    #[test]
    fn snapshot_replaces_participants_and_marks_ready() {
        let mut r = reconciler();
        assert_eq!(r.lookup(), SessionLookup::Loading);
        r.apply(SessionEvent::ParticipantJoined(Participant::new("gone", "Gone")));
        assert!(r.apply_participants_snapshot(vec![Participant::new("a", "Ada")]));
        assert_eq!(r.lookup(), SessionLookup::Ready);
        let view = r.view(true, None);
        assert_eq!(view.participants.len(), 1);
        assert!(view.participant(&UserId::from("gone")).is_none());
    }

    #[test]
    fn not_found_is_terminal() {
        let mut r = reconciler();
        assert!(r.mark_not_found());
        r.apply_participants_snapshot(Vec::new());
        assert_eq!(r.lookup(), SessionLookup::NotFound);
    }
}
