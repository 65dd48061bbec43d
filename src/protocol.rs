//! Wire types for the Session Directory and the Event Bus.
//!
//! Event Bus frames are JSON text. Outgoing frames use the
//! `{"type": ..., "data": ...}` layout of [`ClientMessage`]. Incoming frames are
//! [`EventEnvelope`]s (`{"type", "session_id", "payload"}`) whose payload is
//! decoded per event type into a [`SessionEvent`]. Decoding the payload
//! separately from the envelope lets the engine reject one malformed payload
//! without losing track of which session it belonged to.

use std::cmp::Ordering;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{LiveQuizError, Result};

// ── Identifiers ─────────────────────────────────────────────────────

/// Identifier of one quiz session.
pub type SessionId = u64;

/// Identifier of one question.
pub type QuestionId = u64;

/// Stable identity of a participant, unique within a session.
///
/// The directory and the bus have historically sent user ids both as JSON
/// strings and as JSON integers; both deserialize into the same `UserId`.
/// Ordering is numeric when both ids are integers and lexicographic
/// otherwise, with integer ids sorting first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The textual form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self(text),
            Raw::Number(number) => Self(number.to_string()),
        })
    }
}

impl Ord for UserId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for UserId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

// ── Enums ───────────────────────────────────────────────────────────

/// Role a session member joins with. Determines the role room and which
/// commands are permitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs the session; may start it and reshuffle its questions.
    Teacher,
    /// Answers questions.
    Student,
    /// Read-only observer (dashboards, projectors).
    Monitor,
}

impl Role {
    /// Whether this role may issue session-control commands.
    pub fn controls_session(self) -> bool {
        matches!(self, Self::Teacher)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Teacher => "teacher",
            Self::Student => "student",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a session: pending → active → finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Active,
    Finished,
}

/// Progress of one participant through the quiz.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

// ── Structs ─────────────────────────────────────────────────────────

/// Cached copy of the backend's session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub total_questions: u32,
    /// Populated once the session is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question: Option<u32>,
}

impl Session {
    /// A pending session with no question information yet.
    pub fn pending(session_id: SessionId) -> Self {
        Self {
            session_id,
            status: SessionStatus::Pending,
            total_questions: 0,
            current_question: None,
        }
    }
}

/// One connected or previously-connected user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub user_id: UserId,
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(default)]
    pub status: ParticipantStatus,
    #[serde(default)]
    pub score: f64,
    /// Completion percentage (0–100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default)]
    pub correct_answers: u32,
    #[serde(default)]
    pub total_answers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question_id: Option<QuestionId>,
    /// ISO 8601 timestamp of the participant's last activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<String>,
}

impl Participant {
    /// A fresh participant with zero score.
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            status: ParticipantStatus::Pending,
            score: 0.0,
            progress: None,
            correct_answers: 0,
            total_answers: 0,
            current_question_id: None,
            last_accessed: None,
        }
    }

    /// Set the score.
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Check the numeric invariants a payload must satisfy before it may touch the store.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the score is negative or not finite,
    /// or when the progress lies outside 0–100.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.score.is_finite() || self.score < 0.0 {
            return Err(format!(
                "participant {} has invalid score {}",
                self.user_id, self.score
            ));
        }
        if let Some(progress) = self.progress {
            if !(0.0..=100.0).contains(&progress) {
                return Err(format!(
                    "participant {} has progress {progress} outside 0-100",
                    self.user_id
                ));
            }
        }
        Ok(())
    }
}

/// Partial update of an existing participant. Absent fields are left untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ParticipantProgress {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ParticipantStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_answers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question_id: Option<QuestionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<String>,
}

/// Payload of `session_started` and `question_advanced`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionUpdate {
    pub current_question: u32,
    pub total_questions: u32,
    /// Round the new question belongs to. `None` means "the current round".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    /// Set when this question opens the bonus round.
    #[serde(default)]
    pub is_bonus_round: bool,
}

/// Payload of `answer_submitted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerSubmitted {
    pub user_id: UserId,
    pub question_id: QuestionId,
    pub correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ParticipantLeftPayload {
    user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct MinigameScoredPayload {
    user_id: UserId,
    score: u32,
}

// ── Rooms ───────────────────────────────────────────────────────────

/// A named subscription scope on the Event Bus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Room {
    /// `session:{id}` — every event about the session.
    Session(SessionId),
    /// `session:{id}:role:{role}` — role-specific events such as aggregate statistics.
    Role(SessionId, Role),
    /// `session:{id}:user:{user_id}` — events addressed to exactly one participant.
    User(SessionId, UserId),
}

impl Room {
    /// Session this room belongs to.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Session(id) | Self::Role(id, _) | Self::User(id, _) => *id,
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Role(id, role) => write!(f, "session:{id}:role:{role}"),
            Self::User(id, user_id) => write!(f, "session:{id}:user:{user_id}"),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Frames sent from the engine to the Event Bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe this connection to a room.
    JoinRoom { room: String },
    /// Unsubscribe this connection from a room.
    LeaveRoom { room: String },
    /// Heartbeat to maintain the connection.
    Ping,
}

impl ClientMessage {
    pub fn join(room: &Room) -> Self {
        Self::JoinRoom {
            room: room.to_string(),
        }
    }

    pub fn leave(room: &Room) -> Self {
        Self::LeaveRoom {
            room: room.to_string(),
        }
    }
}

/// Wire names of the event types.
pub mod event_type {
    pub const PARTICIPANT_JOINED: &str = "participant_joined";
    pub const PARTICIPANTS_SNAPSHOT: &str = "participants_snapshot";
    pub const PARTICIPANT_LEFT: &str = "participant_left";
    pub const PARTICIPANT_PROGRESS: &str = "participant_progress";
    pub const SESSION_STARTED: &str = "session_started";
    pub const QUESTION_ADVANCED: &str = "question_advanced";
    pub const ANSWER_SUBMITTED: &str = "answer_submitted";
    pub const SESSION_FINISHED: &str = "session_finished";
    pub const MINIGAME_SCORED: &str = "minigame_scored";
    /// Unscoped heartbeat reply.
    pub const PONG: &str = "pong";
}

/// One inbound Event Bus frame, before its payload is decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Absent only on unscoped control frames such as `pong`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Decode the payload according to the envelope's event type.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::UnknownEvent`] for unhandled types and
    /// [`LiveQuizError::MalformedPayload`] when the payload fails validation.
    pub fn decode(&self) -> Result<SessionEvent> {
        SessionEvent::decode(&self.kind, &self.payload)
    }

    pub fn is_pong(&self) -> bool {
        self.kind == event_type::PONG
    }
}

/// A decoded Event Bus event. Each variant carries exactly the data its merge
/// rule needs, including the round and bonus-round tags.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined(Participant),
    ParticipantsSnapshot(Vec<Participant>),
    ParticipantLeft { user_id: UserId },
    ParticipantProgress(ParticipantProgress),
    SessionStarted(QuestionUpdate),
    QuestionAdvanced(QuestionUpdate),
    AnswerSubmitted(AnswerSubmitted),
    SessionFinished,
    MinigameScored { user_id: UserId, score: u32 },
}

impl SessionEvent {
    /// Wire name of this event's type.
    pub fn kind(&self) -> &'static str {
        use event_type::*;
        match self {
            Self::ParticipantJoined(_) => PARTICIPANT_JOINED,
            Self::ParticipantsSnapshot(_) => PARTICIPANTS_SNAPSHOT,
            Self::ParticipantLeft { .. } => PARTICIPANT_LEFT,
            Self::ParticipantProgress(_) => PARTICIPANT_PROGRESS,
            Self::SessionStarted(_) => SESSION_STARTED,
            Self::QuestionAdvanced(_) => QUESTION_ADVANCED,
            Self::AnswerSubmitted(_) => ANSWER_SUBMITTED,
            Self::SessionFinished => SESSION_FINISHED,
            Self::MinigameScored { .. } => MINIGAME_SCORED,
        }
    }

    /// Decode an event from its wire type and payload.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::UnknownEvent`] for unhandled types and
    /// [`LiveQuizError::MalformedPayload`] when the payload does not match the
    /// type's shape or a participant fails [`Participant::validate`].
    pub fn decode(kind: &str, payload: &serde_json::Value) -> Result<Self> {
        use event_type::*;
        let event = match kind {
            PARTICIPANT_JOINED => {
                let participant: Participant = parse(kind, payload)?;
                participant
                    .validate()
                    .map_err(|reason| LiveQuizError::malformed(kind, reason))?;
                Self::ParticipantJoined(participant)
            }
            PARTICIPANTS_SNAPSHOT => {
                if !payload.is_array() {
                    return Err(LiveQuizError::malformed(kind, "payload is not an array"));
                }
                let participants: Vec<Participant> = parse(kind, payload)?;
                for participant in &participants {
                    participant
                        .validate()
                        .map_err(|reason| LiveQuizError::malformed(kind, reason))?;
                }
                Self::ParticipantsSnapshot(participants)
            }
            PARTICIPANT_LEFT => {
                let left: ParticipantLeftPayload = parse(kind, payload)?;
                Self::ParticipantLeft {
                    user_id: left.user_id,
                }
            }
            PARTICIPANT_PROGRESS => {
                let progress: ParticipantProgress = parse(kind, payload)?;
                if progress.score.is_some_and(|s| !s.is_finite() || s < 0.0) {
                    return Err(LiveQuizError::malformed(kind, "score must be non-negative"));
                }
                if progress.progress.is_some_and(|p| !(0.0..=100.0).contains(&p)) {
                    return Err(LiveQuizError::malformed(kind, "progress outside 0-100"));
                }
                Self::ParticipantProgress(progress)
            }
            SESSION_STARTED => Self::SessionStarted(parse(kind, payload)?),
            QUESTION_ADVANCED => Self::QuestionAdvanced(parse(kind, payload)?),
            ANSWER_SUBMITTED => Self::AnswerSubmitted(parse(kind, payload)?),
            SESSION_FINISHED => Self::SessionFinished,
            MINIGAME_SCORED => {
                let scored: MinigameScoredPayload = parse(kind, payload)?;
                Self::MinigameScored {
                    user_id: scored.user_id,
                    score: scored.score,
                }
            }
            other => return Err(LiveQuizError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    /// Wrap this event into an envelope addressed to `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::Serialization`] if the payload cannot be encoded.
    pub fn into_envelope(self, session_id: SessionId) -> Result<EventEnvelope> {
        let kind = self.kind().to_string();
        let payload = match self {
            Self::ParticipantJoined(participant) => serde_json::to_value(participant)?,
            Self::ParticipantsSnapshot(participants) => serde_json::to_value(participants)?,
            Self::ParticipantLeft { user_id } => {
                serde_json::to_value(ParticipantLeftPayload { user_id })?
            }
            Self::ParticipantProgress(progress) => serde_json::to_value(progress)?,
            Self::SessionStarted(update) | Self::QuestionAdvanced(update) => {
                serde_json::to_value(update)?
            }
            Self::AnswerSubmitted(answer) => serde_json::to_value(answer)?,
            Self::SessionFinished => serde_json::json!({}),
            Self::MinigameScored { user_id, score } => {
                serde_json::to_value(MinigameScoredPayload { user_id, score })?
            }
        };
        Ok(EventEnvelope {
            kind,
            session_id: Some(session_id),
            payload,
        })
    }
}

fn parse<T: DeserializeOwned>(kind: &str, payload: &serde_json::Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| LiveQuizError::malformed(kind, e))
}
