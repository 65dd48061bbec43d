//! Session Directory abstraction and response decoding.
//!
//! The [`SessionDirectory`] trait is the engine's only view of the backend's
//! REST surface: loading snapshots and issuing teacher commands. Concrete
//! implementations live in [`directories`](crate::directories); tests use
//! in-memory ones.
//!
//! Every directory response follows one canonical envelope,
//! [`DirectoryResponse`]. The only tolerated deviation, a bare participant
//! array from older backends, is handled by [`decode_participants`] and
//! nowhere else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LiveQuizError, Result};
use crate::error_codes::ErrorCode;
use crate::protocol::{Participant, Session, SessionId};

/// Authoritative source of session and participant snapshots.
#[async_trait]
pub trait SessionDirectory: Send + Sync + 'static {
    /// Full participant list of a session. Every participant is well-formed.
    async fn load_participants(&self, session_id: SessionId) -> Result<Vec<Participant>>;

    /// Current session record.
    async fn load_session(&self, session_id: SessionId) -> Result<Session>;

    /// Move a pending session to active.
    async fn start_session(&self, session_id: SessionId) -> Result<()>;

    /// Reorder the session's remaining questions.
    async fn reshuffle_questions(&self, session_id: SessionId) -> Result<()>;
}

/// Canonical response envelope of the Session Directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct DirectoryResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl<T> DirectoryResponse<T> {
    /// A successful response carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            code: None,
        }
    }

    /// A failure response.
    pub fn failure(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            code,
        }
    }

    /// Unwrap the payload of a successful response.
    ///
    /// # Errors
    ///
    /// Failure envelopes become [`LiveQuizError::SessionNotFound`] for code
    /// `SESSION_NOT_FOUND` and [`LiveQuizError::Directory`] otherwise.
    pub fn into_data(self, session_id: SessionId) -> Result<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(failure(session_id, self.message, self.code))
        }
    }
}

/// Payload of `GET /sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub session: Session,
}

fn failure(session_id: SessionId, message: Option<String>, code: Option<ErrorCode>) -> LiveQuizError {
    if code == Some(ErrorCode::SessionNotFound) {
        return LiveQuizError::SessionNotFound(session_id);
    }
    let message = message
        .or_else(|| code.as_ref().map(|c| c.description().to_string()))
        .unwrap_or_else(|| "request failed".to_string());
    LiveQuizError::Directory {
        message,
        error_code: code,
    }
}

fn validate_all(kind: &str, participants: &[Participant]) -> Result<()> {
    participants
        .iter()
        .try_for_each(|p| p.validate().map_err(|reason| LiveQuizError::malformed(kind, reason)))
}

/// Decode a participants snapshot body.
///
/// Accepts the canonical envelope and, for older backends, a bare JSON array
/// of participants. The snapshot is rejected as a whole if any participant is
/// malformed.
///
/// # Errors
///
/// Returns [`LiveQuizError::MalformedPayload`] for undecodable or invalid
/// bodies, and the mapped directory error for failure envelopes.
pub fn decode_participants(session_id: SessionId, body: &str) -> Result<Vec<Participant>> {
    const KIND: &str = "participants";

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| LiveQuizError::malformed(KIND, e))?;

    let participants = if value.is_array() {
        Vec::<Participant>::deserialize(&value).map_err(|e| LiveQuizError::malformed(KIND, e))?
    } else {
        DirectoryResponse::<Vec<Participant>>::deserialize(&value)
            .map_err(|e| LiveQuizError::malformed(KIND, e))?
            .into_data(session_id)?
            .ok_or_else(|| LiveQuizError::malformed(KIND, "success response without data"))?
    };

    validate_all(KIND, &participants)?;
    Ok(participants)
}

/// Decode a `{ success, data: { session } }` body.
///
/// # Errors
///
/// Returns [`LiveQuizError::MalformedPayload`] when the body does not decode
/// or describes a different session.
pub fn decode_session(session_id: SessionId, body: &str) -> Result<Session> {
    const KIND: &str = "session";

    let response: DirectoryResponse<SessionData> =
        serde_json::from_str(body).map_err(|e| LiveQuizError::malformed(KIND, e))?;
    let session = response
        .into_data(session_id)?
        .ok_or_else(|| LiveQuizError::malformed(KIND, "success response without data"))?
        .session;

    if session.session_id != session_id {
        return Err(LiveQuizError::malformed(
            KIND,
            format!(
                "expected session {session_id}, got {}",
                session.session_id
            ),
        ));
    }
    Ok(session)
}

/// Decode the response to a command (`start`, `reshuffle`). Any `data` is ignored.
///
/// # Errors
///
/// Returns [`LiveQuizError::MalformedPayload`] for undecodable bodies and the
/// mapped directory error for failure envelopes.
pub fn decode_ack(session_id: SessionId, body: &str) -> Result<()> {
    let response: DirectoryResponse<serde_json::Value> =
        serde_json::from_str(body).map_err(|e| LiveQuizError::malformed("ack", e))?;
    response.into_data(session_id).map(|_| ())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{SessionStatus, UserId};

    #[test]
    fn participants_from_canonical_envelope() {
        let body = r#"{"success":true,"data":[
            {"user_id":"a","display_name":"Ada","score":3},
            {"user_id":7,"name":"Bo"}
        ]}"#;
        let participants = decode_participants(1, body).unwrap();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[1].user_id, UserId::from(7_u64));
        assert_eq!(participants[1].display_name, "Bo");
    }

    #[test]
    fn participants_from_bare_array() {
        let body = r#"[{"user_id":"a","display_name":"Ada"}]"#;
        let participants = decode_participants(1, body).unwrap();
        assert_eq!(participants, vec![Participant::new("a", "Ada")]);
    }

    #[test]
    fn one_malformed_participant_rejects_snapshot() {
        let body = r#"{"success":true,"data":[
            {"user_id":"a","display_name":"Ada"},
            {"user_id":"b","display_name":"Bo","score":-1}
        ]}"#;
        let err = decode_participants(1, body).unwrap_err();
        assert!(matches!(err, LiveQuizError::MalformedPayload { .. }));
    }

    #[test]
    fn success_without_data_is_malformed() {
        let err = decode_participants(1, r#"{"success":true}"#).unwrap_err();
        assert!(matches!(err, LiveQuizError::MalformedPayload { .. }));
    }

    #[test]
    fn failure_envelope_maps_to_directory_error() {
        let body = r#"{"success":false,"message":"slow down","code":"RATE_LIMIT_EXCEEDED"}"#;
        match decode_participants(1, body).unwrap_err() {
            LiveQuizError::Directory {
                message,
                error_code,
            } => {
                assert_eq!(message, "slow down");
                assert_eq!(error_code, Some(ErrorCode::RateLimitExceeded));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn failure_without_message_uses_code_description() {
        let err = decode_ack(1, r#"{"success":false,"code":"FORBIDDEN"}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("session directory error: {}", ErrorCode::Forbidden.description())
        );
    }

    #[test]
    fn session_not_found_code_is_terminal_error() {
        let body = r#"{"success":false,"message":"nope","code":"SESSION_NOT_FOUND"}"#;
        assert!(matches!(
            decode_session(9, body).unwrap_err(),
            LiveQuizError::SessionNotFound(9)
        ));
    }

    #[test]
    fn session_body_decodes_nested_record() {
        let body = r#"{"success":true,"data":{"session":{
            "session_id":9,"status":"active","total_questions":10,"current_question":2
        }}}"#;
        let session = decode_session(9, body).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.total_questions, 10);
        assert_eq!(session.current_question, Some(2));
    }

    #[test]
    fn session_body_for_other_session_is_rejected() {
        let body = r#"{"success":true,"data":{"session":{"session_id":8}}}"#;
        assert!(matches!(
            decode_session(9, body).unwrap_err(),
            LiveQuizError::MalformedPayload { .. }
        ));
    }

    #[test]
    fn ack_ignores_data() {
        decode_ack(1, r#"{"success":true,"data":{"anything":1}}"#).unwrap();
        decode_ack(1, r#"{"success":true}"#).unwrap();
    }

    #[test]
    fn non_json_body_is_malformed() {
        assert!(matches!(
            decode_participants(1, "<html>").unwrap_err(),
            LiveQuizError::MalformedPayload { .. }
        ));
    }
}
