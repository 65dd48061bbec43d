//! Error types for the live quiz engine.

use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::protocol::{Role, SessionId};

/// Errors that can occur when using the live quiz engine.
#[derive(Debug, Error)]
pub enum LiveQuizError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a wire or directory message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the manager is not connected.
    #[error("not connected to event bus")]
    NotConnected,

    /// The session task has stopped (the session was left or its connection closed).
    #[error("session {0} is no longer attached")]
    SessionDetached(SessionId),

    /// The Session Directory answered with a failure envelope.
    #[error("session directory error: {message}")]
    Directory {
        /// Human-readable error message from the directory.
        message: String,
        /// Structured error code, if provided by the directory.
        error_code: Option<ErrorCode>,
    },

    /// The Session Directory could not be reached or answered with an unexpected status.
    #[error("session directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The Session Directory does not know the requested session.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// A snapshot or event payload failed validation.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload {
        /// Event type or response kind that carried the payload.
        kind: String,
        /// Why the payload was rejected.
        reason: String,
    },

    /// An envelope carried an event type this engine does not handle.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// The command is reserved for another role (e.g. teacher-only commands).
    #[error("command `{command}` is not permitted for role {role}")]
    RoleNotPermitted {
        /// Command that was attempted.
        command: &'static str,
        /// Role of the session that attempted it.
        role: Role,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveQuizError {
    pub(crate) fn malformed(kind: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            kind: kind.into(),
            reason: reason.to_string(),
        }
    }
}

/// A specialized [`Result`] type for live quiz engine operations.
pub type Result<T> = std::result::Result<T, LiveQuizError>;
