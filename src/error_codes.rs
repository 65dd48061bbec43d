//! Structured error codes returned by the Session Directory.
//!
//! Failure envelopes carry an optional `code` field serialized in
//! `SCREAMING_SNAKE_CASE` (e.g., `"SESSION_NOT_FOUND"`). Codes this crate does
//! not know deserialize to [`ErrorCode::Unknown`] instead of failing the whole
//! response.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by the Session Directory.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authorization errors
    Unauthorized,
    Forbidden,

    // Session errors
    SessionNotFound,
    SessionAlreadyStarted,
    SessionFinished,
    NotEnoughQuestions,

    // Validation errors
    InvalidInput,

    // Rate limiting
    RateLimitExceeded,

    // Server errors
    InternalError,
    ServiceUnavailable,

    /// A code introduced by a newer directory version.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => {
                "Access denied. Authentication credentials are missing or invalid."
            }
            Self::Forbidden => "Your account is not allowed to perform this action on the session.",
            Self::SessionNotFound => {
                "The requested session could not be found. It may have been deleted or the link is incorrect."
            }
            Self::SessionAlreadyStarted => "The session has already been started.",
            Self::SessionFinished => "The session has already finished.",
            Self::NotEnoughQuestions => {
                "The quiz does not have enough questions to perform this action."
            }
            Self::InvalidInput => {
                "The provided input is invalid or malformed. Check your request parameters."
            }
            Self::RateLimitExceeded => {
                "Too many requests in a short time. Please slow down and try again later."
            }
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
            Self::Unknown => "The session directory reported an unrecognized error.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::SessionNotFound).unwrap();
        assert_eq!(json, "\"SESSION_NOT_FOUND\"");
    }

    #[test]
    fn unrecognized_code_maps_to_unknown() {
        let code: ErrorCode = serde_json::from_str("\"QUIZ_LOCKED\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(
            ErrorCode::Forbidden.to_string(),
            ErrorCode::Forbidden.description()
        );
    }
}
