//! Rejections a handler answers with an `ErrorMsg`.

use mug_proto::messages::session::ErrorCode;

/// Sent back to the offending connection as `ErrorMsg { code }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerError {
    pub code: ErrorCode,
}

impl HandlerError {
    fn new(code: ErrorCode) -> Self {
        Self { code }
    }

    pub fn bad_message() -> Self {
        Self::new(ErrorCode::BadMessage)
    }

    pub fn not_identified() -> Self {
        Self::new(ErrorCode::NotIdentified)
    }

    pub fn duplicate_subject() -> Self {
        Self::new(ErrorCode::DuplicateSubject)
    }

    pub fn game_not_found() -> Self {
        Self::new(ErrorCode::GameNotFound)
    }

    pub fn not_in_game() -> Self {
        Self::new(ErrorCode::NotInGame)
    }

    pub fn already_matched() -> Self {
        Self::new(ErrorCode::AlreadyMatched)
    }

    pub fn invalid_state() -> Self {
        Self::new(ErrorCode::InvalidState)
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorCode::RateLimited)
    }

    pub fn unsupported_version() -> Self {
        Self::new(ErrorCode::UnsupportedVersion)
    }
}

pub type HandlerResult = Result<(), HandlerError>;
