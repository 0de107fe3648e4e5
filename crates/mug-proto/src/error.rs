use thiserror::Error;

use crate::msg_id::MsgId;

/// Wire-level decode and encode failures.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("not a MUG frame (magic {0:02x?})")]
    BadMagic([u8; 2]),

    #[error("protocol version {0} is not supported")]
    UnsupportedVersion(u8),

    #[error("truncated frame: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("header declares {declared} payload bytes, frame holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} byte payload exceeds the limit for its message")]
    PayloadTooLarge(usize),

    #[error("{0} byte frame exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("unknown message id {0}")]
    UnknownMsgId(u8),

    /// A well-formed message arrived where another kind was expected.
    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedMsgId { expected: MsgId, got: MsgId },

    /// Decoded fine but violates a protocol rule.
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}
