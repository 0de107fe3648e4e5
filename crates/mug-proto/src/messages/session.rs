//! Connection handshake and error replies.

use serde::{Deserialize, Serialize};

use crate::ids::SubjectId;

/// First message on a relay connection. Binds the connection to a subject.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Hello {
    pub subject_id: SubjectId,
    pub proto_version: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Welcome {
    pub client_id: u32,
    /// Server wall clock, for lining up participant logs afterwards.
    pub server_time_ms: u64,
}

/// Why the server rejected a message. The connection stays open unless
/// the code says otherwise.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Frame decoded but its payload did not.
    BadMessage = 1,
    /// No `Hello` on this connection yet, or a second one.
    NotIdentified = 2,
    DuplicateSubject = 3,
    GameNotFound = 4,
    /// The game exists but the sender does not play in it.
    NotInGame = 5,
    /// Already waiting for a match or in a game.
    AlreadyMatched = 6,
    /// Valid message arriving in the wrong game phase.
    InvalidState = 7,
    /// Message budget exhausted; the connection is closed.
    RateLimited = 8,
    /// `Hello` carried another protocol version; the connection is closed.
    UnsupportedVersion = 9,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ErrorMsg {
    pub code: ErrorCode,
}
