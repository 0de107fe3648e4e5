use strum::FromRepr;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum MsgId {
    Hello = 1,
    Welcome = 2,
    Error = 3,

    RequestMatch = 10,
    WaitingForMatch = 11,
    CancelMatch = 12,
    GameMatched = 13,
    ValidationResult = 14,
    GameStarted = 15,
    EpisodeComplete = 16,
    PlayerExcluded = 17,

    ConnectionLost = 20,
    Pause = 21,
    ReconnectionSuccess = 22,
    Resume = 23,
    ReconnectionTimeout = 24,
    GameEnded = 25,

    Signal = 30,
    RelayedSignal = 31,

    Ping = 40,
    Pong = 41,
}
