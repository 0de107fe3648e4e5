//! Reconnection coordination messages.
//!
//! These travel over the relay connection because they are needed exactly
//! when the peer data channel is down.

use serde::{Deserialize, Serialize};

use crate::ids::{GameId, SubjectId};

/// ICE connection state as reported by the peer connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States in which media/data can flow.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Data channel `readyState`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// client→server: the sender's peer connection is lost.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionLost {
    pub game_id: GameId,
    pub player_id: SubjectId,
    pub frame_number: u32,
    pub timestamp_ms: u64,
    pub ice_state: IceConnectionState,
    pub channel_state: DataChannelState,
}

/// server→room: freeze gameplay.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Pause {
    pub game_id: GameId,
    pub pause_frame: u32,
    pub detecting_player: SubjectId,
}

/// client→server: the sender's peer connection is usable again.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconnectionSuccess {
    pub game_id: GameId,
    pub player_id: SubjectId,
    pub restart_attempts: u32,
}

/// server→room: every participant that reported a loss has recovered.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Resume {
    pub game_id: GameId,
}

/// client→server: the local reconnection timeout elapsed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconnectionTimeout {
    pub game_id: GameId,
    pub player_id: SubjectId,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEndReason {
    /// All episodes finished.
    Completed,
    /// The peer connection could not be restored in time.
    ReconnectionTimeout,
    /// A participant dropped its relay connection.
    PartnerDisconnected,
    /// A participant was excluded.
    PartnerExcluded,
    /// Pre-game P2P validation failed too many times.
    ValidationFailed,
}

impl GameEndReason {
    /// Text shown on the participant's end-of-game overlay.
    pub fn message(self) -> &'static str {
        match self {
            Self::Completed => "Game complete",
            Self::ReconnectionTimeout => "Connection could not be restored, game ended",
            Self::PartnerDisconnected => "Your partner disconnected, game ended",
            Self::PartnerExcluded => "Your partner was removed from the game",
            Self::ValidationFailed => "Could not connect to your partner",
        }
    }
}

/// One peer-connection loss as observed by a participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisconnectionEvent {
    pub timestamp_ms: u64,
    pub frame_number: u32,
    pub detecting_player: SubjectId,
    pub ice_state: IceConnectionState,
    pub channel_state: DataChannelState,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionOutcome {
    Recovered,
    TimedOut,
}

/// One pause episode and how it ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionAttempt {
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub outcome: ReconnectionOutcome,
}

/// Reconnection telemetry for one game, exported for research analysis.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectionData {
    pub disconnections: Vec<DisconnectionEvent>,
    pub reconnection_attempts: Vec<ReconnectionAttempt>,
    pub total_pause_duration_ms: u64,
}

/// server→room: the game is over.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameEnded {
    pub game_id: GameId,
    pub reason: GameEndReason,
    pub reconnection_data: ReconnectionData,
}
