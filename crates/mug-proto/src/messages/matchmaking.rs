//! Matchmaking and game lifecycle messages.

use serde::{Deserialize, Serialize};

use crate::ids::{GameId, SubjectId};

/// Participant asks to be matched in a scene.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestMatch {
    pub scene_id: String,
    /// Round-trip time to the server measured by the client, if known.
    pub rtt_ms: Option<u32>,
}

/// Participant is in the waiting pool.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WaitingForMatch {
    pub scene_id: String,
    /// Number of participants currently waiting in the scene, including the receiver.
    pub waiting: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CancelMatch {
    pub scene_id: String,
}

/// A group was formed; sent to every member individually.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameMatched {
    pub game_id: GameId,
    /// Participants in slot order.
    pub players: Vec<SubjectId>,
    /// Receiver's slot in `players`.
    pub player_index: u8,
    pub host_id: SubjectId,
    /// True for the single peer that creates WebRTC offers (avoids glare).
    pub initiator: bool,
    pub reconnection_timeout_ms: u64,
    pub num_episodes: u32,
    /// Shared environment seed.
    pub seed: u64,
    /// P2P validation round this match belongs to, starting at 1.
    pub validation_attempt: u32,
}

/// Outcome of the pre-game P2P connectivity check.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ValidationResult {
    pub game_id: GameId,
    /// Round from the `GameMatched` being answered; stale rounds are ignored.
    pub attempt: u32,
    pub ok: bool,
}

/// Every participant validated; gameplay may begin.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameStarted {
    pub game_id: GameId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EpisodeComplete {
    pub game_id: GameId,
    /// 1-based number of the episode that just finished.
    pub episode: u32,
    pub frame_number: u32,
}

/// A participant was excluded (inactivity, failed attention check, etc.).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlayerExcluded {
    pub game_id: GameId,
    pub player_id: SubjectId,
    pub reason: String,
}
