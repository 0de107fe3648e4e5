//! WebRTC signaling relay. Payloads are opaque to the server.

use serde::{Deserialize, Serialize};

use crate::ids::{GameId, SubjectId};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer {
        sdp: String,
        ice_restart: bool,
        /// Negotiation generation chosen by the offerer.
        generation: u32,
    },
    Answer {
        sdp: String,
        generation: u32,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        generation: u32,
    },
}

impl SignalPayload {
    pub fn generation(&self) -> u32 {
        match self {
            Self::Offer { generation, .. }
            | Self::Answer { generation, .. }
            | Self::IceCandidate { generation, .. } => *generation,
        }
    }
}

/// client→server: relay `payload` to the other participants of `game_id`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Signal {
    pub game_id: GameId,
    pub payload: SignalPayload,
}

/// server→client: signaling payload from another participant.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayedSignal {
    pub game_id: GameId,
    pub from_player: SubjectId,
    pub payload: SignalPayload,
}
