//! Messages carried on the peer-to-peer data channel.
//!
//! The channel is unordered with zero retransmits; every message embeds
//! frame numbers so receivers can rebuild ordering themselves.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_INPUT_BACKLOG;
use crate::error::ProtoError;

/// A discrete environment action.
pub type Action = u16;

/// SHA-256 digest of a simulation state.
pub type StateHash = [u8; 32];

/// State hash of a frame simulated with confirmed inputs only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChecksum {
    pub frame: u32,
    pub hash: StateHash,
}

/// The sender's actions for `base_frame..base_frame + actions.len()`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InputPacket {
    pub player_index: u8,
    /// Episode the frames belong to; frame numbers restart every episode.
    pub episode: u32,
    pub base_frame: u32,
    /// Oldest first; the last entry is the newest frame.
    pub actions: Vec<Action>,
    pub checksum: Option<FrameChecksum>,
    /// Newest frame of the recipient's own input the sender holds without
    /// gaps. The recipient stops resending everything up to it.
    pub ack_frame: Option<u32>,
}

impl InputPacket {
    /// Newest frame carried by this packet.
    pub fn last_frame(&self) -> Option<u32> {
        let len = u32::try_from(self.actions.len()).ok()?;
        len.checked_sub(1).map(|n| self.base_frame + n)
    }

    /// `(frame, action)` pairs, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = (u32, Action)> + '_ {
        self.actions
            .iter()
            .enumerate()
            .map(|(i, a)| (self.base_frame + i as u32, *a))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Input(InputPacket),
    /// Sent while paused or idle so liveness is observable.
    Heartbeat { frame: u32 },
}

impl PeerMessage {
    pub(crate) fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::Input(p) => {
                if p.actions.is_empty() {
                    return Err(ProtoError::InvalidPayload("input packet without actions"));
                }
                if p.actions.len() > MAX_INPUT_BACKLOG {
                    return Err(ProtoError::InvalidPayload("input packet backlog too large"));
                }
                if p.base_frame.checked_add(p.actions.len() as u32).is_none() {
                    return Err(ProtoError::InvalidPayload("input packet frame overflow"));
                }
                Ok(())
            }
            Self::Heartbeat { .. } => Ok(()),
        }
    }
}
