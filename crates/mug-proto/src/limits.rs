//! Size limits shared by the relay server and participants.

use crate::constants::HEADER_LEN;
use crate::msg_id::MsgId;

/// Ceiling on the payload of a relay message, by what it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Handshake, matchmaking, lifecycle, reconnection, keepalive.
    Control,
    /// Opaque SDP and ICE blobs. An offer with many gathered candidates
    /// easily outgrows the control limit.
    Signal,
}

impl SizeClass {
    pub const fn of(msg_id: MsgId) -> Self {
        match msg_id {
            MsgId::Signal | MsgId::RelayedSignal => Self::Signal,
            _ => Self::Control,
        }
    }

    pub const fn max_payload(self) -> usize {
        match self {
            Self::Control => 4 * 1024,
            Self::Signal => 64 * 1024,
        }
    }
}

pub const fn max_payload_for(msg_id: MsgId) -> usize {
    SizeClass::of(msg_id).max_payload()
}

/// Largest relay frame, header included.
pub const MAX_TCP_FRAME: usize = HEADER_LEN + SizeClass::Signal.max_payload();

/// Unconsumed bytes a connection may hold before it is dropped.
pub const TCP_RX_BUFFER_SIZE: usize = MAX_TCP_FRAME + 16 * 1024;

/// Largest data channel message; stays under the SCTP size browsers accept
/// unfragmented.
pub const MAX_PEER_MESSAGE: usize = 1200;
