//! MUG wire protocol.
//!
//! Shared by the coordination server (`mug-server`) and participant clients
//! (`mug-netplay`). Two kinds of traffic are described here:
//!
//! - framed messages on the always-available relay connection
//!   ([`codec`], [`messages`]), used for matchmaking, session lifecycle,
//!   reconnection coordination and WebRTC signaling relay;
//! - [`messages::peer::PeerMessage`] datagrams carried on the peer-to-peer
//!   data channel (inputs and heartbeats).

pub mod codec;
pub mod constants;
pub mod error;
pub mod header;
pub mod ids;
pub mod limits;
pub mod messages;
pub mod msg_id;
pub mod packet;

pub use ids::{GameId, SubjectId};
