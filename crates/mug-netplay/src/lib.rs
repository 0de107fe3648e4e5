//! MUG participant netplay.
//!
//! Rollback netcode and peer-connection recovery for one participant of a
//! multiplayer experiment.
//!
//! # Architecture
//!
//! - [`transport`]: Peer link health, ICE restarts and loss/restore events
//! - [`input_channel`]: Acknowledged, redundant input packets over the unordered data channel
//! - [`sync`]: Input history, snapshot ring and the rollback session
//! - [`worker`]: Dedicated simulation thread driven by batched operations
//! - [`session_client`]: Server-coordinated lifecycle (validation, pause, resume, end)
//! - [`client`]: Async TCP client for the relay server
//! - [`driver`]: Async participant loop tying the above together
//! - [`error`]: Error types

pub mod client;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod input_channel;
pub mod session_client;
pub mod sync;
pub mod timer;
pub mod transport;
pub mod worker;

pub use client::{ClientEvent, ClientHandle, ServerMessage, connect};
pub use config::NetplayConfig;
pub use driver::{
    GameHost, LinkEvent, LinkFactory, ParticipantOptions, ParticipantSummary, run_participant,
};
pub use env::{Environment, RngState, StepOutcome, decode_state, encode_state};
pub use error::{EnvError, LinkError, NetplayError};
pub use session_client::{ClientPhase, MatchInfo, Overlay, OverlayView, SessionClient};
pub use sync::{RollbackSession, RollbackStats};
pub use transport::{
    ConnectionQuality, IceCandidate, LinkHealth, PeerLink, PeerRole, TransportEvent,
    TransportManager,
};
