//! Netplay error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetplayError {
    #[error("not connected to server")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] mug_proto::error::ProtoError),

    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    #[error("no snapshot at or before frame {0}")]
    SnapshotMissing(u32),

    #[error("step worker is gone")]
    WorkerGone,

    #[error("step worker did not answer {op} in time")]
    WorkerTimeout { op: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error")]
    ChannelSend,
}

/// Failures of the environment contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("state blob rejected: {0}")]
    BadState(String),

    #[error("expected {expected} actions, got {got}")]
    ActionCount { expected: usize, got: usize },
}

/// Failures reported by a peer link binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("peer connection closed")]
    Closed,

    #[error("data channel not open")]
    ChannelNotOpen,

    #[error("negotiation failed: {0}")]
    Negotiation(String),
}
