//! Relay connection pings. Participants use them to measure their RTT to
//! the server before asking for a match.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Echoed back so replies can be matched to pings.
    pub nonce: u32,
    pub client_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u32,
    pub client_ms: u64,
    /// Server wall clock when the ping was answered.
    pub server_ms: u64,
}
