//! Grouping waiting participants into games.
//!
//! A [`Matchmaker`] only decides who plays together. The per-scene
//! [`lobby::MatchLobby`] owns the waiting pool and is the single place that
//! asks the matchmaker and creates game sessions.

use mug_proto::SubjectId;

pub mod fifo;
pub mod latency;
pub mod lobby;

pub use fifo::FifoMatchmaker;
pub use latency::LatencyMatchmaker;
pub use lobby::{MatchLobby, MatchOutcome};

/// What a matchmaker knows about a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    pub subject_id: SubjectId,
    /// Round-trip time to the server, when the client measured one.
    pub rtt_ms: Option<u32>,
}

pub trait Matchmaker: Send {
    /// Pick a group for `arriving` from `waiting` (arrival order).
    ///
    /// Returns the group in slot order, including `arriving`, with exactly
    /// `group_size` members; `None` leaves `arriving` in the pool.
    fn find_match(
        &mut self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>>;

    fn name(&self) -> &'static str;
}
