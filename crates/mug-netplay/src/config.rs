use std::time::Duration;

use mug_proto::constants::{DEFAULT_INPUT_REDUNDANCY, DEFAULT_RECONNECTION_TIMEOUT_MS};

/// Participant-side tuning.
///
/// Grace period and restart budget are empirical; treat them as knobs.
#[derive(Debug, Clone)]
pub struct NetplayConfig {
    /// How long an ICE `disconnected` state may last before it counts as a loss.
    pub grace_period: Duration,
    /// ICE restarts attempted before giving up.
    pub max_ice_restarts: u32,
    /// How long one ICE restart may take before the next attempt.
    pub ice_restart_timeout: Duration,
    /// Pause length before the participant reports a reconnection timeout.
    /// Overridden by the value the server sends with the match.
    pub reconnection_timeout: Duration,
    /// Actions per outbound input packet (current frame + previous).
    pub input_redundancy: usize,
    /// Save a snapshot every N frames.
    pub snapshot_interval: u32,
    /// Number of snapshots kept.
    pub snapshot_capacity: usize,
    /// Exchange a confirmed-state checksum every N frames.
    pub hash_interval: u32,
    /// Frames of input history kept for rollback.
    pub max_rollback_frames: u32,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(3000),
            max_ice_restarts: 3,
            ice_restart_timeout: Duration::from_millis(5000),
            reconnection_timeout: Duration::from_millis(DEFAULT_RECONNECTION_TIMEOUT_MS),
            input_redundancy: DEFAULT_INPUT_REDUNDANCY,
            snapshot_interval: 5,
            snapshot_capacity: 24,
            hash_interval: 10,
            max_rollback_frames: 120,
        }
    }
}
