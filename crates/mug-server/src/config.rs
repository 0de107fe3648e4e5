//! Server and per-scene configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use mug_proto::constants::DEFAULT_RECONNECTION_TIMEOUT_MS;

use crate::matchmaking::{FifoMatchmaker, LatencyMatchmaker, Matchmaker};
use crate::net::rate_limit::RateLimitConfig;

/// Which matchmaking strategy a scene uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchmakerKind {
    Fifo,
    /// Only group participants whose server RTTs differ by at most
    /// `max_rtt_diff_ms`.
    Latency { max_rtt_diff_ms: u32 },
}

impl MatchmakerKind {
    pub fn build(self) -> Box<dyn Matchmaker> {
        match self {
            Self::Fifo => Box::new(FifoMatchmaker),
            Self::Latency { max_rtt_diff_ms } => Box::new(LatencyMatchmaker::new(max_rtt_diff_ms)),
        }
    }
}

/// Researcher-facing settings of one experiment scene.
#[derive(Debug, Clone)]
pub struct SceneConfig {
    /// Participants per game.
    pub group_size: usize,
    pub num_episodes: u32,
    /// How long a paused game waits for the peer connection to recover.
    pub reconnection_timeout_ms: u64,
    /// Pre-game P2P validation rounds before the game is abandoned.
    pub max_validation_attempts: u32,
    pub matchmaker: MatchmakerKind,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            group_size: 2,
            num_episodes: 1,
            reconnection_timeout_ms: DEFAULT_RECONNECTION_TIMEOUT_MS,
            max_validation_attempts: 2,
            matchmaker: MatchmakerKind::Fifo,
        }
    }
}

/// Configuration for closing inactive relay connections.
#[derive(Debug, Clone)]
pub struct IdleCleanupConfig {
    /// How often to look for idle connections.
    pub check_interval: Duration,
    /// Maximum time without a message before a connection is closed.
    pub max_idle_duration: Duration,
}

impl Default for IdleCleanupConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            max_idle_duration: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Root of research data output (match logs, reconnection telemetry).
    /// Nothing is written when unset.
    pub data_dir: Option<PathBuf>,
    /// Settings for scenes without an explicit entry in `scenes`.
    pub default_scene: SceneConfig,
    pub scenes: HashMap<String, SceneConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub idle_cleanup: Option<IdleCleanupConfig>,
}

impl ServerConfig {
    pub fn scene(&self, scene_id: &str) -> &SceneConfig {
        self.scenes.get(scene_id).unwrap_or(&self.default_scene)
    }
}
