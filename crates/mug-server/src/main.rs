use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use mug_proto::constants::DEFAULT_RECONNECTION_TIMEOUT_MS;
use mug_server::net::rate_limit::{IpRateLimiter, RateLimitConfig};
use mug_server::{IdleCleanupConfig, MatchmakerKind, SceneConfig, ServerConfig, run_server};

const MAX_TRACKED_IPS: usize = 10_000;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatchmakerArg {
    Fifo,
    Latency,
}

/// MUG coordination server
#[derive(Parser, Debug)]
#[command(name = "mug-server")]
#[command(about = "Matchmaking and reconnection coordination server for multiplayer experiments", long_about = None)]
struct Args {
    /// TCP bind address (native framing and WebSocket share the port)
    #[arg(short, long, default_value = "0.0.0.0:5240")]
    bind: String,

    /// Directory for match logs and reconnection telemetry.
    /// Nothing is written when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Participants per game
    #[arg(long, default_value_t = 2)]
    group_size: usize,

    /// Episodes per game
    #[arg(long, default_value_t = 1)]
    num_episodes: u32,

    /// How long a paused game waits for the peer connection to recover
    #[arg(long, default_value_t = DEFAULT_RECONNECTION_TIMEOUT_MS)]
    reconnection_timeout_ms: u64,

    /// Pre-game P2P validation rounds before a group is given up
    #[arg(long, default_value_t = 2)]
    max_validation_attempts: u32,

    /// Matchmaking strategy
    #[arg(long, value_enum, default_value_t = MatchmakerArg::Fifo)]
    matchmaker: MatchmakerArg,

    /// Largest server-RTT difference grouped by the latency matchmaker
    #[arg(long, default_value_t = 100)]
    max_rtt_diff_ms: u32,

    /// Close relay connections silent for this many seconds (0 = never)
    #[arg(long, default_value_t = 120)]
    idle_timeout_secs: u64,

    /// Disable connection and message rate limiting
    #[arg(long, default_value_t = false)]
    no_rate_limit: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let matchmaker = match self.matchmaker {
            MatchmakerArg::Fifo => MatchmakerKind::Fifo,
            MatchmakerArg::Latency => MatchmakerKind::Latency {
                max_rtt_diff_ms: self.max_rtt_diff_ms,
            },
        };
        ServerConfig {
            data_dir: self.data_dir.clone(),
            default_scene: SceneConfig {
                group_size: self.group_size,
                num_episodes: self.num_episodes,
                reconnection_timeout_ms: self.reconnection_timeout_ms,
                max_validation_attempts: self.max_validation_attempts,
                matchmaker,
            },
            scenes: Default::default(),
            rate_limit: (!self.no_rate_limit).then(RateLimitConfig::default),
            idle_cleanup: (self.idle_timeout_secs > 0).then(|| IdleCleanupConfig {
                max_idle_duration: Duration::from_secs(self.idle_timeout_secs),
                ..IdleCleanupConfig::default()
            }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.server_config();
    if config.default_scene.group_size == 0 {
        anyhow::bail!("--group-size must be at least 1");
    }

    // Network layer -> main loop events.
    let (tx, rx) = mpsc::channel(1024);

    let bind_addr: SocketAddr = args.bind.parse()?;
    let ip_limiter = config
        .rate_limit
        .as_ref()
        .map(|c| Arc::new(IpRateLimiter::new(c)));
    if let Some(limiter) = &ip_limiter {
        limiter.spawn_pruner(Duration::from_secs(60), MAX_TRACKED_IPS);
    }
    tokio::spawn(async move {
        if let Err(e) = mug_server::net::tcp::run_tcp_listener(bind_addr, tx, ip_limiter).await {
            tracing::error!(error = %e, "TCP listener stopped");
        }
    });

    info!("MUG server started on {}", args.bind);
    info!(
        group_size = config.default_scene.group_size,
        num_episodes = config.default_scene.num_episodes,
        reconnection_timeout_ms = config.default_scene.reconnection_timeout_ms,
        matchmaker = ?config.default_scene.matchmaker,
        data_dir = ?config.data_dir,
        "Scene defaults"
    );

    run_server(rx, config).await
}
