//! MUG coordination server.
//!
//! Matchmaking, game session lifecycle, reconnection coordination and
//! WebRTC signaling relay for multiplayer experiments. Gameplay traffic
//! flows peer to peer; this server only sees control messages.
//!
//! The network layer feeds [`net::inbound::InboundEvent`]s into
//! [`run_server`], the single owner of all server state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mug_proto::SubjectId;
use mug_proto::packet::Packet;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::game::GameManager;
use crate::matchmaking::MatchLobby;
use crate::net::inbound::{ConnId, InboundEvent, TransportKind};
use crate::net::outbound::{OutboundTx, Outbox};
use crate::net::rate_limit::ConnRateLimiter;
use crate::proto_dispatch::error::HandlerError;
use crate::proto_dispatch::handlers::{
    HandlerContext, build_registry, dispatch_packet, send_error_response,
};
use crate::proto_dispatch::registry::HandlerRegistry;
use crate::research::{MatchLog, TelemetryWriter};

pub mod config;
pub mod game;
pub mod matchmaking;
pub mod net;
pub mod proto_dispatch;
pub mod research;

pub use config::{IdleCleanupConfig, MatchmakerKind, SceneConfig, ServerConfig};

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// How often paused games are checked against their deadline.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Wall-clock milliseconds for telemetry and `Welcome`.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-connection server-side context.
pub(crate) struct ConnCtx {
    pub(crate) outbound: OutboundTx,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) transport: TransportKind,
    /// Assigned on `Hello`; 0 before.
    pub(crate) client_id: u32,
    pub(crate) subject_id: Option<SubjectId>,
    /// None if message rate limiting is disabled.
    pub(crate) rate_limiter: Option<ConnRateLimiter>,
    /// Last time this connection received a message (for idle cleanup).
    pub(crate) last_activity: Instant,
    pub(crate) peer: SocketAddr,
}

/// Matchmaking and game state, owned by the main loop.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) games: GameManager,
    /// Waiting pools by scene id, created on first request.
    pub(crate) lobbies: HashMap<String, MatchLobby>,
    /// Identified participants.
    pub(crate) subjects: HashMap<SubjectId, ConnId>,
    match_log: Option<MatchLog>,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        let match_log = config.data_dir.as_deref().map(MatchLog::new);
        let telemetry = config.data_dir.as_deref().map(TelemetryWriter::new);
        Self {
            config,
            games: GameManager::new(telemetry),
            lobbies: HashMap::new(),
            subjects: HashMap::new(),
            match_log,
        }
    }

    /// The scene's lobby, created with the scene's settings if needed,
    /// together with the game manager it creates sessions in.
    pub(crate) fn lobby_and_games(&mut self, scene_id: &str) -> (&mut MatchLobby, &mut GameManager) {
        let lobby = self.lobbies.entry(scene_id.to_string()).or_insert_with(|| {
            MatchLobby::new(
                scene_id,
                self.config.scene(scene_id).clone(),
                self.match_log.clone(),
            )
        });
        (lobby, &mut self.games)
    }

    /// Scene in which `subject` is waiting, if any.
    pub(crate) fn waiting_scene_of(&self, subject: &SubjectId) -> Option<&str> {
        self.lobbies
            .values()
            .find(|lobby| lobby.is_waiting(subject))
            .map(|lobby| lobby.scene_id())
    }

    /// Take `subject` out of every pool and end its game.
    fn release_subject(&mut self, subject: &SubjectId) -> Outbox {
        let mut outbox = Outbox::new();
        for lobby in self.lobbies.values_mut() {
            if let Some(updates) = lobby.remove(subject) {
                outbox.append(updates);
            }
        }
        if let Some((game_id, shared)) = self.games.game_of(subject) {
            let ended = shared.lock().on_player_disconnected(subject, Instant::now());
            outbox.append(ended);
            self.games.remove_if_ended(&game_id);
        }
        outbox
    }
}

/// Run the server main loop until the inbound channel closes.
pub async fn run_server(
    mut rx: mpsc::Receiver<InboundEvent>,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let registry = build_registry();
    let mut conns: HashMap<ConnId, ConnCtx> = HashMap::new();
    let idle = config.idle_cleanup.clone();
    let mut state = ServerState::new(config);

    let cleanup_interval = idle
        .as_ref()
        .map(|c| c.check_interval)
        .unwrap_or(Duration::from_secs(3600));
    let max_idle = idle
        .as_ref()
        .map(|c| c.max_idle_duration)
        .unwrap_or(Duration::MAX);
    let mut cleanup_timer = tokio::time::interval(cleanup_interval);
    cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_timer = tokio::time::interval(SWEEP_INTERVAL);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(handlers = registry.len(), "Server main loop started");

    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else {
                    break;
                };
                match ev {
                    InboundEvent::Connected {
                        conn_id,
                        peer,
                        transport,
                        outbound,
                        cancel_token,
                    } => {
                        handle_connected(
                            &mut conns,
                            &state,
                            conn_id,
                            peer,
                            transport,
                            outbound,
                            cancel_token,
                        );
                    }
                    InboundEvent::Disconnected { conn_id, peer, reason } => {
                        handle_disconnected(&mut conns, &mut state, conn_id, peer, reason).await;
                    }
                    InboundEvent::Packet { conn_id, peer, packet } => {
                        handle_packet(&registry, &mut conns, &mut state, conn_id, peer, packet).await;
                    }
                }
            }
            _ = sweep_timer.tick() => {
                let outbox = state.games.sweep(Instant::now(), unix_ms());
                outbox.flush().await;
            }
            _ = cleanup_timer.tick(), if idle.is_some() => {
                let now = Instant::now();
                let idle_conns: Vec<(ConnId, SocketAddr)> = conns
                    .iter()
                    .filter(|(_, ctx)| now.duration_since(ctx.last_activity) > max_idle)
                    .map(|(&id, ctx)| (id, ctx.peer))
                    .collect();

                for (conn_id, peer) in idle_conns {
                    info!(conn_id, %peer, "Disconnecting idle connection");
                    handle_disconnected(&mut conns, &mut state, conn_id, peer, "idle timeout".to_string()).await;
                }
            }
        }
    }

    info!("Server main loop stopped");
    Ok(())
}

fn handle_connected(
    conns: &mut HashMap<ConnId, ConnCtx>,
    state: &ServerState,
    conn_id: ConnId,
    peer: SocketAddr,
    transport: TransportKind,
    outbound: OutboundTx,
    cancel_token: CancellationToken,
) {
    conns.insert(
        conn_id,
        ConnCtx {
            outbound,
            cancel_token,
            transport,
            client_id: 0,
            subject_id: None,
            rate_limiter: state.config.rate_limit.as_ref().and_then(ConnRateLimiter::new),
            last_activity: Instant::now(),
            peer,
        },
    );
    debug!(conn_id, %peer, ?transport, "Client connected");
}

async fn handle_disconnected(
    conns: &mut HashMap<ConnId, ConnCtx>,
    state: &mut ServerState,
    conn_id: ConnId,
    peer: SocketAddr,
    reason: String,
) {
    let Some(ctx) = conns.remove(&conn_id) else {
        debug!(conn_id, %peer, %reason, "Connection already released");
        return;
    };
    // Idempotent when the network task already stopped.
    ctx.cancel_token.cancel();

    if let Some(subject) = &ctx.subject_id {
        if state.subjects.get(subject) == Some(&conn_id) {
            state.subjects.remove(subject);
        }
        let outbox = state.release_subject(subject);
        outbox.flush().await;
        info!(conn_id, %peer, %subject, %reason, "Participant disconnected");
    } else {
        info!(conn_id, %peer, %reason, "Client disconnected");
    }
}

async fn handle_packet(
    registry: &HandlerRegistry,
    conns: &mut HashMap<ConnId, ConnCtx>,
    state: &mut ServerState,
    conn_id: ConnId,
    peer: SocketAddr,
    packet: Packet,
) {
    let Some(ctx) = conns.get_mut(&conn_id) else {
        return;
    };

    if let Some(limiter) = &ctx.rate_limiter
        && !limiter.allow()
    {
        warn!(conn_id, %peer, "Connection closed: message rate limit exceeded");
        send_error_response(ctx, HandlerError::rate_limited()).await;
        handle_disconnected(conns, state, conn_id, peer, "rate limited".to_string()).await;
        return;
    }

    ctx.last_activity = Instant::now();

    let mut hctx = HandlerContext {
        conn_id,
        peer,
        conn_ctx: ctx,
        state,
    };
    dispatch_packet(registry, &mut hctx, &packet).await;
}
