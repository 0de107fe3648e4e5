//! Participant side of the session lifecycle.
//!
//! Reacts to server coordination messages and to transport events, keeps
//! the explicit [`ClientPhase`], drives the connection overlay and queues
//! messages for the server. Sans-IO: the caller delivers inputs and drains
//! [`SessionClient::poll_command`].
//!
//! Once [`SessionClient::exit_scene`] has run, nothing may touch the
//! overlay again; every handler that can show it checks the flag first.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mug_proto::{
    GameId, SubjectId,
    messages::{
        matchmaking::{EpisodeComplete, GameMatched, PlayerExcluded, ValidationResult},
        reconnect::{ConnectionLost, GameEndReason, ReconnectionSuccess, ReconnectionTimeout},
    },
};
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, ServerMessage};
use crate::error::NetplayError;
use crate::timer::TimerSet;
use crate::transport::TransportEvent;

/// How long the pre-game P2P check may take.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    ConnectionLost,
    GameEnded(GameEndReason),
}

impl Overlay {
    pub fn text(self) -> &'static str {
        match self {
            Self::ConnectionLost => "Connection Lost / Reconnecting...",
            Self::GameEnded(reason) => reason.message(),
        }
    }
}

/// Full-viewport overlay shown to the participant.
pub trait OverlayView {
    fn show(&mut self, overlay: Overlay);
    fn hide(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Lobby,
    Matched,
    Validating,
    Playing,
    Paused { pause_frame: u32 },
    Ended(GameEndReason),
    Exited,
}

/// What the server told this participant about its game.
#[derive(Debug, Clone)]
pub struct MatchInfo {
    pub game_id: GameId,
    pub players: Vec<SubjectId>,
    pub player_index: u8,
    pub host_id: SubjectId,
    pub initiator: bool,
    pub reconnection_timeout: Duration,
    pub num_episodes: u32,
    pub seed: u64,
    pub validation_attempt: u32,
}

impl From<&GameMatched> for MatchInfo {
    fn from(m: &GameMatched) -> Self {
        Self {
            game_id: m.game_id.clone(),
            players: m.players.clone(),
            player_index: m.player_index,
            host_id: m.host_id.clone(),
            initiator: m.initiator,
            reconnection_timeout: Duration::from_millis(m.reconnection_timeout_ms),
            num_episodes: m.num_episodes,
            seed: m.seed,
            validation_attempt: m.validation_attempt,
        }
    }
}

/// Message for the server.
#[derive(Debug, Clone)]
pub enum Outgoing {
    ValidationResult(ValidationResult),
    EpisodeComplete(EpisodeComplete),
    PlayerExcluded(PlayerExcluded),
    ConnectionLost(ConnectionLost),
    ReconnectionSuccess(ReconnectionSuccess),
    ReconnectionTimeout(ReconnectionTimeout),
}

impl Outgoing {
    pub async fn send(&self, handle: &ClientHandle) -> Result<(), NetplayError> {
        match self {
            Self::ValidationResult(m) => handle.send_message(m).await,
            Self::EpisodeComplete(m) => handle.send_message(m).await,
            Self::PlayerExcluded(m) => handle.send_message(m).await,
            Self::ConnectionLost(m) => handle.send_message(m).await,
            Self::ReconnectionSuccess(m) => handle.send_message(m).await,
            Self::ReconnectionTimeout(m) => handle.send_message(m).await,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientCommand {
    Send(Outgoing),
    /// Tear down the peer transport.
    CloseTransport,
    /// The partner lost the link; as initiator, offer an ICE restart.
    RestartIce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ClientTimer {
    ReconnectionTimeout,
    Validation,
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

pub struct SessionClient<V: OverlayView> {
    subject_id: SubjectId,
    phase: ClientPhase,
    game: Option<MatchInfo>,
    overlay: V,
    timers: TimerSet<ClientTimer>,
    commands: VecDeque<ClientCommand>,
    scene_exited: bool,
    frame: u32,
    episodes_completed: u32,
}

impl<V: OverlayView> SessionClient<V> {
    pub fn new(subject_id: impl Into<SubjectId>, overlay: V) -> Self {
        Self {
            subject_id: subject_id.into(),
            phase: ClientPhase::Lobby,
            game: None,
            overlay,
            timers: TimerSet::new(),
            commands: VecDeque::new(),
            scene_exited: false,
            frame: 0,
            episodes_completed: 0,
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn match_info(&self) -> Option<&MatchInfo> {
        self.game.as_ref()
    }

    pub fn is_scene_exited(&self) -> bool {
        self.scene_exited
    }

    pub fn overlay(&self) -> &V {
        &self.overlay
    }

    pub fn episodes_completed(&self) -> u32 {
        self.episodes_completed
    }

    /// Latest simulated frame, reported with connection loss.
    pub fn set_frame(&mut self, frame: u32) {
        self.frame = frame;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn poll_command(&mut self) -> Option<ClientCommand> {
        self.commands.pop_front()
    }

    fn send(&mut self, msg: Outgoing) {
        self.commands.push_back(ClientCommand::Send(msg));
    }

    fn is_current_game(&self, game_id: &GameId) -> bool {
        self.game.as_ref().is_some_and(|g| &g.game_id == game_id)
    }

    pub fn on_server_message(&mut self, msg: &ServerMessage, now: Instant) {
        match msg {
            ServerMessage::GameMatched(m) => self.on_game_matched(m),
            ServerMessage::GameStarted(m) => {
                if self.scene_exited || !self.is_current_game(&m.game_id) {
                    return;
                }
                if matches!(self.phase, ClientPhase::Matched | ClientPhase::Validating) {
                    self.timers.cancel(ClientTimer::Validation);
                    self.phase = ClientPhase::Playing;
                    info!(game_id = %m.game_id, "Game started");
                }
            }
            ServerMessage::Pause(p) => {
                if self.scene_exited || !self.is_current_game(&p.game_id) {
                    return;
                }
                match self.phase {
                    ClientPhase::Playing => {
                        info!(
                            game_id = %p.game_id,
                            pause_frame = p.pause_frame,
                            detecting = %p.detecting_player,
                            "Paused by server"
                        );
                        self.phase = ClientPhase::Paused {
                            pause_frame: p.pause_frame,
                        };
                        self.overlay.show(Overlay::ConnectionLost);
                        self.start_reconnection_timeout(now);
                        let initiator = self.game.as_ref().is_some_and(|g| g.initiator);
                        if initiator && p.detecting_player != self.subject_id {
                            self.commands.push_back(ClientCommand::RestartIce);
                        }
                    }
                    ClientPhase::Paused { .. } => debug!("Redundant pause ignored"),
                    other => debug!(phase = ?other, "Pause outside gameplay ignored"),
                }
            }
            ServerMessage::Resume(r) => {
                self.timers.cancel(ClientTimer::ReconnectionTimeout);
                if self.scene_exited || !self.is_current_game(&r.game_id) {
                    return;
                }
                if let ClientPhase::Paused { pause_frame } = self.phase {
                    info!(game_id = %r.game_id, pause_frame, "Resumed");
                    self.phase = ClientPhase::Playing;
                    self.overlay.hide();
                }
            }
            ServerMessage::GameEnded(e) => {
                if self.scene_exited {
                    debug!(game_id = %e.game_id, "Game ended after scene exit, ignoring");
                    return;
                }
                if !self.is_current_game(&e.game_id) {
                    return;
                }
                self.timers.cancel_all();
                if matches!(self.phase, ClientPhase::Ended(_)) {
                    return;
                }
                info!(game_id = %e.game_id, reason = ?e.reason, "Game ended");
                self.phase = ClientPhase::Ended(e.reason);
                self.overlay.show(Overlay::GameEnded(e.reason));
                self.commands.push_back(ClientCommand::CloseTransport);
            }
            ServerMessage::Error(err) => warn!(code = ?err.code, "Server reported error"),
            ServerMessage::Welcome(_)
            | ServerMessage::WaitingForMatch(_)
            | ServerMessage::RelayedSignal(_)
            | ServerMessage::Pong(_) => {}
        }
    }

    fn on_game_matched(&mut self, m: &GameMatched) {
        if self.scene_exited {
            return;
        }
        match self.phase {
            ClientPhase::Lobby | ClientPhase::Validating | ClientPhase::Ended(_) => {
                info!(
                    game_id = %m.game_id,
                    slot = m.player_index,
                    initiator = m.initiator,
                    "Matched"
                );
                self.timers.cancel_all();
                self.game = Some(MatchInfo::from(m));
                self.phase = ClientPhase::Matched;
                self.episodes_completed = 0;
                self.frame = 0;
            }
            other => warn!(phase = ?other, game_id = %m.game_id, "Unexpected match ignored"),
        }
    }

    /// The peer transport for the match exists; start the connectivity check.
    pub fn begin_validation(&mut self, now: Instant) {
        if self.phase == ClientPhase::Matched {
            self.phase = ClientPhase::Validating;
            self.timers
                .arm(ClientTimer::Validation, now + VALIDATION_TIMEOUT);
        }
    }

    /// The data channel opened during validation.
    pub fn on_link_ready(&mut self) {
        if self.phase == ClientPhase::Validating && self.timers.cancel(ClientTimer::Validation) {
            self.report_validation(true);
        }
    }

    fn report_validation(&mut self, ok: bool) {
        let Some(game) = &self.game else {
            return;
        };
        let game_id = game.game_id.clone();
        let attempt = game.validation_attempt;
        info!(game_id = %game_id, attempt, ok, "Validation result");
        self.send(Outgoing::ValidationResult(ValidationResult {
            game_id,
            attempt,
            ok,
        }));
    }

    /// Arm the local reconnection timeout, replacing any pending one.
    pub fn start_reconnection_timeout(&mut self, now: Instant) {
        let timeout = self
            .game
            .as_ref()
            .map_or(Duration::from_millis(mug_proto::constants::DEFAULT_RECONNECTION_TIMEOUT_MS), |g| {
                g.reconnection_timeout
            });
        self.timers
            .arm(ClientTimer::ReconnectionTimeout, now + timeout);
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    pub fn on_transport_event(&mut self, event: &TransportEvent) {
        if self.scene_exited {
            return;
        }
        if !matches!(self.phase, ClientPhase::Playing | ClientPhase::Paused { .. }) {
            debug!(phase = ?self.phase, ?event, "Transport event outside gameplay");
            return;
        }
        let Some(game) = &self.game else {
            return;
        };
        let game_id = game.game_id.clone();
        let player_id = self.subject_id.clone();

        match event {
            TransportEvent::ConnectionLost(info) => {
                self.send(Outgoing::ConnectionLost(ConnectionLost {
                    game_id,
                    player_id,
                    frame_number: self.frame,
                    timestamp_ms: unix_ms(),
                    ice_state: info.ice_state,
                    channel_state: info.channel_state,
                }));
            }
            TransportEvent::ConnectionRestored { restart_attempts } => {
                self.send(Outgoing::ReconnectionSuccess(ReconnectionSuccess {
                    game_id,
                    player_id,
                    restart_attempts: *restart_attempts,
                }));
            }
            TransportEvent::RestartsExhausted { attempts } => {
                warn!(attempts, "Recovery exhausted, reporting timeout");
                self.timers.cancel(ClientTimer::ReconnectionTimeout);
                self.send(Outgoing::ReconnectionTimeout(ReconnectionTimeout {
                    game_id,
                    player_id,
                }));
            }
        }
    }

    /// Fire expired timers.
    pub fn poll(&mut self, now: Instant) {
        for timer in self.timers.poll_expired(now) {
            if self.scene_exited {
                return;
            }
            match timer {
                ClientTimer::ReconnectionTimeout => {
                    if !matches!(self.phase, ClientPhase::Paused { .. }) {
                        continue;
                    }
                    let Some(game) = &self.game else { continue };
                    warn!(game_id = %game.game_id, "Reconnection timeout elapsed");
                    let msg = ReconnectionTimeout {
                        game_id: game.game_id.clone(),
                        player_id: self.subject_id.clone(),
                    };
                    self.send(Outgoing::ReconnectionTimeout(msg));
                }
                ClientTimer::Validation => {
                    if self.phase == ClientPhase::Validating {
                        warn!("Peer connection did not open in time");
                        self.report_validation(false);
                    }
                }
            }
        }
    }

    /// An episode finished locally.
    pub fn complete_episode(&mut self, frame_number: u32) {
        if self.scene_exited || self.phase != ClientPhase::Playing {
            return;
        }
        let Some(game) = &self.game else { return };
        self.episodes_completed += 1;
        let msg = EpisodeComplete {
            game_id: game.game_id.clone(),
            episode: self.episodes_completed,
            frame_number,
        };
        self.send(Outgoing::EpisodeComplete(msg));
    }

    /// Report a participant as excluded from the game.
    pub fn report_exclusion(&mut self, player_id: SubjectId, reason: impl Into<String>) {
        if self.scene_exited {
            return;
        }
        let Some(game) = &self.game else { return };
        let msg = PlayerExcluded {
            game_id: game.game_id.clone(),
            player_id,
            reason: reason.into(),
        };
        self.send(Outgoing::PlayerExcluded(msg));
    }

    /// Leave the game scene. The exited flag is set before the transport is
    /// torn down so late notifications can no longer reach the overlay.
    pub fn exit_scene(&mut self) {
        if self.scene_exited {
            return;
        }
        self.scene_exited = true;
        self.timers.cancel_all();
        self.commands.clear();
        self.commands.push_back(ClientCommand::CloseTransport);
        self.phase = ClientPhase::Exited;
        info!(subject_id = %self.subject_id, "Scene exited");
    }
}
