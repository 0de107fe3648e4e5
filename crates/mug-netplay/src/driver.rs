//! Async participant.
//!
//! Owns the relay connection, the peer transport, the [`SessionClient`] and
//! the [`RollbackSession`] of one participant and runs them from a single
//! task. Environment, action source and peer link binding are supplied by
//! the embedding application.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use mug_proto::{
    GameId, SubjectId,
    codec::decode_peer,
    constants::VERSION,
    messages::{
        keepalive::Ping,
        matchmaking::RequestMatch,
        peer::{Action, PeerMessage},
        reconnect::{DataChannelState, GameEnded, IceConnectionState},
        session::Hello,
        signaling::Signal,
    },
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::client::{self, ClientEvent, ClientHandle, ServerMessage};
use crate::config::NetplayConfig;
use crate::env::Environment;
use crate::error::{LinkError, NetplayError};
use crate::session_client::{ClientCommand, ClientPhase, MatchInfo, OverlayView, SessionClient};
use crate::sync::{DesyncEvent, RollbackSession, RollbackStats};
use crate::transport::{
    IceCandidate, LinkHealth, PeerLink, PeerRole, TransportEvent, TransportManager,
};

/// Transitions reported by a peer link binding.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    IceState(IceConnectionState),
    ChannelState(DataChannelState),
    LocalCandidate(IceCandidate),
    Message(Bytes),
}

/// Creates the peer link for a match.
pub trait LinkFactory: Send {
    type Link: PeerLink;

    fn create(
        &mut self,
        info: &MatchInfo,
    ) -> Result<(Self::Link, mpsc::Receiver<LinkEvent>), LinkError>;
}

/// The game side of a participant.
pub trait GameHost: Send {
    type Env: Environment;

    fn create_env(&mut self, info: &MatchInfo) -> Self::Env;

    /// Local action for `frame`.
    fn local_action(&mut self, frame: u32) -> Action;

    /// Called with the final observation of each tick. Replayed frames are
    /// never rendered.
    fn render(&mut self, _frame: u32, _observation: &<Self::Env as Environment>::Observation) {}
}

#[derive(Debug, Clone)]
pub struct ParticipantOptions {
    pub server: SocketAddr,
    pub subject_id: SubjectId,
    pub scene_id: String,
    pub rtt_ms: Option<u32>,
    pub frame_interval: Duration,
    pub netplay: NetplayConfig,
}

/// How a participant's game ended.
#[derive(Debug, Clone)]
pub struct ParticipantSummary {
    pub game_id: Option<GameId>,
    pub phase: ClientPhase,
    pub game_ended: Option<GameEnded>,
    pub stats: Option<RollbackStats>,
    pub desyncs: Vec<DesyncEvent>,
    pub confirmed_checksums: Vec<mug_proto::messages::peer::FrameChecksum>,
}

struct Participant<F: LinkFactory, H: GameHost, V: OverlayView> {
    opts: ParticipantOptions,
    handle: ClientHandle,
    links: F,
    host: H,
    session: SessionClient<V>,
    transport: Option<TransportManager<F::Link>>,
    transport_events: Option<broadcast::Receiver<TransportEvent>>,
    rollback: Option<RollbackSession<H::Env>>,
    /// Every episode played; waiting for the server to end the game.
    finished: bool,
    game_ended: Option<GameEnded>,
}

async fn recv_link(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

const RTT_PINGS: u32 = 3;
const RTT_PING_TIMEOUT: Duration = Duration::from_secs(2);

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Round trip to the relay, best of [`RTT_PINGS`] pings. Runs before
/// `Hello`, so nothing but pongs is expected back.
async fn measure_rtt(
    handle: &ClientHandle,
    events: &mut mpsc::Receiver<ClientEvent>,
) -> Result<Option<u32>, NetplayError> {
    let mut best: Option<u32> = None;
    for nonce in 0..RTT_PINGS {
        let sent = Instant::now();
        handle
            .send_message(&Ping {
                nonce,
                client_ms: unix_ms(),
            })
            .await?;
        let pong = tokio::time::timeout(RTT_PING_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Some(ClientEvent::Packet(packet)) => match ServerMessage::decode(&packet) {
                        Ok(ServerMessage::Pong(pong)) if pong.nonce == nonce => return Ok(()),
                        Ok(other) => debug!(?other, "Ignoring message during RTT measurement"),
                        Err(e) => warn!(error = %e, "Undecodable server message"),
                    },
                    Some(ClientEvent::Connected) => {}
                    Some(ClientEvent::Error(e)) => warn!(error = %e, "Relay connection error"),
                    Some(ClientEvent::Disconnected { reason }) => {
                        return Err(NetplayError::ConnectionFailed(reason));
                    }
                    None => return Err(NetplayError::NotConnected),
                }
            }
        })
        .await;
        match pong {
            Ok(res) => {
                res?;
                let rtt = sent.elapsed().as_millis() as u32;
                trace!(nonce, rtt, "RTT ping");
                best = Some(best.map_or(rtt, |b| b.min(rtt)));
            }
            Err(_) => {
                warn!(nonce, "RTT ping timed out");
                break;
            }
        }
    }
    info!(rtt_ms = ?best, "Measured relay round trip");
    Ok(best)
}

/// Connect, request a match and play until the game ends.
pub async fn run_participant<F, H, V>(
    opts: ParticipantOptions,
    links: F,
    host: H,
    overlay: V,
) -> Result<ParticipantSummary, NetplayError>
where
    F: LinkFactory,
    H: GameHost,
    V: OverlayView,
{
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let handle = client::connect(opts.server, event_tx).await?;

    let rtt_ms = match opts.rtt_ms {
        Some(rtt) => Some(rtt),
        None => measure_rtt(&handle, &mut event_rx).await?,
    };

    handle
        .send_message(&Hello {
            subject_id: opts.subject_id.clone(),
            proto_version: VERSION,
        })
        .await?;
    handle
        .send_message(&RequestMatch {
            scene_id: opts.scene_id.clone(),
            rtt_ms,
        })
        .await?;

    let mut tick = tokio::time::interval(opts.frame_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let session = SessionClient::new(opts.subject_id.clone(), overlay);
    let mut p = Participant {
        opts,
        handle,
        links,
        host,
        session,
        transport: None,
        transport_events: None,
        rollback: None,
        finished: false,
        game_ended: None,
    };
    let mut link_rx: Option<mpsc::Receiver<LinkEvent>> = None;

    loop {
        let deadline = p.next_deadline();
        let playing = p.session.phase() == ClientPhase::Playing;

        tokio::select! {
            ev = event_rx.recv() => match ev {
                Some(ClientEvent::Packet(packet)) => {
                    let msg = match ServerMessage::decode(&packet) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "Undecodable server message");
                            continue;
                        }
                    };
                    if let Some(rx) = p.on_server_message(msg).await? {
                        link_rx = Some(rx);
                    }
                }
                Some(ClientEvent::Connected) => debug!("Relay connection established"),
                Some(ClientEvent::Error(e)) => warn!(error = %e, "Relay connection error"),
                Some(ClientEvent::Disconnected { reason }) => {
                    p.close_transport();
                    return Err(NetplayError::ConnectionFailed(reason));
                }
                None => return Err(NetplayError::NotConnected),
            },
            Some(ev) = recv_link(&mut link_rx) => p.on_link_event(ev),
            _ = tick.tick(), if playing => p.on_tick().await?,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                p.poll_timers();
            }
        }

        p.pump().await?;

        if matches!(p.session.phase(), ClientPhase::Ended(_) | ClientPhase::Exited) {
            break;
        }
    }

    p.close_transport();
    let _ = p.handle.disconnect().await;
    Ok(p.summary())
}

impl<F: LinkFactory, H: GameHost, V: OverlayView> Participant<F, H, V> {
    fn next_deadline(&self) -> Option<Instant> {
        let session = self.session.next_deadline();
        let transport = self.transport.as_ref().and_then(|t| t.next_deadline());
        session
            .into_iter()
            .chain(transport)
            .min()
            .map(Instant::from_std)
    }

    fn poll_timers(&mut self) {
        let now = Instant::now().into_std();
        if let Some(t) = &mut self.transport {
            t.poll(now);
        }
        self.session.poll(now);
    }

    fn close_transport(&mut self) {
        if let Some(t) = &mut self.transport {
            t.close();
        }
    }

    async fn on_server_message(
        &mut self,
        msg: ServerMessage,
    ) -> Result<Option<mpsc::Receiver<LinkEvent>>, NetplayError> {
        let now = Instant::now().into_std();
        match &msg {
            ServerMessage::RelayedSignal(sig) => {
                if let Some(t) = &mut self.transport {
                    t.on_remote_signal(sig.payload.clone(), now);
                }
                return Ok(None);
            }
            ServerMessage::GameEnded(e) => self.game_ended = Some(e.clone()),
            ServerMessage::WaitingForMatch(w) => {
                info!(scene_id = %w.scene_id, waiting = w.waiting, "Waiting for match");
            }
            _ => {}
        }

        let before = self.session.phase();
        self.session.on_server_message(&msg, now);
        let after = self.session.phase();

        match (before, after) {
            (_, ClientPhase::Matched) if before != ClientPhase::Matched => {
                self.start_match(now).map(Some)
            }
            (ClientPhase::Matched | ClientPhase::Validating, ClientPhase::Playing) => {
                self.start_game().await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn start_match(
        &mut self,
        now: std::time::Instant,
    ) -> Result<mpsc::Receiver<LinkEvent>, NetplayError> {
        let Some(info) = self.session.match_info().cloned() else {
            return Err(NetplayError::NotConnected);
        };
        if let Some(mut old) = self.transport.take() {
            old.close();
        }
        let (link, rx) = self
            .links
            .create(&info)
            .map_err(|e| NetplayError::ConnectionFailed(e.to_string()))?;
        let role = if info.initiator {
            PeerRole::Initiator
        } else {
            PeerRole::Responder
        };
        let mut transport = TransportManager::new(link, role, &self.opts.netplay);
        self.transport_events = Some(transport.subscribe());
        transport.start();
        self.transport = Some(transport);
        self.session.begin_validation(now);
        Ok(rx)
    }

    async fn start_game(&mut self) -> Result<(), NetplayError> {
        let Some(info) = self.session.match_info().cloned() else {
            return Ok(());
        };
        let env = self.host.create_env(&info);
        self.finished = false;
        self.rollback = Some(
            RollbackSession::new(env, info.player_index, info.seed, &self.opts.netplay).await?,
        );
        Ok(())
    }

    fn on_link_event(&mut self, ev: LinkEvent) {
        let now = Instant::now().into_std();
        let Some(t) = &mut self.transport else {
            return;
        };
        match ev {
            LinkEvent::IceState(state) => t.on_ice_state(state, now),
            LinkEvent::ChannelState(DataChannelState::Open) => t.on_channel_open(),
            LinkEvent::ChannelState(DataChannelState::Closed) => t.on_channel_close(now),
            LinkEvent::ChannelState(_) => {}
            LinkEvent::LocalCandidate(c) => t.on_local_candidate(c),
            LinkEvent::Message(bytes) => {
                let msg = match decode_peer(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "Dropping malformed peer message");
                        return;
                    }
                };
                if let Some(rb) = &mut self.rollback {
                    let update = rb.on_peer_message(&msg);
                    trace!(?update, "Peer message applied");
                }
                return;
            }
        }
        if t.is_connection_usable() {
            self.session.on_link_ready();
        }
    }

    async fn on_tick(&mut self) -> Result<(), NetplayError> {
        if self.finished {
            return Ok(());
        }
        let Some(rb) = &mut self.rollback else {
            return Ok(());
        };

        if let Some(target) = rb.fast_forward_target() {
            rb.fast_forward(target).await?;
        }

        let frame = rb.current_frame();
        let action = self.host.local_action(frame);
        if let Some(packet) = rb.add_local_input(action)
            && let Some(t) = &mut self.transport
            && let Err(e) = t.send(&PeerMessage::Input(packet))
        {
            trace!(error = %e, frame, "Input not sent");
        }

        let adv = rb.advance_frame().await?;
        self.session.set_frame(rb.current_frame());
        if let Some(obs) = &adv.observation {
            self.host.render(adv.frame, obs);
        }

        if adv.done {
            self.session.complete_episode(adv.frame);
            let done = self.session.episodes_completed();
            match self.session.match_info() {
                Some(info) if done < info.num_episodes => {
                    let seed = info.seed.wrapping_add(u64::from(done));
                    rb.start_episode(done, seed).await?;
                }
                _ => {
                    info!(episodes = done, "All episodes played");
                    self.finished = true;
                }
            }
        }
        Ok(())
    }

    /// Route transport events to the session, session commands to the
    /// server or transport, and queued signaling to the relay.
    async fn pump(&mut self) -> Result<(), NetplayError> {
        if let Some(rx) = &mut self.transport_events {
            loop {
                match rx.try_recv() {
                    Ok(ev) => self.session.on_transport_event(&ev),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!(skipped = n, "Transport events lagged");
                    }
                    Err(_) => break,
                }
            }
        }

        while let Some(cmd) = self.session.poll_command() {
            match cmd {
                ClientCommand::Send(msg) => msg.send(&self.handle).await?,
                ClientCommand::CloseTransport => self.close_transport(),
                ClientCommand::RestartIce => {
                    if let Some(t) = &mut self.transport
                        && t.health() != LinkHealth::Lost
                    {
                        t.attempt_ice_restart(Instant::now().into_std());
                    }
                }
            }
        }

        if let (Some(t), Some(info)) = (&mut self.transport, self.session.match_info()) {
            while let Some(payload) = t.poll_signal() {
                let signal = Signal {
                    game_id: info.game_id.clone(),
                    payload,
                };
                self.handle.send_message(&signal).await?;
            }
        }
        Ok(())
    }

    fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            game_id: self.session.match_info().map(|i| i.game_id.clone()),
            phase: self.session.phase(),
            game_ended: self.game_ended.clone(),
            stats: self.rollback.as_ref().map(|r| r.stats()),
            desyncs: self
                .rollback
                .as_ref()
                .map(|r| r.desyncs().to_vec())
                .unwrap_or_default(),
            confirmed_checksums: self
                .rollback
                .as_ref()
                .map(|r| r.confirmed_checksums().collect())
                .unwrap_or_default(),
        }
    }
}
