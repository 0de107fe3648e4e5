//! Peer transport manager.
//!
//! Owns the single peer connection + data channel to the remote participant
//! and turns raw ICE / data channel transitions into two high-level events:
//! [`TransportEvent::ConnectionLost`] and [`TransportEvent::ConnectionRestored`].
//! Nothing above this module looks at ICE state directly.
//!
//! The manager is sans-IO: the WebRTC binding implements [`PeerLink`], the
//! caller feeds link transitions in and calls [`TransportManager::poll`] when
//! [`TransportManager::next_deadline`] passes. Signaling that must travel
//! through the relay server is drained with [`TransportManager::poll_signal`].
//!
//! Connection health:
//!
//! ```text
//! Stable --ICE disconnected--> DisconnectedGrace --grace expires--> Lost
//!    ^                              |                                 |
//!    +-------ICE connected----------+                                 |
//!    +-----------------ICE connected + channel open-------------------+
//! ```
//!
//! ICE `failed` and a data channel close while ICE is still connected go
//! straight to `Lost`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mug_proto::codec::encode_peer;
use mug_proto::messages::peer::PeerMessage;
use mug_proto::messages::reconnect::{DataChannelState, IceConnectionState};
use mug_proto::messages::signaling::SignalPayload;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NetplayConfig;
use crate::error::LinkError;
use crate::timer::TimerSet;

/// Binding to a concrete WebRTC peer connection with one data channel.
pub trait PeerLink: Send {
    /// Create a local offer. `ice_restart` requests fresh ICE credentials.
    fn create_offer(&mut self, ice_restart: bool) -> Result<String, LinkError>;
    /// Apply a remote offer and create the local answer.
    fn create_answer(&mut self, offer_sdp: &str) -> Result<String, LinkError>;
    fn apply_answer(&mut self, answer_sdp: &str) -> Result<(), LinkError>;
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), LinkError>;
    fn ice_state(&self) -> IceConnectionState;
    fn channel_state(&self) -> DataChannelState;
    fn send(&mut self, data: &[u8]) -> Result<(), LinkError>;
    fn stats(&self) -> LinkStats;
    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rtt_ms: Option<u32>,
    pub packets_lost: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Good,
    Fair,
    Poor,
    Unknown,
}

impl ConnectionQuality {
    fn from_rtt(rtt_ms: Option<u32>) -> Self {
        match rtt_ms {
            None => Self::Unknown,
            Some(r) if r < 100 => Self::Good,
            Some(r) if r < 250 => Self::Fair,
            Some(_) => Self::Poor,
        }
    }
}

/// Which side creates offers. Exactly one peer is the initiator so that
/// offers never cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// ICE stayed `disconnected` for the whole grace period.
    GraceExpired,
    /// ICE reported `failed`.
    IceFailed,
    /// The data channel closed while ICE was still connected.
    ChannelClosed,
}

/// Diagnostic payload of a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossInfo {
    pub cause: LossCause,
    pub ice_state: IceConnectionState,
    pub channel_state: DataChannelState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionLost(LossInfo),
    ConnectionRestored { restart_attempts: u32 },
    /// Recovery gave up after the configured number of ICE restarts.
    RestartsExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Stable,
    DisconnectedGrace,
    Lost,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartPhase {
    Idle,
    Restarting { attempts: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TransportTimer {
    Grace,
    RestartAttempt,
}

const EVENT_CAPACITY: usize = 64;

pub struct TransportManager<L: PeerLink> {
    link: Option<L>,
    role: PeerRole,
    health: LinkHealth,
    restart: RestartPhase,
    /// Generation of the negotiation currently in force. Signals tagged with
    /// another generation belong to a superseded negotiation.
    generation: u32,
    timers: TimerSet<TransportTimer>,
    events: broadcast::Sender<TransportEvent>,
    signals: VecDeque<SignalPayload>,
    grace_period: Duration,
    max_restarts: u32,
    restart_timeout: Duration,
}

impl<L: PeerLink> TransportManager<L> {
    pub fn new(link: L, role: PeerRole, config: &NetplayConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            link: Some(link),
            role,
            health: LinkHealth::Stable,
            restart: RestartPhase::Idle,
            generation: 0,
            timers: TimerSet::new(),
            events,
            signals: VecDeque::new(),
            grace_period: config.grace_period,
            max_restarts: config.max_ice_restarts,
            restart_timeout: config.ice_restart_timeout,
        }
    }

    /// Register a listener. Every subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn link(&self) -> Option<&L> {
        self.link.as_ref()
    }

    pub fn link_mut(&mut self) -> Option<&mut L> {
        self.link.as_mut()
    }

    /// Begin the initial negotiation. Only the initiator produces an offer.
    pub fn start(&mut self) {
        if self.role != PeerRole::Initiator {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.create_offer(false) {
            Ok(sdp) => self.signals.push_back(SignalPayload::Offer {
                sdp,
                ice_restart: false,
                generation: self.generation,
            }),
            Err(e) => warn!(error = %e, "Failed to create initial offer"),
        }
    }

    /// Peer connection connected and data channel open.
    pub fn is_connection_usable(&self) -> bool {
        self.link.as_ref().is_some_and(|l| {
            l.ice_state().is_connected() && l.channel_state() == DataChannelState::Open
        })
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        match &self.link {
            Some(l) if self.health == LinkHealth::Stable => {
                ConnectionQuality::from_rtt(l.stats().rtt_ms)
            }
            _ => ConnectionQuality::Unknown,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Outbound signaling to relay through the server.
    pub fn poll_signal(&mut self) -> Option<SignalPayload> {
        self.signals.pop_front()
    }

    /// Send a data channel message.
    pub fn send(&mut self, msg: &PeerMessage) -> Result<(), LinkError> {
        if !self.is_connection_usable() {
            return Err(LinkError::ChannelNotOpen);
        }
        let bytes = encode_peer(msg).map_err(|e| LinkError::Negotiation(e.to_string()))?;
        match self.link.as_mut() {
            Some(link) => link.send(&bytes),
            None => Err(LinkError::Closed),
        }
    }

    pub fn on_ice_state(&mut self, state: IceConnectionState, now: Instant) {
        if self.health == LinkHealth::Closed {
            return;
        }
        debug!(?state, health = ?self.health, "ICE state changed");
        match state {
            IceConnectionState::Disconnected => {
                if self.health == LinkHealth::Stable {
                    self.health = LinkHealth::DisconnectedGrace;
                    self.timers
                        .arm(TransportTimer::Grace, now + self.grace_period);
                }
            }
            IceConnectionState::Failed => {
                self.signal_loss(LossCause::IceFailed, now);
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.timers.cancel(TransportTimer::Grace);
                match self.health {
                    LinkHealth::DisconnectedGrace => {
                        debug!("ICE recovered within grace period");
                        self.health = LinkHealth::Stable;
                    }
                    LinkHealth::Lost => self.try_restore(),
                    LinkHealth::Stable => self.settle_restart(),
                    LinkHealth::Closed => {}
                }
            }
            IceConnectionState::New
            | IceConnectionState::Checking
            | IceConnectionState::Closed => {}
        }
    }

    pub fn on_channel_open(&mut self) {
        if self.health == LinkHealth::Lost {
            self.try_restore();
        }
    }

    pub fn on_channel_close(&mut self, now: Instant) {
        if self.health == LinkHealth::Closed {
            return;
        }
        let ice_connected = self
            .link
            .as_ref()
            .is_some_and(|l| l.ice_state().is_connected());
        if ice_connected {
            self.signal_loss(LossCause::ChannelClosed, now);
        }
    }

    /// Local ICE candidate gathered by the binding.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) {
        if self.health == LinkHealth::Closed {
            return;
        }
        self.signals.push_back(SignalPayload::IceCandidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            generation: self.generation,
        });
    }

    pub fn on_remote_signal(&mut self, payload: SignalPayload, now: Instant) {
        if self.health == LinkHealth::Closed {
            return;
        }
        match payload {
            SignalPayload::Offer {
                sdp,
                ice_restart,
                generation,
            } => {
                if self.role == PeerRole::Initiator {
                    warn!(generation, "Initiator received an offer, ignoring");
                    return;
                }
                if generation < self.generation {
                    debug!(generation, current = self.generation, "Stale offer discarded");
                    return;
                }
                self.generation = generation;
                if ice_restart && self.health == LinkHealth::Lost {
                    let attempts = self.restart_attempts() + 1;
                    self.restart = RestartPhase::Restarting { attempts };
                    self.timers
                        .arm(TransportTimer::RestartAttempt, now + self.restart_timeout);
                }
                let Some(link) = self.link.as_mut() else {
                    return;
                };
                match link.create_answer(&sdp) {
                    Ok(answer) => self.signals.push_back(SignalPayload::Answer {
                        sdp: answer,
                        generation,
                    }),
                    Err(e) => warn!(error = %e, generation, "Failed to answer offer"),
                }
            }
            SignalPayload::Answer { sdp, generation } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Stale answer discarded");
                    return;
                }
                if let Some(link) = self.link.as_mut()
                    && let Err(e) = link.apply_answer(&sdp)
                {
                    warn!(error = %e, generation, "Failed to apply answer");
                }
            }
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                generation,
            } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Stale candidate discarded");
                    return;
                }
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                if let Some(link) = self.link.as_mut()
                    && let Err(e) = link.add_ice_candidate(&candidate)
                {
                    warn!(error = %e, "Failed to add remote ICE candidate");
                }
            }
        }
    }

    /// Start an ICE restart. Only the initiator offers; returns false when
    /// this peer cannot restart (responder, closed, or budget spent).
    pub fn attempt_ice_restart(&mut self, now: Instant) -> bool {
        if self.role != PeerRole::Initiator || self.health == LinkHealth::Closed {
            return false;
        }
        let attempts = self.restart_attempts();
        if attempts >= self.max_restarts {
            self.exhaust(attempts);
            return false;
        }
        let Some(link) = self.link.as_mut() else {
            return false;
        };

        self.generation += 1;
        let attempts = attempts + 1;
        self.restart = RestartPhase::Restarting { attempts };
        info!(attempt = attempts, generation = self.generation, "Attempting ICE restart");

        match link.create_offer(true) {
            Ok(sdp) => self.signals.push_back(SignalPayload::Offer {
                sdp,
                ice_restart: true,
                generation: self.generation,
            }),
            Err(e) => warn!(error = %e, attempt = attempts, "ICE restart offer failed"),
        }
        self.timers
            .arm(TransportTimer::RestartAttempt, now + self.restart_timeout);
        true
    }

    /// Fire expired timers.
    pub fn poll(&mut self, now: Instant) {
        for timer in self.timers.poll_expired(now) {
            match timer {
                TransportTimer::Grace => {
                    if self.health == LinkHealth::DisconnectedGrace {
                        self.signal_loss(LossCause::GraceExpired, now);
                    }
                }
                TransportTimer::RestartAttempt => {
                    if self.health != LinkHealth::Lost {
                        self.settle_restart();
                        continue;
                    }
                    match self.role {
                        PeerRole::Initiator => {
                            self.attempt_ice_restart(now);
                        }
                        PeerRole::Responder => {
                            let attempts = self.restart_attempts();
                            if attempts >= self.max_restarts {
                                self.exhaust(attempts);
                            } else {
                                self.restart = RestartPhase::Restarting {
                                    attempts: attempts + 1,
                                };
                                self.timers.arm(
                                    TransportTimer::RestartAttempt,
                                    now + self.restart_timeout,
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    /// Tear down the link. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
            info!("Peer transport closed");
        }
        self.health = LinkHealth::Closed;
        self.timers.cancel_all();
        self.signals.clear();
    }

    fn restart_attempts(&self) -> u32 {
        match self.restart {
            RestartPhase::Idle => 0,
            RestartPhase::Restarting { attempts } | RestartPhase::Exhausted { attempts } => {
                attempts
            }
        }
    }

    fn signal_loss(&mut self, cause: LossCause, now: Instant) {
        if matches!(self.health, LinkHealth::Lost | LinkHealth::Closed) {
            return;
        }
        self.timers.cancel(TransportTimer::Grace);
        self.health = LinkHealth::Lost;
        // Every loss episode gets the full restart budget.
        self.restart = RestartPhase::Idle;
        self.timers.cancel(TransportTimer::RestartAttempt);

        let (ice_state, channel_state) = match &self.link {
            Some(l) => (l.ice_state(), l.channel_state()),
            None => (IceConnectionState::Closed, DataChannelState::Closed),
        };
        let info = LossInfo {
            cause,
            ice_state,
            channel_state,
        };
        warn!(?cause, ?ice_state, ?channel_state, "Peer connection lost");
        let _ = self.events.send(TransportEvent::ConnectionLost(info));

        match self.role {
            PeerRole::Initiator => {
                self.attempt_ice_restart(now);
            }
            PeerRole::Responder => {
                // Wait for the initiator's restart offer.
                self.restart = RestartPhase::Restarting { attempts: 0 };
                self.timers
                    .arm(TransportTimer::RestartAttempt, now + self.restart_timeout);
            }
        }
    }

    fn try_restore(&mut self) {
        if !self.is_connection_usable() {
            return;
        }
        if matches!(self.restart, RestartPhase::Exhausted { .. }) {
            debug!("Link came back after recovery was abandoned, ignoring");
            return;
        }
        let restart_attempts = self.restart_attempts();
        self.health = LinkHealth::Stable;
        self.restart = RestartPhase::Idle;
        self.timers.cancel(TransportTimer::RestartAttempt);
        info!(restart_attempts, "Peer connection restored");
        let _ = self
            .events
            .send(TransportEvent::ConnectionRestored { restart_attempts });
    }

    /// Forget a restart issued while the link was up.
    fn settle_restart(&mut self) {
        if let RestartPhase::Restarting { attempts } = self.restart {
            debug!(attempts, "ICE restart finished without a loss");
            self.restart = RestartPhase::Idle;
            self.timers.cancel(TransportTimer::RestartAttempt);
        }
    }

    fn exhaust(&mut self, attempts: u32) {
        if matches!(self.restart, RestartPhase::Exhausted { .. }) {
            return;
        }
        self.restart = RestartPhase::Exhausted { attempts };
        self.timers.cancel(TransportTimer::RestartAttempt);
        warn!(attempts, "ICE restart attempts exhausted");
        let _ = self
            .events
            .send(TransportEvent::RestartsExhausted { attempts });
    }
}
