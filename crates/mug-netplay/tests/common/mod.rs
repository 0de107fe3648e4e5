#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mug_netplay::transport::LinkStats;
use mug_netplay::{
    EnvError, Environment, GameHost, IceCandidate, LinkError, LinkEvent, LinkFactory, MatchInfo,
    NetplayConfig, Overlay, OverlayView, ParticipantOptions, PeerLink, StepOutcome, decode_state,
    encode_state,
};
use mug_proto::GameId;
use mug_proto::messages::peer::Action;
use mug_proto::messages::reconnect::{DataChannelState, IceConnectionState};
use mug_server::ServerConfig;
use mug_server::net::tcp::run_tcp_listener_with_listener;
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub async fn spawn_test_server(config: ServerConfig) -> SocketAddr {
    let (event_tx, event_rx) = mpsc::channel(1024);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = run_tcp_listener_with_listener(listener, event_tx, None).await;
    });
    tokio::spawn(async move {
        let _ = mug_server::run_server(event_rx, config).await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

/// Netplay tuning scaled down so recovery happens in well under a second.
pub fn fast_netplay() -> NetplayConfig {
    NetplayConfig {
        grace_period: Duration::from_millis(100),
        max_ice_restarts: 10,
        ice_restart_timeout: Duration::from_millis(200),
        ..NetplayConfig::default()
    }
}

pub fn options(server: SocketAddr, subject: &str, scene: &str) -> ParticipantOptions {
    ParticipantOptions {
        server,
        subject_id: subject.into(),
        scene_id: scene.into(),
        rtt_ms: Some(20),
        frame_interval: Duration::from_millis(5),
        netplay: fast_netplay(),
    }
}

// ---------------------------------------------------------------------------
// Loopback peer links
// ---------------------------------------------------------------------------

struct End {
    events: mpsc::Sender<LinkEvent>,
    ice: IceConnectionState,
    channel: DataChannelState,
}

#[derive(Default)]
struct Pair {
    ends: [Option<End>; 2],
    /// Negotiations fail while set.
    blocked: bool,
    delivered: u64,
}

impl Pair {
    fn set_all(&mut self, ice: IceConnectionState, channel: DataChannelState) {
        for end in self.ends.iter_mut().flatten() {
            let ice_changed = end.ice != ice;
            let channel_changed = end.channel != channel;
            end.ice = ice;
            end.channel = channel;
            if ice_changed {
                let _ = end.events.try_send(LinkEvent::IceState(ice));
            }
            if channel_changed {
                let _ = end.events.try_send(LinkEvent::ChannelState(channel));
            }
        }
    }
}

/// In-process stand-in for a WebRTC peer connection pair. Both participants
/// of a game share one hub; a negotiation completes when the initiator
/// applies the answer.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    pairs: Arc<Mutex<HashMap<GameId, Pair>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory { hub: self.clone() }
    }

    /// Messages carried so far across every game.
    pub fn delivered(&self) -> u64 {
        self.pairs.lock().values().map(|p| p.delivered).sum()
    }

    /// Drop every link to ICE `disconnected` and fail negotiations until
    /// [`heal`](Self::heal).
    pub fn break_links(&self) {
        for pair in self.pairs.lock().values_mut() {
            pair.blocked = true;
            pair.set_all(IceConnectionState::Disconnected, DataChannelState::Open);
        }
    }

    /// Let the next negotiation succeed.
    pub fn heal(&self) {
        for pair in self.pairs.lock().values_mut() {
            pair.blocked = false;
        }
    }

    pub async fn wait_for_traffic(&self, messages: u64) {
        while self.delivered() < messages {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub struct LoopbackFactory {
    hub: LoopbackHub,
}

impl LinkFactory for LoopbackFactory {
    type Link = LoopbackLink;

    fn create(
        &mut self,
        info: &MatchInfo,
    ) -> Result<(LoopbackLink, mpsc::Receiver<LinkEvent>), LinkError> {
        let side = usize::from(info.player_index);
        if side > 1 {
            return Err(LinkError::Negotiation("loopback links are two-party".into()));
        }
        let (tx, rx) = mpsc::channel(1024);
        let mut pairs = self.hub.pairs.lock();
        let pair = pairs.entry(info.game_id.clone()).or_default();
        pair.ends[side] = Some(End {
            events: tx,
            ice: IceConnectionState::New,
            channel: DataChannelState::Connecting,
        });
        let link = LoopbackLink {
            hub: self.hub.clone(),
            game_id: info.game_id.clone(),
            side,
        };
        Ok((link, rx))
    }
}

pub struct LoopbackLink {
    hub: LoopbackHub,
    game_id: GameId,
    side: usize,
}

impl LoopbackLink {
    fn with_pair<T>(&self, f: impl FnOnce(&mut Pair) -> T) -> Option<T> {
        self.hub.pairs.lock().get_mut(&self.game_id).map(f)
    }

    fn with_end<T>(&self, f: impl FnOnce(&End) -> T) -> Option<T> {
        let side = self.side;
        self.with_pair(|p| p.ends[side].as_ref().map(f)).flatten()
    }
}

impl PeerLink for LoopbackLink {
    fn create_offer(&mut self, ice_restart: bool) -> Result<String, LinkError> {
        Ok(format!("loopback-offer restart={ice_restart}"))
    }

    fn create_answer(&mut self, offer_sdp: &str) -> Result<String, LinkError> {
        Ok(format!("loopback-answer to {offer_sdp}"))
    }

    fn apply_answer(&mut self, _answer_sdp: &str) -> Result<(), LinkError> {
        self.with_pair(|pair| {
            if !pair.blocked && pair.ends.iter().all(Option::is_some) {
                pair.set_all(IceConnectionState::Connected, DataChannelState::Open);
            }
        })
        .ok_or(LinkError::Closed)
    }

    fn add_ice_candidate(&mut self, _candidate: &IceCandidate) -> Result<(), LinkError> {
        Ok(())
    }

    fn ice_state(&self) -> IceConnectionState {
        self.with_end(|e| e.ice)
            .unwrap_or(IceConnectionState::Closed)
    }

    fn channel_state(&self) -> DataChannelState {
        self.with_end(|e| e.channel)
            .unwrap_or(DataChannelState::Closed)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let side = self.side;
        self.with_pair(|pair| {
            let usable = pair.ends[side]
                .as_ref()
                .is_some_and(|e| e.ice == IceConnectionState::Connected);
            if !usable {
                return Err(LinkError::ChannelNotOpen);
            }
            let Some(remote) = &pair.ends[1 - side] else {
                return Err(LinkError::ChannelNotOpen);
            };
            // Unreliable channel: a full queue drops the message.
            if remote
                .events
                .try_send(LinkEvent::Message(Bytes::copy_from_slice(data)))
                .is_ok()
            {
                pair.delivered += 1;
            }
            Ok(())
        })
        .unwrap_or(Err(LinkError::Closed))
    }

    fn stats(&self) -> LinkStats {
        LinkStats {
            rtt_ms: Some(1),
            packets_lost: 0,
        }
    }

    fn close(&mut self) {
        let side = self.side;
        self.with_pair(|pair| {
            if let Some(end) = &mut pair.ends[side] {
                end.ice = IceConnectionState::Closed;
                end.channel = DataChannelState::Closed;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Game side
// ---------------------------------------------------------------------------

/// Two players pushing a shared marker along a line, with RNG drift.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Drift {
    pub marker: i64,
    pub energy: [u32; 2],
    pub ticks: u32,
    pub horizon: u32,
}

impl Drift {
    pub fn new(horizon: u32) -> Self {
        Self {
            horizon,
            ..Default::default()
        }
    }
}

impl Environment for Drift {
    type Observation = (i64, u32);

    fn num_players(&self) -> usize {
        2
    }

    fn reset(&mut self, rng: &mut ChaCha8Rng) {
        self.marker = rng.random_range(-10..=10);
        self.energy = [100, 100];
        self.ticks = 0;
    }

    fn step(&mut self, actions: &[Action], rng: &mut ChaCha8Rng) -> Result<StepOutcome, EnvError> {
        if actions.len() != 2 {
            return Err(EnvError::ActionCount {
                expected: 2,
                got: actions.len(),
            });
        }
        for (slot, &a) in actions.iter().enumerate() {
            let push = i64::from(a % 4);
            let energy = &mut self.energy[slot];
            if push > 0 && *energy > 0 {
                *energy -= 1;
                self.marker += if slot == 0 { push } else { -push };
            }
        }
        self.marker += rng.random_range(-2..=2);
        self.ticks += 1;
        let score = self.marker as f64;
        Ok(StepOutcome {
            rewards: vec![score, -score],
            done: self.horizon > 0 && self.ticks >= self.horizon,
        })
    }

    fn get_state(&self) -> Vec<u8> {
        encode_state(self)
    }

    fn set_state(&mut self, state: &[u8]) -> Result<(), EnvError> {
        *self = decode_state(state)?;
        Ok(())
    }

    fn observe(&self) -> (i64, u32) {
        (self.marker, self.ticks)
    }
}

/// Scripted player: the action for a frame depends only on slot and frame.
pub struct ScriptedHost {
    pub horizon: u32,
    pub slot: u8,
    pub rendered: Arc<Mutex<u32>>,
}

impl ScriptedHost {
    pub fn new(horizon: u32) -> Self {
        Self {
            horizon,
            slot: 0,
            rendered: Arc::default(),
        }
    }
}

pub fn scripted_action(slot: u8, frame: u32) -> Action {
    ((frame / 4 + u32::from(slot) * 3) % 4) as Action
}

impl GameHost for ScriptedHost {
    type Env = Drift;

    fn create_env(&mut self, info: &MatchInfo) -> Drift {
        self.slot = info.player_index;
        Drift::new(self.horizon)
    }

    fn local_action(&mut self, frame: u32) -> Action {
        scripted_action(self.slot, frame)
    }

    fn render(&mut self, _frame: u32, _observation: &(i64, u32)) {
        *self.rendered.lock() += 1;
    }
}

/// Overlay that records what it was asked to show.
#[derive(Clone, Default)]
pub struct RecordingOverlay {
    pub shown: Arc<Mutex<Vec<Overlay>>>,
    pub hides: Arc<Mutex<u32>>,
}

impl OverlayView for RecordingOverlay {
    fn show(&mut self, overlay: Overlay) {
        self.shown.lock().push(overlay);
    }

    fn hide(&mut self) {
        *self.hides.lock() += 1;
    }
}
