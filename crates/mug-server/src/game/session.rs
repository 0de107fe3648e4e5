use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use mug_proto::messages::matchmaking::{GameMatched, GameStarted};
use mug_proto::messages::reconnect::{ConnectionLost, GameEndReason, GameEnded};
use mug_proto::messages::signaling::{RelayedSignal, SignalPayload};
use mug_proto::{GameId, SubjectId};
use tracing::{debug, info, warn};

use super::reconnection::ReconnectionRecord;
use super::state::{SessionState, StateCell};
use crate::config::SceneConfig;
use crate::net::inbound::ConnId;
use crate::net::outbound::{OutboundTx, Outbox};

/// A matched participant and the relay connection reaching it.
#[derive(Debug, Clone)]
pub struct Player {
    pub subject_id: SubjectId,
    pub conn_id: ConnId,
    pub outbound: OutboundTx,
    pub rtt_ms: Option<u32>,
    /// Highest episode this player reported complete.
    episodes_done: u32,
}

impl Player {
    pub fn new(
        subject_id: SubjectId,
        conn_id: ConnId,
        outbound: OutboundTx,
        rtt_ms: Option<u32>,
    ) -> Self {
        Self {
            subject_id,
            conn_id,
            outbound,
            rtt_ms,
            episodes_done: 0,
        }
    }
}

/// Result of a `ValidationResult` report.
#[derive(Debug)]
pub enum ValidationStep {
    /// Still waiting for other players, or the report was stale.
    Pending,
    /// Every player validated and the game is now playing.
    Started(Outbox),
    /// A player could not reach its partner. The lobby decides between
    /// another round and giving up.
    Failed,
}

/// One multiplayer game from match to end.
///
/// All mutation goes through the methods below, which validate the
/// lifecycle state first. Messages they produce are returned as an
/// [`Outbox`] so the caller can send them after releasing the session lock.
#[derive(Debug)]
pub struct GameSession {
    game_id: GameId,
    scene_id: String,
    state: StateCell,
    /// Slot order.
    players: Vec<Player>,
    host_id: SubjectId,
    seed: u64,
    num_episodes: u32,
    reconnection_timeout: Duration,
    frame_number: u32,
    validated: BTreeSet<SubjectId>,
    validation_attempt: u32,
    max_validation_attempts: u32,
    reconnection: ReconnectionRecord,
    end_reason: Option<GameEndReason>,
}

impl GameSession {
    /// Build a session in WAITING. Only the matchmaking lobby calls this.
    pub(crate) fn new(
        game_id: GameId,
        scene_id: impl Into<String>,
        players: Vec<Player>,
        scene: &SceneConfig,
        seed: u64,
    ) -> Self {
        let host_id = players
            .first()
            .map(|p| p.subject_id.clone())
            .unwrap_or_default();
        let reconnection_timeout = Duration::from_millis(scene.reconnection_timeout_ms);
        Self {
            state: StateCell::new(game_id.clone()),
            reconnection: ReconnectionRecord::new(game_id.clone(), reconnection_timeout),
            game_id,
            scene_id: scene_id.into(),
            players,
            host_id,
            seed,
            num_episodes: scene.num_episodes.max(1),
            reconnection_timeout,
            frame_number: 0,
            validated: BTreeSet::new(),
            validation_attempt: 0,
            max_validation_attempts: scene.max_validation_attempts.max(1),
            end_reason: None,
        }
    }

    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    pub fn end_reason(&self) -> Option<GameEndReason> {
        self.end_reason
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn host_id(&self) -> &SubjectId {
        &self.host_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    /// Lowest episode count completed by every player.
    pub fn current_episode(&self) -> u32 {
        self.players
            .iter()
            .map(|p| p.episodes_done)
            .min()
            .unwrap_or(0)
    }

    pub fn num_episodes(&self) -> u32 {
        self.num_episodes
    }

    pub fn validation_attempt(&self) -> u32 {
        self.validation_attempt
    }

    pub fn can_retry_validation(&self) -> bool {
        self.validation_attempt < self.max_validation_attempts
    }

    pub fn reconnection(&self) -> &ReconnectionRecord {
        &self.reconnection
    }

    pub fn has_player(&self, subject: &SubjectId) -> bool {
        self.players.iter().any(|p| &p.subject_id == subject)
    }

    fn recipients(&self) -> Vec<OutboundTx> {
        self.players.iter().map(|p| p.outbound.clone()).collect()
    }

    /// Announce the match for the next validation round and start
    /// validating. Sends a personalised `GameMatched` to every player.
    pub fn begin_validation(&mut self) -> Outbox {
        let mut outbox = Outbox::new();
        if !self.state.transition_to(SessionState::Matched) {
            return outbox;
        }
        self.validation_attempt += 1;
        self.validated.clear();

        let slots: Vec<SubjectId> = self.players.iter().map(|p| p.subject_id.clone()).collect();
        for (index, player) in self.players.iter().enumerate() {
            let msg = GameMatched {
                game_id: self.game_id.clone(),
                players: slots.clone(),
                player_index: index as u8,
                host_id: self.host_id.clone(),
                // Slot 0 creates every offer.
                initiator: index == 0,
                reconnection_timeout_ms: self.reconnection_timeout.as_millis() as u64,
                num_episodes: self.num_episodes,
                seed: self.seed,
                validation_attempt: self.validation_attempt,
            };
            outbox.push(&player.outbound, &msg);
        }
        self.state.transition_to(SessionState::Validating);
        info!(
            game_id = %self.game_id,
            attempt = self.validation_attempt,
            players = self.players.len(),
            "Match announced, validating peer connections"
        );
        outbox
    }

    pub fn on_validation_result(
        &mut self,
        from: &SubjectId,
        attempt: u32,
        ok: bool,
    ) -> ValidationStep {
        if self.state() != SessionState::Validating {
            debug!(game_id = %self.game_id, %from, state = %self.state(), "Validation result outside validation ignored");
            return ValidationStep::Pending;
        }
        if attempt != self.validation_attempt {
            debug!(
                game_id = %self.game_id,
                %from,
                attempt,
                current = self.validation_attempt,
                "Stale validation result ignored"
            );
            return ValidationStep::Pending;
        }
        if !ok {
            warn!(game_id = %self.game_id, %from, attempt, "Peer validation failed");
            return ValidationStep::Failed;
        }

        self.validated.insert(from.clone());
        if self.validated.len() < self.players.len() {
            return ValidationStep::Pending;
        }

        let mut outbox = Outbox::new();
        if self.state.transition_to(SessionState::Playing) {
            outbox.broadcast(
                &self.recipients(),
                &GameStarted {
                    game_id: self.game_id.clone(),
                },
            );
        }
        ValidationStep::Started(outbox)
    }

    /// Return to WAITING and announce the next validation round. The caller
    /// has already confirmed the group with the matchmaker.
    pub(crate) fn restart_validation(&mut self) -> Outbox {
        if !self.state.transition_to(SessionState::Waiting) {
            return Outbox::new();
        }
        self.begin_validation()
    }

    pub fn on_episode_complete(
        &mut self,
        from: &SubjectId,
        episode: u32,
        frame_number: u32,
        now: Instant,
    ) -> Outbox {
        if self.state() != SessionState::Playing {
            debug!(game_id = %self.game_id, %from, episode, "Episode report outside play ignored");
            return Outbox::new();
        }
        let Some(player) = self.players.iter_mut().find(|p| &p.subject_id == from) else {
            return Outbox::new();
        };
        // Monotonic: duplicate or out-of-order reports never move back.
        player.episodes_done = player.episodes_done.max(episode);
        self.frame_number = self.frame_number.max(frame_number);

        let current = self.current_episode();
        debug!(game_id = %self.game_id, %from, episode, current, "Episode complete");
        if current >= self.num_episodes {
            info!(game_id = %self.game_id, episodes = current, "All episodes complete");
            return self.end(GameEndReason::Completed, now);
        }
        Outbox::new()
    }

    pub fn on_player_excluded(
        &mut self,
        reporter: &SubjectId,
        excluded: &SubjectId,
        reason: &str,
        now: Instant,
    ) -> Outbox {
        if self.state() != SessionState::Playing {
            debug!(game_id = %self.game_id, %excluded, "Exclusion outside play ignored");
            return Outbox::new();
        }
        if !self.has_player(excluded) {
            warn!(game_id = %self.game_id, %reporter, %excluded, "Exclusion names a non-participant");
            return Outbox::new();
        }
        info!(game_id = %self.game_id, %reporter, %excluded, %reason, "Player excluded");
        self.end(GameEndReason::PartnerExcluded, now)
    }

    pub fn on_connection_lost(
        &mut self,
        report: &ConnectionLost,
        now: Instant,
        now_ms: u64,
    ) -> Outbox {
        let mut outbox = Outbox::new();
        if self.state() != SessionState::Playing {
            debug!(game_id = %self.game_id, player = %report.player_id, state = %self.state(), "Loss report outside play ignored");
            return outbox;
        }
        self.frame_number = self.frame_number.max(report.frame_number);
        if let Some(pause) = self.reconnection.on_connection_lost(report, now, now_ms) {
            outbox.broadcast(&self.recipients(), &pause);
        }
        outbox
    }

    pub fn on_reconnection_success(
        &mut self,
        from: &SubjectId,
        restart_attempts: u32,
        now: Instant,
        now_ms: u64,
    ) -> Outbox {
        let mut outbox = Outbox::new();
        if self.state() != SessionState::Playing {
            return outbox;
        }
        if let Some(resume) =
            self.reconnection
                .on_reconnection_success(from, restart_attempts, now, now_ms)
        {
            outbox.broadcast(&self.recipients(), &resume);
        }
        outbox
    }

    pub fn on_reconnection_timeout(&mut self, from: &SubjectId, now: Instant, now_ms: u64) -> Outbox {
        if self.state() != SessionState::Playing {
            return Outbox::new();
        }
        if self.reconnection.on_timeout(from, now, now_ms) {
            return self.end(GameEndReason::ReconnectionTimeout, now);
        }
        Outbox::new()
    }

    /// Check the server-side pause deadline.
    pub fn poll_backstop(&mut self, now: Instant, now_ms: u64) -> Outbox {
        if self.state() == SessionState::Playing && self.reconnection.poll_backstop(now, now_ms) {
            return self.end(GameEndReason::ReconnectionTimeout, now);
        }
        Outbox::new()
    }

    /// A participant's relay connection dropped. The remaining players are
    /// told the game is over.
    pub fn on_player_disconnected(&mut self, subject: &SubjectId, now: Instant) -> Outbox {
        let Some(pos) = self.players.iter().position(|p| &p.subject_id == subject) else {
            return Outbox::new();
        };
        let player = self.players.remove(pos);
        info!(game_id = %self.game_id, subject = %player.subject_id, state = %self.state(), "Participant disconnected");
        self.end(GameEndReason::PartnerDisconnected, now)
    }

    /// Forward a signaling payload to every other player.
    pub fn relay_signal(&self, from: &SubjectId, payload: SignalPayload) -> Outbox {
        let mut outbox = Outbox::new();
        if !matches!(
            self.state(),
            SessionState::Validating | SessionState::Playing
        ) {
            debug!(game_id = %self.game_id, %from, state = %self.state(), "Signal outside validation or play dropped");
            return outbox;
        }
        let others: Vec<OutboundTx> = self
            .players
            .iter()
            .filter(|p| &p.subject_id != from)
            .map(|p| p.outbound.clone())
            .collect();
        outbox.broadcast(
            &others,
            &RelayedSignal {
                game_id: self.game_id.clone(),
                from_player: from.clone(),
                payload,
            },
        );
        outbox
    }

    /// Move to ENDED and tell every remaining player why. Ending twice is a
    /// no-op.
    pub fn end(&mut self, reason: GameEndReason, now: Instant) -> Outbox {
        let mut outbox = Outbox::new();
        if !self.state.transition_to(SessionState::Ended) {
            return outbox;
        }
        self.end_reason = Some(reason);
        self.reconnection.close_open_pause(now);
        info!(
            game_id = %self.game_id,
            ?reason,
            frame = self.frame_number,
            episodes = self.current_episode(),
            "Game ended"
        );
        outbox.broadcast(
            &self.recipients(),
            &GameEnded {
                game_id: self.game_id.clone(),
                reason,
                reconnection_data: self.reconnection.data().clone(),
            },
        );
        outbox
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use mug_proto::messages::reconnect::{DataChannelState, IceConnectionState};
    use mug_proto::msg_id::MsgId;
    use tokio::sync::mpsc;

    pub(crate) fn player(name: &str, conn_id: ConnId) -> (Player, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        (Player::new(name.to_string(), conn_id, tx, None), rx)
    }

    /// Message ids queued in `outbox`, in order.
    pub(crate) async fn ids(outbox: Outbox, rxs: &mut [&mut mpsc::Receiver<Bytes>]) -> Vec<MsgId> {
        outbox.flush().await;
        let mut out = Vec::new();
        for rx in rxs.iter_mut() {
            while let Ok(frame) = rx.try_recv() {
                let (packets, _) = mug_proto::codec::try_decode_tcp_frames(&frame).unwrap();
                out.extend(packets.iter().map(|p| p.msg_id()));
            }
        }
        out
    }

    fn session(num_episodes: u32) -> (GameSession, mpsc::Receiver<Bytes>, mpsc::Receiver<Bytes>) {
        let (a, rx_a) = player("alice", 1);
        let (b, rx_b) = player("bob", 2);
        let scene = SceneConfig {
            num_episodes,
            ..SceneConfig::default()
        };
        let s = GameSession::new(GameId::from("g1"), "scene", vec![a, b], &scene, 7);
        (s, rx_a, rx_b)
    }

    fn playing(num_episodes: u32) -> (GameSession, mpsc::Receiver<Bytes>, mpsc::Receiver<Bytes>) {
        let (mut s, rx_a, rx_b) = session(num_episodes);
        let _ = s.begin_validation();
        assert!(matches!(
            s.on_validation_result(&"alice".into(), 1, true),
            ValidationStep::Pending
        ));
        assert!(matches!(
            s.on_validation_result(&"bob".into(), 1, true),
            ValidationStep::Started(_)
        ));
        (s, rx_a, rx_b)
    }

    fn lost(player: &str) -> ConnectionLost {
        ConnectionLost {
            game_id: GameId::from("g1"),
            player_id: player.into(),
            frame_number: 120,
            timestamp_ms: 0,
            ice_state: IceConnectionState::Disconnected,
            channel_state: DataChannelState::Open,
        }
    }

    #[tokio::test]
    async fn match_announcement_is_personal() {
        let (mut s, mut rx_a, mut rx_b) = session(1);
        s.begin_validation().flush().await;
        assert_eq!(s.state(), SessionState::Validating);

        let frame = rx_b.try_recv().unwrap();
        let (packets, _) = mug_proto::codec::try_decode_tcp_frames(&frame).unwrap();
        let matched: GameMatched = packets[0].decode().unwrap();
        assert_eq!(matched.player_index, 1);
        assert!(!matched.initiator);
        assert_eq!(matched.host_id, "alice");
        assert_eq!(matched.validation_attempt, 1);
        assert_eq!(matched.seed, 7);
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn stale_validation_round_is_ignored() {
        let (mut s, _a, _b) = session(1);
        let _ = s.begin_validation();
        assert!(matches!(
            s.on_validation_result(&"alice".into(), 1, true),
            ValidationStep::Pending
        ));
        let _ = s.restart_validation();
        assert_eq!(s.validation_attempt(), 2);
        // A round-1 failure arriving late does not fail round 2.
        assert!(matches!(
            s.on_validation_result(&"bob".into(), 1, false),
            ValidationStep::Pending
        ));
        // Alice's round-1 success does not count for round 2.
        assert!(matches!(
            s.on_validation_result(&"bob".into(), 2, true),
            ValidationStep::Pending
        ));
        assert!(matches!(
            s.on_validation_result(&"alice".into(), 2, true),
            ValidationStep::Started(_)
        ));
        assert_eq!(s.state(), SessionState::Playing);
    }

    #[tokio::test]
    async fn both_players_report_loss_one_pause() {
        let (mut s, mut rx_a, mut rx_b) = playing(1);
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        let t0 = Instant::now();
        let first = s.on_connection_lost(&lost("alice"), t0, 0);
        let second = s.on_connection_lost(&lost("bob"), t0 + Duration::from_millis(50), 50);
        let mut all = ids(first, &mut [&mut rx_a, &mut rx_b]).await;
        all.extend(ids(second, &mut [&mut rx_a, &mut rx_b]).await);
        // One pause, delivered to each of the two players.
        assert_eq!(all, vec![MsgId::Pause, MsgId::Pause]);
    }

    #[test]
    fn episodes_end_the_game_once_everyone_finishes() {
        let (mut s, _a, _b) = playing(2);
        let now = Instant::now();
        assert!(s.on_episode_complete(&"alice".into(), 1, 100, now).is_empty());
        assert!(s.on_episode_complete(&"bob".into(), 1, 100, now).is_empty());
        assert_eq!(s.current_episode(), 1);
        assert!(s.on_episode_complete(&"alice".into(), 2, 200, now).is_empty());
        // A duplicate never moves the count back.
        assert!(s.on_episode_complete(&"alice".into(), 1, 100, now).is_empty());
        assert_eq!(s.on_episode_complete(&"bob".into(), 2, 200, now).len(), 2);
        assert_eq!(s.end_reason(), Some(GameEndReason::Completed));
        assert!(s.is_ended());
    }

    #[test]
    fn disconnect_tells_the_partner_only() {
        let (mut s, _a, _b) = playing(1);
        let outbox = s.on_player_disconnected(&"bob".into(), Instant::now());
        assert_eq!(outbox.len(), 1);
        assert_eq!(s.end_reason(), Some(GameEndReason::PartnerDisconnected));
        assert!(s.end(GameEndReason::Completed, Instant::now()).is_empty());
    }

    #[test]
    fn exclusion_requires_playing() {
        let (mut s, _a, _b) = session(1);
        let _ = s.begin_validation();
        assert!(s
            .on_player_excluded(&"alice".into(), &"bob".into(), "idle", Instant::now())
            .is_empty());
        assert_eq!(s.state(), SessionState::Validating);
    }

    #[test]
    fn signals_skip_the_sender() {
        let (mut s, _a, _b) = session(1);
        let _ = s.begin_validation();
        let payload = SignalPayload::Answer {
            sdp: "v=0".into(),
            generation: 0,
        };
        assert_eq!(s.relay_signal(&"alice".into(), payload).len(), 1);
    }

    #[test]
    fn backstop_ends_paused_game() {
        let (mut s, _a, _b) = playing(1);
        let t0 = Instant::now();
        let _ = s.on_connection_lost(&lost("alice"), t0, 0);
        let deadline = s.reconnection().backstop_deadline().unwrap();
        assert!(s.poll_backstop(t0, 0).is_empty());
        assert_eq!(s.poll_backstop(deadline, 0).len(), 2);
        assert_eq!(s.end_reason(), Some(GameEndReason::ReconnectionTimeout));
    }
}
