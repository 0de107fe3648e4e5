//! Reconnection sub-state of a playing game.
//!
//! The first loss report pauses the room; later reports only add to the
//! lost set. The room resumes once every player that reported a loss has
//! also reported recovery. Telemetry for research export accumulates here.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use mug_proto::messages::reconnect::{
    ConnectionLost, DisconnectionEvent, Pause, ReconnectionAttempt, ReconnectionData,
    ReconnectionOutcome, Resume,
};
use mug_proto::{GameId, SubjectId};
use tracing::{debug, info, warn};

/// Extra time the server waits past the participants' own timeout before
/// ending a paused game on its own.
pub const BACKSTOP_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionPhase {
    Connected,
    /// First loss reported, pause being broadcast.
    Pausing,
    Paused,
    /// Some, not all, lost players recovered.
    Reconnecting,
    Terminated,
}

impl ReconnectionPhase {
    fn can_transition_to(self, next: ReconnectionPhase) -> bool {
        use ReconnectionPhase::*;
        matches!(
            (self, next),
            (Connected, Pausing)
                | (Pausing, Paused)
                | (Paused, Reconnecting)
                | (Reconnecting, Paused | Connected)
                | (Pausing | Paused | Reconnecting, Terminated)
        )
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::Pausing | Self::Paused | Self::Reconnecting)
    }
}

#[derive(Debug)]
pub struct ReconnectionRecord {
    game_id: GameId,
    phase: ReconnectionPhase,
    timeout: Duration,
    lost: BTreeSet<SubjectId>,
    recovered: BTreeSet<SubjectId>,
    /// Monotonic and wall-clock start of the current pause.
    pause_started: Option<(Instant, u64)>,
    pause_frame: u32,
    /// The single server-side deadline of the current pause.
    backstop: Option<Instant>,
    data: ReconnectionData,
}

impl ReconnectionRecord {
    pub fn new(game_id: GameId, timeout: Duration) -> Self {
        Self {
            game_id,
            phase: ReconnectionPhase::Connected,
            timeout,
            lost: BTreeSet::new(),
            recovered: BTreeSet::new(),
            pause_started: None,
            pause_frame: 0,
            backstop: None,
            data: ReconnectionData::default(),
        }
    }

    pub fn phase(&self) -> ReconnectionPhase {
        self.phase
    }

    pub fn pause_frame(&self) -> u32 {
        self.pause_frame
    }

    pub fn data(&self) -> &ReconnectionData {
        &self.data
    }

    pub fn backstop_deadline(&self) -> Option<Instant> {
        self.backstop
    }

    fn transition_to(&mut self, next: ReconnectionPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(
                game_id = %self.game_id,
                from = ?self.phase,
                to = ?next,
                "Rejected invalid reconnection transition"
            );
            return false;
        }
        debug!(game_id = %self.game_id, from = ?self.phase, to = ?next, "Reconnection transition");
        self.phase = next;
        true
    }

    /// Record a loss report. Returns the pause to broadcast for the first
    /// report of a pause episode only.
    pub fn on_connection_lost(
        &mut self,
        report: &ConnectionLost,
        now: Instant,
        now_ms: u64,
    ) -> Option<Pause> {
        if self.phase == ReconnectionPhase::Terminated {
            debug!(game_id = %self.game_id, player = %report.player_id, "Loss after termination ignored");
            return None;
        }

        self.data.disconnections.push(DisconnectionEvent {
            timestamp_ms: report.timestamp_ms,
            frame_number: report.frame_number,
            detecting_player: report.player_id.clone(),
            ice_state: report.ice_state,
            channel_state: report.channel_state,
        });
        self.recovered.remove(&report.player_id);
        self.lost.insert(report.player_id.clone());

        if self.phase.is_paused() {
            if self.phase == ReconnectionPhase::Reconnecting {
                self.transition_to(ReconnectionPhase::Paused);
            }
            warn!(
                game_id = %self.game_id,
                player = %report.player_id,
                lost = self.lost.len(),
                "Redundant loss report, already paused"
            );
            return None;
        }

        self.transition_to(ReconnectionPhase::Pausing);
        self.pause_started = Some((now, now_ms));
        self.pause_frame = report.frame_number;
        self.backstop = Some(now + self.timeout + BACKSTOP_MARGIN);
        info!(
            game_id = %self.game_id,
            player = %report.player_id,
            pause_frame = report.frame_number,
            "Pausing game"
        );
        let pause = Pause {
            game_id: self.game_id.clone(),
            pause_frame: report.frame_number,
            detecting_player: report.player_id.clone(),
        };
        self.transition_to(ReconnectionPhase::Paused);
        Some(pause)
    }

    /// Record a recovery. Returns the resume to broadcast once every lost
    /// player has recovered.
    pub fn on_reconnection_success(
        &mut self,
        player: &SubjectId,
        restart_attempts: u32,
        now: Instant,
        now_ms: u64,
    ) -> Option<Resume> {
        if !self.phase.is_paused() {
            debug!(game_id = %self.game_id, %player, phase = ?self.phase, "Recovery outside pause ignored");
            return None;
        }

        self.recovered.insert(player.clone());
        if self.phase == ReconnectionPhase::Paused {
            self.transition_to(ReconnectionPhase::Reconnecting);
        }
        info!(
            game_id = %self.game_id,
            %player,
            restart_attempts,
            recovered = self.recovered.len(),
            lost = self.lost.len(),
            "Player recovered"
        );

        if !self.recovered.is_superset(&self.lost) {
            return None;
        }

        self.backstop = None;
        self.close_pause(now, now_ms, ReconnectionOutcome::Recovered);
        self.lost.clear();
        self.recovered.clear();
        self.transition_to(ReconnectionPhase::Connected);
        info!(game_id = %self.game_id, "All players recovered, resuming");
        Some(Resume {
            game_id: self.game_id.clone(),
        })
    }

    /// A participant's reconnection timeout elapsed. Returns true the first
    /// time, when the game must end.
    pub fn on_timeout(&mut self, player: &SubjectId, now: Instant, now_ms: u64) -> bool {
        if !self.phase.is_paused() {
            debug!(game_id = %self.game_id, %player, phase = ?self.phase, "Timeout outside pause ignored");
            return false;
        }
        warn!(game_id = %self.game_id, %player, "Reconnection timed out");
        self.terminate(now, now_ms)
    }

    /// Check the backstop deadline. Returns true when it expired and the
    /// game must end.
    pub fn poll_backstop(&mut self, now: Instant, now_ms: u64) -> bool {
        match self.backstop {
            Some(deadline) if deadline <= now && self.phase.is_paused() => {
                warn!(game_id = %self.game_id, "No timeout report from participants, ending game");
                self.terminate(now, now_ms)
            }
            _ => false,
        }
    }

    /// Account for a pause still open when the game ends for another reason.
    pub fn close_open_pause(&mut self, now: Instant) {
        if let Some((started, _)) = self.pause_started.take() {
            self.data.total_pause_duration_ms += elapsed_ms(started, now);
        }
        self.backstop = None;
    }

    fn terminate(&mut self, now: Instant, now_ms: u64) -> bool {
        self.backstop = None;
        self.close_pause(now, now_ms, ReconnectionOutcome::TimedOut);
        self.transition_to(ReconnectionPhase::Terminated)
    }

    fn close_pause(&mut self, now: Instant, now_ms: u64, outcome: ReconnectionOutcome) {
        let Some((started, started_ms)) = self.pause_started.take() else {
            return;
        };
        let duration_ms = elapsed_ms(started, now);
        self.data.total_pause_duration_ms += duration_ms;
        self.data.reconnection_attempts.push(ReconnectionAttempt {
            timestamp_ms: started_ms.min(now_ms),
            duration_ms,
            outcome,
        });
    }
}

fn elapsed_ms(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use mug_proto::messages::reconnect::{DataChannelState, IceConnectionState};

    fn record() -> ReconnectionRecord {
        ReconnectionRecord::new(GameId::from("g"), Duration::from_secs(30))
    }

    fn lost(player: &str, frame: u32) -> ConnectionLost {
        ConnectionLost {
            game_id: GameId::from("g"),
            player_id: player.into(),
            frame_number: frame,
            timestamp_ms: 1_000,
            ice_state: IceConnectionState::Disconnected,
            channel_state: DataChannelState::Open,
        }
    }

    #[test]
    fn two_reports_pause_once() {
        let mut rec = record();
        let t0 = Instant::now();

        let pause = rec.on_connection_lost(&lost("alice", 120), t0, 1_000);
        let second = rec.on_connection_lost(
            &lost("bob", 121),
            t0 + Duration::from_millis(50),
            1_050,
        );

        let pause = pause.expect("first report pauses");
        assert_eq!(pause.pause_frame, 120);
        assert_eq!(pause.detecting_player, "alice");
        assert!(second.is_none());
        assert_eq!(rec.phase(), ReconnectionPhase::Paused);
        assert_eq!(rec.data().disconnections.len(), 2);
    }

    #[test]
    fn resume_requires_every_lost_player() {
        let mut rec = record();
        let t0 = Instant::now();
        rec.on_connection_lost(&lost("alice", 10), t0, 1_000);
        rec.on_connection_lost(&lost("bob", 10), t0, 1_000);

        let alice = "alice".to_string();
        let bob = "bob".to_string();
        assert!(rec.on_reconnection_success(&alice, 1, t0, 1_000).is_none());
        assert_eq!(rec.phase(), ReconnectionPhase::Reconnecting);

        let later = t0 + Duration::from_millis(2_500);
        assert!(rec.on_reconnection_success(&bob, 1, later, 3_500).is_some());
        assert_eq!(rec.phase(), ReconnectionPhase::Connected);
        assert!(rec.on_reconnection_success(&bob, 1, later, 3_500).is_none());

        let data = rec.data();
        assert_eq!(data.total_pause_duration_ms, 2_500);
        assert_eq!(data.reconnection_attempts.len(), 1);
        assert_eq!(
            data.reconnection_attempts[0].outcome,
            ReconnectionOutcome::Recovered
        );
        assert_eq!(rec.backstop_deadline(), None);
    }

    #[test]
    fn new_loss_while_reconnecting_needs_another_recovery() {
        let mut rec = record();
        let t0 = Instant::now();
        rec.on_connection_lost(&lost("alice", 10), t0, 0);
        rec.on_connection_lost(&lost("bob", 10), t0, 0);
        assert!(rec.on_reconnection_success(&"alice".into(), 1, t0, 0).is_none());
        // Alice drops again before Bob recovers.
        assert!(rec.on_connection_lost(&lost("alice", 11), t0, 0).is_none());
        assert_eq!(rec.phase(), ReconnectionPhase::Paused);
        assert!(rec.on_reconnection_success(&"bob".into(), 1, t0, 0).is_none());
        assert_eq!(rec.phase(), ReconnectionPhase::Reconnecting);
        assert!(rec.on_reconnection_success(&"alice".into(), 2, t0, 0).is_some());
    }

    #[test]
    fn transitions_follow_the_edge_table() {
        let mut rec = record();
        assert!(!rec.transition_to(ReconnectionPhase::Reconnecting));
        assert!(!rec.transition_to(ReconnectionPhase::Terminated));
        assert_eq!(rec.phase(), ReconnectionPhase::Connected);

        for next in [
            ReconnectionPhase::Pausing,
            ReconnectionPhase::Paused,
            ReconnectionPhase::Reconnecting,
            ReconnectionPhase::Paused,
            ReconnectionPhase::Reconnecting,
            ReconnectionPhase::Connected,
        ] {
            assert!(rec.transition_to(next), "{next:?}");
        }
        assert!(!rec.transition_to(ReconnectionPhase::Paused));
    }

    #[test]
    fn timeout_terminates_once() {
        let mut rec = record();
        let t0 = Instant::now();
        rec.on_connection_lost(&lost("alice", 10), t0, 0);
        let later = t0 + Duration::from_secs(30);
        assert!(rec.on_timeout(&"alice".into(), later, 30_000));
        assert!(!rec.on_timeout(&"bob".into(), later, 30_000));
        assert_eq!(rec.phase(), ReconnectionPhase::Terminated);
        assert_eq!(
            rec.data().reconnection_attempts[0].outcome,
            ReconnectionOutcome::TimedOut
        );
        // Late reports after termination change nothing.
        assert!(rec.on_connection_lost(&lost("bob", 12), later, 30_000).is_none());
        assert!(rec.on_reconnection_success(&"alice".into(), 1, later, 0).is_none());
    }

    #[test]
    fn backstop_fires_after_timeout_and_margin() {
        let mut rec = record();
        let t0 = Instant::now();
        rec.on_connection_lost(&lost("alice", 10), t0, 0);
        let deadline = rec.backstop_deadline().unwrap();
        assert_eq!(deadline, t0 + Duration::from_secs(35));
        assert!(!rec.poll_backstop(deadline - Duration::from_millis(1), 0));
        assert!(rec.poll_backstop(deadline, 0));
        assert!(!rec.poll_backstop(deadline, 0));
    }

    #[test]
    fn success_without_pause_is_ignored() {
        let mut rec = record();
        assert!(rec
            .on_reconnection_success(&"alice".into(), 0, Instant::now(), 0)
            .is_none());
        assert_eq!(rec.phase(), ReconnectionPhase::Connected);
    }
}
