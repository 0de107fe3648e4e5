use std::time::Instant;

use mug_proto::messages::matchmaking::WaitingForMatch;
use mug_proto::messages::reconnect::GameEndReason;
use mug_proto::{GameId, SubjectId};
use tracing::{debug, info, warn};

use super::{MatchCandidate, Matchmaker};
use crate::config::SceneConfig;
use crate::game::{GameManager, GameSession, Player};
use crate::net::inbound::ConnId;
use crate::net::outbound::{OutboundTx, Outbox};
use crate::research::{MatchLog, MatchRecord};
use crate::unix_ms;

/// A participant in the waiting pool.
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub candidate: MatchCandidate,
    pub conn_id: ConnId,
    pub outbound: OutboundTx,
    pub since: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Pooled; the number of participants now waiting.
    Waiting(usize),
    Matched(GameId),
}

/// Waiting pool of one scene.
pub struct MatchLobby {
    scene_id: String,
    scene: SceneConfig,
    matchmaker: Box<dyn Matchmaker>,
    waiting: Vec<WaitingEntry>,
    match_log: Option<MatchLog>,
}

impl MatchLobby {
    pub fn new(scene_id: impl Into<String>, scene: SceneConfig, match_log: Option<MatchLog>) -> Self {
        let matchmaker = scene.matchmaker.build();
        Self::with_matchmaker(scene_id, scene, matchmaker, match_log)
    }

    pub fn with_matchmaker(
        scene_id: impl Into<String>,
        scene: SceneConfig,
        matchmaker: Box<dyn Matchmaker>,
        match_log: Option<MatchLog>,
    ) -> Self {
        Self {
            scene_id: scene_id.into(),
            scene,
            matchmaker,
            waiting: Vec::new(),
            match_log,
        }
    }

    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_waiting(&self, subject: &SubjectId) -> bool {
        self.waiting.iter().any(|w| &w.candidate.subject_id == subject)
    }

    /// Offer `entry` to the matchmaker. A formed group becomes a new session
    /// in `games`; otherwise `entry` joins the pool.
    pub fn request(&mut self, entry: WaitingEntry, games: &mut GameManager) -> (MatchOutcome, Outbox) {
        self.waiting
            .retain(|w| w.candidate.subject_id != entry.candidate.subject_id);

        let pool: Vec<MatchCandidate> = self.waiting.iter().map(|w| w.candidate.clone()).collect();
        let group = self
            .matchmaker
            .find_match(&entry.candidate, &pool, self.scene.group_size)
            .filter(|group| self.is_valid_group(group, &entry.candidate, &pool));

        let Some(group) = group else {
            debug!(
                scene_id = %self.scene_id,
                subject = %entry.candidate.subject_id,
                waiting = self.waiting.len() + 1,
                "Participant waiting for match"
            );
            self.waiting.push(entry);
            return (MatchOutcome::Waiting(self.waiting.len()), self.waiting_updates());
        };

        let mut players = Vec::with_capacity(group.len());
        for member in &group {
            if member.subject_id == entry.candidate.subject_id {
                players.push(Player::new(
                    entry.candidate.subject_id.clone(),
                    entry.conn_id,
                    entry.outbound.clone(),
                    entry.candidate.rtt_ms,
                ));
            } else if let Some(pos) = self
                .waiting
                .iter()
                .position(|w| w.candidate.subject_id == member.subject_id)
            {
                let w = self.waiting.remove(pos);
                players.push(Player::new(
                    w.candidate.subject_id,
                    w.conn_id,
                    w.outbound,
                    w.candidate.rtt_ms,
                ));
            }
        }

        let game_id = GameId::from_bytes(rand::random());
        let mut session = GameSession::new(
            game_id.clone(),
            self.scene_id.clone(),
            players,
            &self.scene,
            rand::random(),
        );
        let mut outbox = session.begin_validation();
        self.log_match(&session, &group);
        info!(
            scene_id = %self.scene_id,
            %game_id,
            matchmaker = self.matchmaker.name(),
            players = ?group.iter().map(|c| c.subject_id.as_str()).collect::<Vec<_>>(),
            "Match formed"
        );
        games.insert(session);
        outbox.append(self.waiting_updates());
        (MatchOutcome::Matched(game_id), outbox)
    }

    /// Run another validation round for a group whose peer check failed.
    ///
    /// The matchmaker is asked to confirm the same group again; a refusal or
    /// exhausted attempts end the game with `ValidationFailed`.
    pub fn rematch(&mut self, session: &mut GameSession, now: Instant) -> Outbox {
        if !session.can_retry_validation() {
            warn!(
                game_id = %session.game_id(),
                attempts = session.validation_attempt(),
                "Validation attempts exhausted"
            );
            return session.end(GameEndReason::ValidationFailed, now);
        }

        let members: Vec<MatchCandidate> = session
            .players()
            .iter()
            .map(|p| MatchCandidate {
                subject_id: p.subject_id.clone(),
                rtt_ms: p.rtt_ms,
            })
            .collect();
        let Some((arriving, rest)) = members.split_last() else {
            return session.end(GameEndReason::ValidationFailed, now);
        };

        let confirmed = self
            .matchmaker
            .find_match(arriving, rest, members.len())
            .is_some_and(|group| same_members(&group, &members));
        if !confirmed {
            info!(game_id = %session.game_id(), "Matchmaker declined re-match");
            return session.end(GameEndReason::ValidationFailed, now);
        }

        let outbox = session.restart_validation();
        self.log_match(session, &members);
        outbox
    }

    /// Drop `subject` from the pool. Returns the count updates for the
    /// remaining waiters, or `None` if it was not waiting.
    pub fn remove(&mut self, subject: &SubjectId) -> Option<Outbox> {
        let before = self.waiting.len();
        self.waiting.retain(|w| &w.candidate.subject_id != subject);
        if self.waiting.len() == before {
            return None;
        }
        debug!(scene_id = %self.scene_id, %subject, "Participant left waiting pool");
        Some(self.waiting_updates())
    }

    fn is_valid_group(
        &self,
        group: &[MatchCandidate],
        arriving: &MatchCandidate,
        pool: &[MatchCandidate],
    ) -> bool {
        let valid = group.len() == self.scene.group_size
            && group.iter().any(|c| c.subject_id == arriving.subject_id)
            && group.iter().enumerate().all(|(i, c)| {
                let known = c.subject_id == arriving.subject_id
                    || pool.iter().any(|p| p.subject_id == c.subject_id);
                let unique = group[..i].iter().all(|o| o.subject_id != c.subject_id);
                known && unique
            });
        if !valid {
            warn!(
                scene_id = %self.scene_id,
                matchmaker = self.matchmaker.name(),
                "Matchmaker returned an invalid group, ignoring"
            );
        }
        valid
    }

    fn waiting_updates(&self) -> Outbox {
        let mut outbox = Outbox::new();
        let msg = WaitingForMatch {
            scene_id: self.scene_id.clone(),
            waiting: self.waiting.len() as u32,
        };
        let recipients: Vec<OutboundTx> = self.waiting.iter().map(|w| w.outbound.clone()).collect();
        outbox.broadcast(&recipients, &msg);
        outbox
    }

    fn log_match(&self, session: &GameSession, group: &[MatchCandidate]) {
        let Some(log) = &self.match_log else {
            return;
        };
        let record = MatchRecord {
            timestamp_ms: unix_ms(),
            scene_id: self.scene_id.clone(),
            game_id: session.game_id().clone(),
            players: group.iter().map(|c| c.subject_id.clone()).collect(),
            rtt_ms: group.iter().map(|c| c.rtt_ms).collect(),
            matchmaker: self.matchmaker.name().to_string(),
            validation_attempt: session.validation_attempt(),
        };
        if let Err(e) = log.append(&record) {
            warn!(scene_id = %self.scene_id, error = %e, "Failed to append match log");
        }
    }
}

fn same_members(a: &[MatchCandidate], b: &[MatchCandidate]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| y.subject_id == x.subject_id))
}
