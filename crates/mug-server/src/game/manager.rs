use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use mug_proto::{GameId, SubjectId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::session::GameSession;
use crate::net::outbound::Outbox;
use crate::research::{TelemetryRecord, TelemetryWriter};

/// A game session behind its own lock.
pub type SharedSession = Arc<Mutex<GameSession>>;

/// Live games and the participant→game index.
///
/// An ended game's entry is removed, never reused; its telemetry is exported
/// on the way out.
#[derive(Debug, Default)]
pub struct GameManager {
    games: HashMap<GameId, SharedSession>,
    by_subject: HashMap<SubjectId, GameId>,
    telemetry: Option<TelemetryWriter>,
}

impl GameManager {
    pub fn new(telemetry: Option<TelemetryWriter>) -> Self {
        Self {
            games: HashMap::new(),
            by_subject: HashMap::new(),
            telemetry,
        }
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Register a freshly matched session. Only the matchmaking lobby calls
    /// this.
    pub(crate) fn insert(&mut self, session: GameSession) -> SharedSession {
        let game_id = session.game_id().clone();
        for player in session.players() {
            if let Some(previous) = self
                .by_subject
                .insert(player.subject_id.clone(), game_id.clone())
            {
                warn!(subject = %player.subject_id, %previous, "Participant was still indexed to another game");
            }
        }
        let shared = Arc::new(Mutex::new(session));
        self.games.insert(game_id, shared.clone());
        shared
    }

    pub fn get(&self, game_id: &GameId) -> Option<SharedSession> {
        self.games.get(game_id).cloned()
    }

    /// The live game `subject` plays in.
    pub fn game_of(&self, subject: &SubjectId) -> Option<(GameId, SharedSession)> {
        let game_id = self.by_subject.get(subject)?;
        let session = self.games.get(game_id)?;
        Some((game_id.clone(), session.clone()))
    }

    pub fn contains_subject(&self, subject: &SubjectId) -> bool {
        self.by_subject.contains_key(subject)
    }

    /// Drop `game_id` if it has ended. Returns true when it was removed.
    pub fn remove_if_ended(&mut self, game_id: &GameId) -> bool {
        let Some(shared) = self.games.get(game_id) else {
            return false;
        };
        let record = {
            let session = shared.lock();
            if !session.is_ended() {
                return false;
            }
            TelemetryRecord::from_session(&session)
        };

        self.games.remove(game_id);
        self.by_subject.retain(|_, g| g != game_id);
        info!(%game_id, reason = ?record.end_reason, live_games = self.games.len(), "Game removed");

        if let Some(writer) = &self.telemetry {
            match writer.write(&record) {
                Ok(path) => debug!(%game_id, path = %path.display(), "Reconnection telemetry exported"),
                Err(e) => warn!(%game_id, error = %e, "Failed to export reconnection telemetry"),
            }
        }
        true
    }

    /// Fire expired pause deadlines and remove the games they end.
    pub fn sweep(&mut self, now: Instant, now_ms: u64) -> Outbox {
        let mut outbox = Outbox::new();
        let mut ended = Vec::new();
        for (game_id, shared) in &self.games {
            let mut session = shared.lock();
            outbox.append(session.poll_backstop(now, now_ms));
            if session.is_ended() {
                ended.push(game_id.clone());
            }
        }
        for game_id in ended {
            self.remove_if_ended(&game_id);
        }
        outbox
    }
}
