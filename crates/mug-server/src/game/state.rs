use std::fmt;

use mug_proto::GameId;
use tracing::{info, warn};

/// Lifecycle of one game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Group not (or no longer) matched.
    Waiting,
    /// Group formed, participants notified.
    Matched,
    /// Participants are checking their peer connection.
    Validating,
    Playing,
    /// Terminal; the session is destroyed.
    Ended,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        Self::Waiting,
        Self::Matched,
        Self::Validating,
        Self::Playing,
        Self::Ended,
    ];

    /// The allowed edge set.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Waiting, Matched)
                | (Matched, Validating)
                | (Validating, Playing)
                | (Validating, Waiting)
                | (Validating, Ended)
                | (Playing, Ended)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Matched => "MATCHED",
            Self::Validating => "VALIDATING",
            Self::Playing => "PLAYING",
            Self::Ended => "ENDED",
        };
        f.write_str(s)
    }
}

/// Holder of a [`SessionState`] that can only change along allowed edges.
#[derive(Debug)]
pub struct StateCell {
    game_id: GameId,
    state: SessionState,
}

impl StateCell {
    pub fn new(game_id: GameId) -> Self {
        Self {
            game_id,
            state: SessionState::Waiting,
        }
    }

    pub fn get(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Invalid edges are logged and leave the state
    /// unchanged.
    pub fn transition_to(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                game_id = %self.game_id,
                from = %self.state,
                to = %next,
                "Rejected invalid session transition"
            );
            return false;
        }
        info!(game_id = %self.game_id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    fn cell_in(state: SessionState) -> StateCell {
        StateCell {
            game_id: GameId::from("g"),
            state,
        }
    }

    #[test]
    fn only_documented_edges_succeed() {
        let allowed = [
            (Waiting, Matched),
            (Matched, Validating),
            (Validating, Playing),
            (Validating, Waiting),
            (Validating, Ended),
            (Playing, Ended),
        ];
        let mut accepted = 0;
        for from in SessionState::ALL {
            for to in SessionState::ALL {
                let mut cell = cell_in(from);
                let ok = cell.transition_to(to);
                assert_eq!(ok, allowed.contains(&(from, to)), "{from} -> {to}");
                if ok {
                    accepted += 1;
                    assert_eq!(cell.get(), to);
                } else {
                    assert_eq!(cell.get(), from);
                }
            }
        }
        assert_eq!(accepted, allowed.len());
    }

    #[test]
    fn ended_is_terminal() {
        let mut cell = cell_in(Ended);
        for to in SessionState::ALL {
            assert!(!cell.transition_to(to));
        }
        assert_eq!(cell.get(), Ended);
    }

    #[test]
    fn starts_waiting() {
        assert_eq!(StateCell::new(GameId::from("g")).get(), Waiting);
    }
}
