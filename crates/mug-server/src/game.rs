//! Game sessions on the server.
//!
//! A [`session::GameSession`] is created only by the matchmaking lobby and
//! owned by the [`manager::GameManager`] until it reaches
//! [`state::SessionState::Ended`], at which point its map entry is removed.

pub mod manager;
pub mod reconnection;
pub mod session;
pub mod state;

pub use manager::{GameManager, SharedSession};
pub use reconnection::{ReconnectionPhase, ReconnectionRecord};
pub use session::{GameSession, Player};
pub use state::SessionState;
