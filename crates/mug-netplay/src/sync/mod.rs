//! Rollback synchronization.
//!
//! Remote inputs are predicted and the simulation runs ahead; when a
//! confirmed input contradicts a prediction the session restores the
//! nearest snapshot and replays forward in one worker round-trip.

pub mod input_history;
pub mod session;
pub mod snapshot;

pub use input_history::InputHistory;
pub use session::{DesyncEvent, FrameAdvance, PeerUpdate, RollbackInfo, RollbackSession, RollbackStats};
pub use snapshot::{SnapshotStore, StateSnapshot};
