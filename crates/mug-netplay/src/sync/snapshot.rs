//! Snapshot ring for rollback.
//!
//! Snapshots are taken every `interval` frames into a fixed ring of
//! `capacity` slots. Slot of a snapshot frame `f` is
//! `(f / interval) % capacity`, so lookups are O(1) and the newest
//! `interval * capacity` frames are always covered.

use mug_proto::messages::peer::StateHash;

use crate::env::RngState;

/// Environment + RNG state before the inputs of `frame` are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub frame: u32,
    pub env_state: Vec<u8>,
    pub rng: RngState,
    pub cumulative_rewards: Vec<f64>,
    pub hash: StateHash,
}

#[derive(Debug)]
pub struct SnapshotStore {
    slots: Vec<Option<StateSnapshot>>,
    interval: u32,
    newest: Option<u32>,
}

impl SnapshotStore {
    pub fn new(capacity: usize, interval: u32) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            interval: interval.max(1),
            newest: None,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether `frame` falls on the snapshot cadence.
    pub fn should_save(&self, frame: u32) -> bool {
        frame % self.interval == 0
    }

    fn slot_of(&self, frame: u32) -> usize {
        (frame / self.interval) as usize % self.slots.len()
    }

    /// Store `snapshot`, evicting whatever occupied its slot. Off-cadence
    /// snapshots are ignored.
    pub fn save(&mut self, snapshot: StateSnapshot) -> bool {
        if !self.should_save(snapshot.frame) {
            return false;
        }
        let idx = self.slot_of(snapshot.frame);
        self.newest = self.newest.max(Some(snapshot.frame));
        self.slots[idx] = Some(snapshot);
        true
    }

    /// Newest snapshot at or before `frame`. The caller replays
    /// `frame - snapshot.frame` steps from it.
    pub fn restore(&self, frame: u32) -> Option<&StateSnapshot> {
        let mut candidate = (frame - frame % self.interval).min(self.newest?);
        for _ in 0..self.slots.len() {
            if let Some(snap) = &self.slots[self.slot_of(candidate)]
                && snap.frame == candidate
            {
                return Some(snap);
            }
            candidate = candidate.checked_sub(self.interval)?;
        }
        None
    }

    pub fn get(&self, frame: u32) -> Option<&StateSnapshot> {
        self.slots[self.slot_of(frame)]
            .as_ref()
            .filter(|s| s.frame == frame)
    }

    /// Drop snapshots taken after `frame`; they belong to a timeline that
    /// is about to be replayed.
    pub fn discard_after(&mut self, frame: u32) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.frame > frame) {
                *slot = None;
            }
        }
        self.newest = self.newest_frame();
    }

    pub fn oldest(&self) -> Option<&StateSnapshot> {
        self.slots.iter().flatten().min_by_key(|s| s.frame)
    }

    pub fn oldest_frame(&self) -> Option<u32> {
        self.oldest().map(|s| s.frame)
    }

    pub fn newest_frame(&self) -> Option<u32> {
        self.slots.iter().flatten().map(|s| s.frame).max()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.newest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(frame: u32) -> StateSnapshot {
        StateSnapshot {
            frame,
            env_state: vec![frame as u8],
            rng: RngState {
                seed: [0; 32],
                stream: 0,
                word_pos: 0,
            },
            cumulative_rewards: Vec::new(),
            hash: [frame as u8; 32],
        }
    }

    #[test]
    fn restore_rounds_down_to_snapshot() {
        let mut store = SnapshotStore::new(4, 5);
        for f in [0, 5, 10, 15] {
            assert!(store.save(snap(f)));
        }
        assert_eq!(store.restore(12).map(|s| s.frame), Some(10));
        assert_eq!(store.restore(10).map(|s| s.frame), Some(10));
        assert_eq!(store.restore(4).map(|s| s.frame), Some(0));
        assert_eq!(store.restore(99).map(|s| s.frame), Some(15));
    }

    #[test]
    fn off_cadence_snapshots_rejected() {
        let mut store = SnapshotStore::new(4, 5);
        assert!(!store.save(snap(3)));
        assert!(store.is_empty());
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut store = SnapshotStore::new(3, 5);
        for f in (0..=25).step_by(5) {
            store.save(snap(f));
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.oldest_frame(), Some(15));
        assert_eq!(store.newest_frame(), Some(25));
        assert!(store.restore(12).is_none());
        assert!(store.get(10).is_none());
    }

    #[test]
    fn discard_after_forgets_future() {
        let mut store = SnapshotStore::new(8, 5);
        for f in (0..=20).step_by(5) {
            store.save(snap(f));
        }
        store.discard_after(10);
        assert_eq!(store.newest_frame(), Some(10));
        assert_eq!(store.restore(19).map(|s| s.frame), Some(10));
    }
}
