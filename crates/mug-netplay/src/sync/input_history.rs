//! Confirmed and used inputs per player slot.
//!
//! Remote inputs are predicted by repeating the newest confirmed action at
//! or before the frame. Every simulated frame records the actions it was
//! actually stepped with; a confirmed input that differs from the recorded
//! one marks that frame as the rollback target.

use std::collections::BTreeMap;
use std::ops::Range;

use mug_proto::messages::peer::Action;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct InputHistory {
    /// Confirmed inputs per slot (frame -> action).
    confirmed: Vec<BTreeMap<u32, Action>>,
    /// First frame per slot that is not confirmed contiguously.
    next_missing: Vec<u32>,
    /// Actions each simulated frame was stepped with.
    used: BTreeMap<u32, Vec<Action>>,
    /// Next frame to simulate.
    current_frame: u32,
    /// Earliest mispredicted frame, if any.
    pending_rollback: Option<u32>,
    /// Frames of history kept behind the current frame.
    window: u32,
}

impl InputHistory {
    pub fn new(num_players: usize, window: u32) -> Self {
        Self {
            confirmed: vec![BTreeMap::new(); num_players],
            next_missing: vec![0; num_players],
            used: BTreeMap::new(),
            current_frame: 0,
            pending_rollback: None,
            window: window.max(1),
        }
    }

    pub fn num_players(&self) -> usize {
        self.confirmed.len()
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    pub fn set_current_frame(&mut self, frame: u32) {
        self.current_frame = frame;
        if frame % 60 == 0 {
            self.prune(frame.saturating_sub(self.window));
        }
    }

    /// Oldest frame that can still be corrected.
    pub fn horizon(&self) -> u32 {
        self.current_frame.saturating_sub(self.window)
    }

    /// Record a confirmed action. Returns true if it contradicts what was
    /// simulated for `frame`.
    pub fn add_confirmed(&mut self, slot: usize, frame: u32, action: Action) -> bool {
        if slot >= self.confirmed.len() {
            warn!(slot, "Input for unknown slot dropped");
            return false;
        }
        let too_old = frame < self.horizon();
        if too_old {
            debug!(slot, frame, horizon = self.horizon(), "Input older than rollback window");
        }

        let mispredicted = !too_old
            && frame < self.current_frame
            && self
                .used
                .get(&frame)
                .and_then(|used| used.get(slot))
                .is_some_and(|&used| used != action);

        if mispredicted {
            let target = self.pending_rollback.map_or(frame, |t| t.min(frame));
            debug!(slot, frame, target, "Misprediction");
            self.pending_rollback = Some(target);
        }

        let inputs = &mut self.confirmed[slot];
        inputs.insert(frame, action);
        let mut next = self.next_missing[slot];
        while inputs.contains_key(&next) {
            next += 1;
        }
        self.next_missing[slot] = next;
        mispredicted
    }

    /// Settle `frames` of `slot` that will never be confirmed by the peer:
    /// whatever they were simulated with becomes final. A wrong guess shows
    /// up later as a checksum mismatch.
    pub fn abandon(&mut self, slot: usize, frames: Range<u32>) {
        if slot >= self.confirmed.len() {
            return;
        }
        let start = frames.start.max(self.next_missing[slot]);
        for frame in start..frames.end {
            if self.confirmed[slot].contains_key(&frame) {
                continue;
            }
            let action = self
                .used
                .get(&frame)
                .and_then(|used| used.get(slot).copied())
                .unwrap_or_else(|| self.predict(slot, frame));
            self.confirmed[slot].insert(frame, action);
        }
        let mut next = self.next_missing[slot];
        while self.confirmed[slot].contains_key(&next) {
            next += 1;
        }
        self.next_missing[slot] = next;
        debug!(slot, ?frames, next_missing = next, "Inputs abandoned");
    }

    /// Confirmed action, or the newest confirmed action before `frame`.
    pub fn predict(&self, slot: usize, frame: u32) -> Action {
        self.confirmed
            .get(slot)
            .and_then(|m| m.range(..=frame).next_back())
            .map_or(0, |(_, &a)| a)
    }

    /// Actions to step `frame` with, slot order.
    pub fn inputs_for(&self, frame: u32) -> Vec<Action> {
        (0..self.confirmed.len())
            .map(|slot| self.predict(slot, frame))
            .collect()
    }

    pub fn record_used(&mut self, frame: u32, actions: Vec<Action>) {
        self.used.insert(frame, actions);
    }

    /// Newest frame for which every slot's input is confirmed contiguously.
    pub fn confirmed_frame(&self) -> Option<u32> {
        self.next_missing
            .iter()
            .min()
            .and_then(|&n| n.checked_sub(1))
    }

    /// Contiguously confirmed frame of one slot.
    pub fn slot_confirmed_frame(&self, slot: usize) -> Option<u32> {
        self.next_missing.get(slot)?.checked_sub(1)
    }

    pub fn pending_rollback(&self) -> Option<u32> {
        self.pending_rollback
    }

    pub fn take_rollback(&mut self) -> Option<u32> {
        self.pending_rollback.take()
    }

    /// Forget inputs before `frame`.
    pub fn prune(&mut self, frame: u32) {
        for inputs in &mut self.confirmed {
            // Keep the newest entry below the cut so prediction still has a
            // last-known action.
            let last_before = inputs.range(..frame).next_back().map(|(&f, _)| f);
            inputs.retain(|&f, _| f >= frame || Some(f) == last_before);
        }
        self.used = self.used.split_off(&frame);
    }

    pub fn clear(&mut self) {
        let players = self.confirmed.len();
        *self = Self::new(players, self.window);
    }
}
