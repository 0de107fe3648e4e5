//! Redundant input transmission over the unordered data channel.
//!
//! Each outbound packet carries the newest local action, at least
//! `redundancy - 1` earlier ones, and every older action the peer has not
//! acknowledged yet. A dropped packet is covered by the next one; an outage
//! of any length up to [`MAX_INPUT_BACKLOG`] frames is covered by the first
//! packet after it. The receiving side rebuilds ordering from the embedded
//! frame numbers alone.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use mug_proto::constants::MAX_INPUT_BACKLOG;
use mug_proto::messages::peer::{Action, FrameChecksum, InputPacket};
use tracing::{trace, warn};

/// Outbound half: keeps local actions until the peer acknowledges them.
#[derive(Debug)]
pub struct InputSender {
    player_index: u8,
    episode: u32,
    redundancy: usize,
    /// `(frame, action)`, oldest first, frames contiguous. Every frame after
    /// `acked`, and never fewer than `redundancy` frames.
    backlog: VecDeque<(u32, Action)>,
    acked: Option<u32>,
}

impl InputSender {
    pub fn new(player_index: u8, redundancy: usize) -> Self {
        let redundancy = redundancy.clamp(1, MAX_INPUT_BACKLOG);
        Self {
            player_index,
            episode: 0,
            redundancy,
            backlog: VecDeque::with_capacity(redundancy),
            acked: None,
        }
    }

    pub fn player_index(&self) -> u8 {
        self.player_index
    }

    /// Record the local action for `frame`. A non-contiguous frame (after a
    /// reset) restarts the backlog.
    pub fn record(&mut self, frame: u32, action: Action) {
        if let Some(&(last, _)) = self.backlog.back()
            && frame != last + 1
        {
            trace!(frame, last, "Local input not contiguous, restarting backlog");
            self.backlog.clear();
        }
        self.backlog.push_back((frame, action));
        self.trim();
    }

    /// The peer holds every frame up to `frame`. Stale acknowledgements
    /// are ignored.
    pub fn acknowledge(&mut self, frame: u32) {
        if self.acked.is_none_or(|acked| frame > acked) {
            self.acked = Some(frame);
            self.trim();
        }
    }

    /// Local frames the peer has not acknowledged.
    pub fn unacked(&self) -> usize {
        let acked = self.acked;
        self.backlog
            .iter()
            .filter(|&&(f, _)| acked.is_none_or(|a| f > a))
            .count()
    }

    fn trim(&mut self) {
        let acked = self.acked;
        while self.backlog.len() > self.redundancy
            && self
                .backlog
                .front()
                .is_some_and(|&(f, _)| acked.is_some_and(|a| f <= a))
        {
            self.backlog.pop_front();
        }
        let overflow = self.backlog.len().saturating_sub(MAX_INPUT_BACKLOG);
        if overflow > 0 {
            self.backlog.drain(..overflow);
            warn!(
                dropped = overflow,
                "Input backlog full, oldest unacknowledged inputs given up"
            );
        }
    }

    /// Packet whose newest action is `frame`, starting at the oldest frame
    /// still held. `None` if `frame` was never recorded or has been trimmed.
    pub fn packet_for(
        &self,
        frame: u32,
        checksum: Option<FrameChecksum>,
        ack_frame: Option<u32>,
    ) -> Option<InputPacket> {
        let end = self.backlog.iter().position(|&(f, _)| f == frame)?;
        let actions: Vec<Action> = self.backlog.iter().take(end + 1).map(|&(_, a)| a).collect();
        let base_frame = self.backlog.front().map(|&(f, _)| f)?;
        Some(InputPacket {
            player_index: self.player_index,
            episode: self.episode,
            base_frame,
            actions,
            checksum,
            ack_frame,
        })
    }

    /// Start a new episode; frame numbers restart.
    pub fn set_episode(&mut self, episode: u32) {
        self.episode = episode;
        self.backlog.clear();
        self.acked = None;
    }
}

/// Result of feeding one packet into the receiver.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Actions not seen before, in frame order.
    pub fresh: Vec<(u32, Action)>,
    /// Frames the sender no longer holds; they will never arrive.
    pub abandoned: Option<Range<u32>>,
}

#[derive(Debug, Default)]
struct SlotState {
    /// First frame not yet received.
    next_expected: u32,
    latest_checksum: Option<FrameChecksum>,
}

/// Inbound half: per remote slot, deduplicates redundant copies and tracks
/// the contiguous received frame.
///
/// A packet runs without gaps from the sender's oldest unacknowledged
/// frame, so it either reaches the next expected frame or proves the frames
/// below its base were given up. Nothing is ever buffered beyond a gap.
#[derive(Debug, Default)]
pub struct InputReceiver {
    episode: u32,
    slots: HashMap<u8, SlotState>,
}

impl InputReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `slot` from `first_frame`.
    pub fn track(&mut self, slot: u8, first_frame: u32) {
        self.slots.insert(
            slot,
            SlotState {
                next_expected: first_frame,
                ..Default::default()
            },
        );
    }

    pub fn accept(&mut self, packet: &InputPacket) -> Received {
        if packet.episode != self.episode {
            trace!(
                episode = packet.episode,
                current = self.episode,
                "Input packet from another episode dropped"
            );
            return Received::default();
        }
        let slot = self.slots.entry(packet.player_index).or_default();

        if let Some(cs) = packet.checksum
            && slot.latest_checksum.is_none_or(|old| cs.frame > old.frame)
        {
            slot.latest_checksum = Some(cs);
        }

        let mut abandoned = None;
        if packet.base_frame > slot.next_expected {
            let lost = slot.next_expected..packet.base_frame;
            warn!(slot = packet.player_index, missing = ?lost, "Peer gave up inputs");
            slot.next_expected = packet.base_frame;
            abandoned = Some(lost);
        }

        let fresh: Vec<(u32, Action)> = packet
            .frames()
            .filter(|&(frame, _)| frame >= slot.next_expected)
            .collect();
        if let Some(&(last, _)) = fresh.last() {
            slot.next_expected = last + 1;
        }
        Received { fresh, abandoned }
    }

    /// Highest frame received without gaps for `slot`.
    pub fn contiguous_frame(&self, slot: u8) -> Option<u32> {
        self.slots
            .get(&slot)
            .and_then(|s| s.next_expected.checked_sub(1))
    }

    /// Newest state checksum the peer has reported.
    pub fn latest_checksum(&self, slot: u8) -> Option<FrameChecksum> {
        self.slots.get(&slot).and_then(|s| s.latest_checksum)
    }

    /// Start a new episode and forget all slots.
    pub fn set_episode(&mut self, episode: u32) {
        self.episode = episode;
        self.slots.clear();
    }
}
