use std::collections::BTreeMap;
use std::ops::Range;

use mug_proto::messages::peer::{Action, FrameChecksum, InputPacket, PeerMessage, StateHash};
use tracing::{debug, info, trace, warn};

use crate::config::NetplayConfig;
use crate::env::Environment;
use crate::error::NetplayError;
use crate::input_channel::{InputReceiver, InputSender};
use crate::worker::{BatchReply, OpResult, StepWorker, WorkerOp};

use super::input_history::InputHistory;
use super::snapshot::SnapshotStore;

/// Lag behind the peer's confirmed inputs that triggers a catch-up.
const FAST_FORWARD_LAG: u32 = 8;
/// Confirmed checksums kept for comparison with late peer reports.
const CHECKSUM_HISTORY: usize = 32;
/// Packets held for an episode this peer has not reached yet.
const MAX_EARLY_PACKETS: usize = 256;

/// Peer reported a different state hash for a confirmed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesyncEvent {
    pub frame: u32,
    pub local: StateHash,
    pub remote: StateHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackInfo {
    /// Earliest mispredicted frame.
    pub target: u32,
    /// Snapshot frame the replay started from.
    pub restored_from: u32,
    /// Frames re-simulated.
    pub replayed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackStats {
    pub frame: u32,
    pub confirmed_frame: Option<u32>,
    pub rollbacks: u64,
    pub frames_replayed: u64,
    pub max_rollback_depth: u32,
    pub fast_forwards: u64,
    /// Rollbacks whose target had left the snapshot ring; replay started
    /// from the oldest snapshot instead.
    pub truncated_rollbacks: u64,
    /// Remote frames given up because the peer no longer held them.
    pub abandoned_inputs: u64,
    /// Local frames the peer has not acknowledged yet.
    pub unacked_inputs: usize,
    pub desyncs: usize,
    pub worker_round_trips: u64,
}

/// Result of stepping the simulation. Only the final frame's observation is
/// surfaced; replayed frames are never rendered.
#[derive(Debug)]
pub struct FrameAdvance<O> {
    /// Frame whose inputs were just applied.
    pub frame: u32,
    pub rewards: Vec<f64>,
    pub done: bool,
    pub observation: Option<O>,
    pub rollback: Option<RollbackInfo>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub fresh_inputs: usize,
    pub abandoned: Option<Range<u32>>,
    pub rollback_pending: Option<u32>,
}

pub struct RollbackSession<E: Environment> {
    local_slot: u8,
    num_players: usize,
    hash_interval: u32,
    history: InputHistory,
    snapshots: SnapshotStore,
    sender: InputSender,
    receiver: InputReceiver,
    worker: StepWorker<E>,
    episode: u32,
    /// Next frame to simulate; the worker's state is the state at this frame.
    current_frame: u32,
    /// Hashes at hash frames that may still rest on predicted inputs.
    tentative_hashes: BTreeMap<u32, StateHash>,
    /// Hashes of states reached with confirmed inputs only.
    confirmed_hashes: BTreeMap<u32, StateHash>,
    peer_hashes: BTreeMap<u32, StateHash>,
    /// Input from a peer that already moved on to a later episode.
    early_packets: Vec<InputPacket>,
    next_hash_frame: u32,
    desyncs: Vec<DesyncEvent>,
    stats: RollbackStats,
}

impl<E: Environment> RollbackSession<E> {
    pub async fn new(
        env: E,
        local_slot: u8,
        seed: u64,
        config: &NetplayConfig,
    ) -> Result<Self, NetplayError> {
        let num_players = env.num_players();
        let worker = StepWorker::spawn(env)?;
        let hash_interval = config.hash_interval.max(1);
        let mut session = Self {
            local_slot,
            num_players,
            hash_interval,
            history: InputHistory::new(num_players, config.max_rollback_frames),
            snapshots: SnapshotStore::new(config.snapshot_capacity, config.snapshot_interval),
            sender: InputSender::new(local_slot, config.input_redundancy),
            receiver: InputReceiver::new(),
            worker,
            episode: 0,
            current_frame: 0,
            tentative_hashes: BTreeMap::new(),
            confirmed_hashes: BTreeMap::new(),
            peer_hashes: BTreeMap::new(),
            early_packets: Vec::new(),
            next_hash_frame: hash_interval,
            desyncs: Vec::new(),
            stats: RollbackStats::default(),
        };
        session.start_episode(0, seed).await?;
        Ok(session)
    }

    /// Reset the environment to frame 0 of `episode` with `seed`.
    pub async fn start_episode(&mut self, episode: u32, seed: u64) -> Result<(), NetplayError> {
        let reply = self
            .worker
            .run_batch(vec![WorkerOp::Reset { seed }, WorkerOp::Capture])
            .await?;

        self.episode = episode;
        self.history.clear();
        self.snapshots.clear();
        self.sender.set_episode(episode);
        self.receiver.set_episode(episode);
        for slot in (0..self.num_players as u8).filter(|&s| s != self.local_slot) {
            self.receiver.track(slot, 0);
        }
        self.current_frame = 0;
        self.tentative_hashes.clear();
        self.confirmed_hashes.clear();
        self.peer_hashes.clear();
        self.next_hash_frame = self.hash_interval;

        self.apply_reply(reply);
        info!(episode, seed, slot = self.local_slot, "Rollback session reset");

        let early = std::mem::take(&mut self.early_packets);
        for packet in early.iter().filter(|p| p.episode >= episode) {
            self.on_input_packet(packet);
        }
        Ok(())
    }

    pub fn local_slot(&self) -> u8 {
        self.local_slot
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    pub fn episode(&self) -> u32 {
        self.episode
    }

    pub fn confirmed_frame(&self) -> Option<u32> {
        self.history.confirmed_frame()
    }

    /// Record the local action for the current frame and build the packet
    /// to send to the peer.
    pub fn add_local_input(&mut self, action: Action) -> Option<InputPacket> {
        let frame = self.current_frame;
        self.history
            .add_confirmed(self.local_slot as usize, frame, action);
        self.sender.record(frame, action);
        self.sender
            .packet_for(frame, self.checksum_for_peer(), self.ack_frame())
    }

    /// Newest frame received without gaps from every remote slot.
    fn ack_frame(&self) -> Option<u32> {
        (0..self.num_players as u8)
            .filter(|&s| s != self.local_slot)
            .map(|s| self.receiver.contiguous_frame(s))
            .min()
            .flatten()
    }

    /// Step the current frame, preceded by any pending rollback, in a
    /// single worker round-trip.
    pub async fn advance_frame(&mut self) -> Result<FrameAdvance<E::Observation>, NetplayError> {
        let mut ops = Vec::new();
        let rollback = self.rollback_ops(&mut ops)?;
        let frame = self.current_frame;
        self.push_step(frame, &mut ops);
        ops.push(WorkerOp::Observe);

        let reply = self.worker.run_batch(ops).await?;
        self.set_current_frame(frame + 1);
        let (observation, outcome) = self.apply_reply(reply);
        self.collect_confirmed_hashes();

        let (rewards, done) = outcome.map_or((Vec::new(), false), |o| (o.rewards, o.done));
        Ok(FrameAdvance {
            frame,
            rewards,
            done,
            observation,
            rollback,
        })
    }

    /// Run a pending rollback without stepping a new frame.
    pub async fn resync(&mut self) -> Result<Option<RollbackInfo>, NetplayError> {
        let mut ops = Vec::new();
        let Some(info) = self.rollback_ops(&mut ops)? else {
            return Ok(None);
        };
        let reply = self.worker.run_batch(ops).await?;
        self.apply_reply(reply);
        self.collect_confirmed_hashes();
        Ok(Some(info))
    }

    /// Catch up to `target` with known inputs, repeating the last local
    /// action for frames the local player never produced.
    pub async fn fast_forward(
        &mut self,
        target: u32,
    ) -> Result<Option<FrameAdvance<E::Observation>>, NetplayError> {
        if target <= self.current_frame {
            return Ok(None);
        }
        let mut ops = Vec::new();
        let rollback = self.rollback_ops(&mut ops)?;
        let start = self.current_frame;
        let local = self.local_slot as usize;
        for frame in start..target {
            let action = self.history.predict(local, frame);
            self.history.add_confirmed(local, frame, action);
            self.sender.record(frame, action);
            self.push_step(frame, &mut ops);
        }
        ops.push(WorkerOp::Observe);

        let reply = self.worker.run_batch(ops).await?;
        self.set_current_frame(target);
        let (observation, outcome) = self.apply_reply(reply);
        self.collect_confirmed_hashes();
        self.stats.fast_forwards += 1;
        info!(from = start, to = target, "Fast-forwarded");

        let (rewards, done) = outcome.map_or((Vec::new(), false), |o| (o.rewards, o.done));
        Ok(Some(FrameAdvance {
            frame: target - 1,
            rewards,
            done,
            observation,
            rollback,
        }))
    }

    /// Frame to fast-forward to when this peer lags the remote's inputs.
    pub fn fast_forward_target(&self) -> Option<u32> {
        let remote = (0..self.num_players)
            .filter(|&s| s != self.local_slot as usize)
            .filter_map(|s| self.history.slot_confirmed_frame(s))
            .min()?;
        (remote + 1 > self.current_frame + FAST_FORWARD_LAG).then_some(remote + 1)
    }

    pub fn on_peer_message(&mut self, msg: &PeerMessage) -> PeerUpdate {
        let packet = match msg {
            PeerMessage::Input(p) => p,
            PeerMessage::Heartbeat { frame } => {
                trace!(frame, "Peer heartbeat");
                return PeerUpdate::default();
            }
        };
        self.on_input_packet(packet)
    }

    fn on_input_packet(&mut self, packet: &InputPacket) -> PeerUpdate {
        let slot = packet.player_index as usize;
        if packet.player_index == self.local_slot || slot >= self.num_players {
            warn!(slot, "Input packet for unexpected slot dropped");
            return PeerUpdate::default();
        }
        if packet.episode > self.episode {
            if self.early_packets.len() < MAX_EARLY_PACKETS {
                self.early_packets.push(packet.clone());
            }
            return PeerUpdate::default();
        }

        if packet.episode == self.episode
            && let Some(ack) = packet.ack_frame
        {
            self.sender.acknowledge(ack);
        }

        let received = self.receiver.accept(packet);
        if let Some(lost) = &received.abandoned {
            self.stats.abandoned_inputs += u64::from(lost.end - lost.start);
            self.history.abandon(slot, lost.clone());
        }
        for &(frame, action) in &received.fresh {
            self.history.add_confirmed(slot, frame, action);
        }
        if let Some(cs) = packet.checksum
            && packet.episode == self.episode
            && cs.frame >= self.oldest_comparable_frame()
        {
            self.peer_hashes.insert(cs.frame, cs.hash);
        }
        self.collect_confirmed_hashes();

        PeerUpdate {
            fresh_inputs: received.fresh.len(),
            abandoned: received.abandoned,
            rollback_pending: self.history.pending_rollback(),
        }
    }

    /// Newest checksum of a confirmed frame, to piggyback on input packets.
    pub fn checksum_for_peer(&self) -> Option<FrameChecksum> {
        self.confirmed_hashes
            .iter()
            .next_back()
            .map(|(&frame, &hash)| FrameChecksum { frame, hash })
    }

    pub fn confirmed_checksums(&self) -> impl Iterator<Item = FrameChecksum> + '_ {
        self.confirmed_hashes
            .iter()
            .map(|(&frame, &hash)| FrameChecksum { frame, hash })
    }

    pub fn desyncs(&self) -> &[DesyncEvent] {
        &self.desyncs
    }

    pub fn stats(&self) -> RollbackStats {
        RollbackStats {
            frame: self.current_frame,
            confirmed_frame: self.history.confirmed_frame(),
            unacked_inputs: self.sender.unacked(),
            desyncs: self.desyncs.len(),
            worker_round_trips: self.worker.round_trips(),
            ..self.stats
        }
    }

    fn set_current_frame(&mut self, frame: u32) {
        self.current_frame = frame;
        self.history.set_current_frame(frame);
    }

    fn push_step(&mut self, frame: u32, ops: &mut Vec<WorkerOp>) {
        let actions = self.history.inputs_for(frame);
        self.history.record_used(frame, actions.clone());
        ops.push(WorkerOp::Step { frame, actions });
        let next = frame + 1;
        if self.snapshots.should_save(next) {
            ops.push(WorkerOp::Capture);
        }
        if next % self.hash_interval == 0 {
            ops.push(WorkerOp::Hash);
        }
    }

    /// Queue the replay of a pending rollback. The correction stays pending
    /// if there is no snapshot at all to replay from.
    fn rollback_ops(&mut self, ops: &mut Vec<WorkerOp>) -> Result<Option<RollbackInfo>, NetplayError> {
        let Some(target) = self.history.pending_rollback() else {
            return Ok(None);
        };
        let snapshot = match self.snapshots.restore(target) {
            Some(snapshot) => snapshot.clone(),
            None => {
                let oldest = self
                    .snapshots
                    .oldest()
                    .cloned()
                    .ok_or(NetplayError::SnapshotMissing(target))?;
                warn!(
                    target,
                    restored_from = oldest.frame,
                    "Rollback target left the snapshot ring, replaying from oldest snapshot"
                );
                self.stats.truncated_rollbacks += 1;
                oldest
            }
        };
        self.history.take_rollback();
        let restored_from = snapshot.frame;
        self.snapshots.discard_after(restored_from);
        self.tentative_hashes.retain(|&f, _| f <= restored_from);

        ops.push(WorkerOp::Restore(snapshot));
        for frame in restored_from..self.current_frame {
            self.push_step(frame, ops);
        }

        let depth = self.current_frame.saturating_sub(target);
        let replayed = self.current_frame - restored_from;
        self.stats.rollbacks += 1;
        self.stats.frames_replayed += u64::from(replayed);
        self.stats.max_rollback_depth = self.stats.max_rollback_depth.max(depth);
        debug!(target, restored_from, replayed, "Rolling back");
        Ok(Some(RollbackInfo {
            target,
            restored_from,
            replayed,
        }))
    }

    fn apply_reply(
        &mut self,
        reply: BatchReply<E::Observation>,
    ) -> (Option<E::Observation>, Option<crate::env::StepOutcome>) {
        let mut observation = None;
        let mut outcome = None;
        for result in reply.results {
            match result {
                OpResult::Captured(snapshot) => {
                    self.snapshots.save(snapshot);
                }
                OpResult::Hashed(cs) => {
                    self.tentative_hashes.insert(cs.frame, cs.hash);
                }
                OpResult::Stepped { outcome: o, .. } => outcome = Some(o),
                OpResult::Observed(o) => observation = Some(o),
                OpResult::Reset | OpResult::Restored { .. } => {}
            }
        }
        (observation, outcome)
    }

    fn oldest_comparable_frame(&self) -> u32 {
        self.next_hash_frame
            .saturating_sub(self.hash_interval * CHECKSUM_HISTORY as u32)
    }

    /// Promote hashes whose frames are now backed by confirmed inputs and
    /// compare them with what the peer reported.
    fn collect_confirmed_hashes(&mut self) {
        if self.history.pending_rollback().is_some() {
            return;
        }
        let Some(confirmed) = self.history.confirmed_frame() else {
            return;
        };
        // The state at frame H depends on inputs of frames < H.
        let limit = (confirmed + 1).min(self.current_frame);
        while self.next_hash_frame <= limit {
            let frame = self.next_hash_frame;
            match self.tentative_hashes.remove(&frame) {
                Some(hash) => {
                    trace!(frame, hash = %hex::encode(&hash[..8]), "Confirmed state hash");
                    self.confirmed_hashes.insert(frame, hash);
                }
                None => debug!(frame, "No hash recorded for confirmed frame"),
            }
            self.next_hash_frame += self.hash_interval;
        }
        self.tentative_hashes = self.tentative_hashes.split_off(&self.next_hash_frame);
        while self.confirmed_hashes.len() > CHECKSUM_HISTORY {
            self.confirmed_hashes.pop_first();
        }

        let comparable: Vec<u32> = self
            .peer_hashes
            .keys()
            .copied()
            .filter(|f| self.confirmed_hashes.contains_key(f))
            .collect();
        for frame in comparable {
            let (Some(remote), Some(&local)) =
                (self.peer_hashes.remove(&frame), self.confirmed_hashes.get(&frame))
            else {
                continue;
            };
            if remote != local {
                warn!(
                    frame,
                    local = %hex::encode(local),
                    remote = %hex::encode(remote),
                    "Desync detected"
                );
                self.desyncs.push(DesyncEvent {
                    frame,
                    local,
                    remote,
                });
            }
        }
        let floor = self.oldest_comparable_frame();
        self.peer_hashes.retain(|&f, _| f >= floor);
    }
}
