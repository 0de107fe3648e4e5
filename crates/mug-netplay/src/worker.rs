//! Dedicated stepping thread.
//!
//! The environment lives on its own OS thread and is driven by batches: a
//! rollback of depth N is one request `[Restore, Step × N, Capture?, Hash?,
//! Observe]` and one reply, never N round-trips.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mug_proto::messages::peer::{Action, FrameChecksum, StateHash};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use ring::digest;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::env::{Environment, RngState, StepOutcome};
use crate::error::{EnvError, NetplayError};
use crate::sync::snapshot::StateSnapshot;

const BATCH_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// One operation inside a batch. Ops run in order against the worker's
/// current state.
#[derive(Debug, Clone)]
pub enum WorkerOp {
    /// Reseed the RNG and reset the environment to frame 0.
    Reset { seed: u64 },
    Restore(StateSnapshot),
    /// Apply the inputs of `frame`; the worker is at `frame + 1` afterwards.
    Step { frame: u32, actions: Vec<Action> },
    /// Snapshot the current state.
    Capture,
    /// Hash the current state.
    Hash,
    Observe,
}

#[derive(Debug)]
pub enum OpResult<O> {
    Reset,
    Restored { frame: u32 },
    Stepped { frame: u32, outcome: StepOutcome },
    Captured(StateSnapshot),
    Hashed(FrameChecksum),
    Observed(O),
}

/// Results of one batch, in op order.
#[derive(Debug)]
pub struct BatchReply<O> {
    pub results: Vec<OpResult<O>>,
}

type BatchReplySender<O> = oneshot::Sender<Result<BatchReply<O>, EnvError>>;

enum WorkerMessage<O> {
    Batch(Vec<WorkerOp>, BatchReplySender<O>),
    Stop,
}

/// SHA-256 over the canonical state: environment blob then RNG position.
pub fn state_hash(env_state: &[u8], rng: &RngState) -> StateHash {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(env_state);
    ctx.update(&rng.to_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

pub struct StepWorker<E: Environment> {
    tx: Sender<WorkerMessage<E::Observation>>,
    join: Option<JoinHandle<()>>,
    round_trips: u64,
}

impl<E: Environment> StepWorker<E> {
    pub fn spawn(env: E) -> Result<Self, NetplayError> {
        let (tx, rx) = unbounded::<WorkerMessage<E::Observation>>();
        let join = thread::Builder::new()
            .name("mug-step-worker".into())
            .spawn(move || WorkerLoop::new(env).run(rx))?;
        Ok(Self {
            tx,
            join: Some(join),
            round_trips: 0,
        })
    }

    /// Run `ops` on the worker thread and await the single reply. The
    /// calling task yields while the worker steps.
    pub async fn run_batch(
        &mut self,
        ops: Vec<WorkerOp>,
    ) -> Result<BatchReply<E::Observation>, NetplayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Batch(ops, reply_tx))
            .map_err(|_| NetplayError::WorkerGone)?;
        self.round_trips += 1;
        match tokio::time::timeout(BATCH_REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(res)) => Ok(res?),
            Ok(Err(_)) => Err(NetplayError::WorkerGone),
            Err(_) => Err(NetplayError::WorkerTimeout { op: "batch" }),
        }
    }

    /// Batches sent so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }
}

impl<E: Environment> Drop for StepWorker<E> {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct WorkerLoop<E: Environment> {
    env: E,
    rng: ChaCha8Rng,
    cumulative_rewards: Vec<f64>,
    frame: u32,
}

impl<E: Environment> WorkerLoop<E> {
    fn new(env: E) -> Self {
        let players = env.num_players();
        Self {
            env,
            rng: ChaCha8Rng::seed_from_u64(0),
            cumulative_rewards: vec![0.0; players],
            frame: 0,
        }
    }

    fn run(mut self, rx: Receiver<WorkerMessage<E::Observation>>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                WorkerMessage::Batch(ops, reply) => {
                    let res = self.execute(ops);
                    let _ = reply.send(res);
                }
                WorkerMessage::Stop => break,
            }
        }
        debug!("Step worker stopped");
    }

    fn execute(&mut self, ops: Vec<WorkerOp>) -> Result<BatchReply<E::Observation>, EnvError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let res = match op {
                WorkerOp::Reset { seed } => {
                    self.rng = ChaCha8Rng::seed_from_u64(seed);
                    self.env.reset(&mut self.rng);
                    self.cumulative_rewards = vec![0.0; self.env.num_players()];
                    self.frame = 0;
                    OpResult::Reset
                }
                WorkerOp::Restore(snap) => {
                    self.env.set_state(&snap.env_state)?;
                    self.rng = snap.rng.restore();
                    self.cumulative_rewards = snap.cumulative_rewards;
                    self.frame = snap.frame;
                    trace!(frame = snap.frame, "Restored snapshot");
                    OpResult::Restored { frame: snap.frame }
                }
                WorkerOp::Step { frame, actions } => {
                    let outcome = self.env.step(&actions, &mut self.rng)?;
                    for (total, r) in self.cumulative_rewards.iter_mut().zip(&outcome.rewards) {
                        *total += r;
                    }
                    self.frame = frame + 1;
                    OpResult::Stepped { frame, outcome }
                }
                WorkerOp::Capture => {
                    let env_state = self.env.get_state();
                    let rng = RngState::capture(&self.rng);
                    let hash = state_hash(&env_state, &rng);
                    OpResult::Captured(StateSnapshot {
                        frame: self.frame,
                        env_state,
                        rng,
                        cumulative_rewards: self.cumulative_rewards.clone(),
                        hash,
                    })
                }
                WorkerOp::Hash => {
                    let rng = RngState::capture(&self.rng);
                    OpResult::Hashed(FrameChecksum {
                        frame: self.frame,
                        hash: state_hash(&self.env.get_state(), &rng),
                    })
                }
                WorkerOp::Observe => OpResult::Observed(self.env.observe()),
            };
            results.push(res);
        }
        Ok(BatchReply { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::Tug;

    fn steps(range: std::ops::Range<u32>) -> Vec<WorkerOp> {
        range
            .map(|f| WorkerOp::Step {
                frame: f,
                actions: vec![(f % 3) as Action, ((f / 2) % 3) as Action],
            })
            .collect()
    }

    fn captured<O>(reply: &BatchReply<O>) -> Option<StateSnapshot> {
        reply.results.iter().find_map(|r| match r {
            OpResult::Captured(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn hashed<O>(reply: &BatchReply<O>) -> Option<FrameChecksum> {
        reply.results.iter().find_map(|r| match r {
            OpResult::Hashed(c) => Some(*c),
            _ => None,
        })
    }

    #[tokio::test]
    async fn replay_from_snapshot_is_deterministic() {
        let mut worker = StepWorker::spawn(Tug::new(0)).unwrap();

        let mut ops = vec![WorkerOp::Reset { seed: 42 }];
        ops.extend(steps(0..100));
        ops.push(WorkerOp::Capture);
        let reply = worker.run_batch(ops).await.unwrap();
        let snap = captured(&reply).unwrap();
        assert_eq!(snap.frame, 100);

        let mut replay = Vec::new();
        for _ in 0..2 {
            let mut ops = vec![WorkerOp::Restore(snap.clone())];
            ops.extend(steps(100..110));
            ops.push(WorkerOp::Hash);
            let reply = worker.run_batch(ops).await.unwrap();
            replay.push(hashed(&reply).unwrap());
        }

        assert_eq!(replay[0].frame, 110);
        assert_eq!(replay[0], replay[1]);
        assert_eq!(worker.round_trips(), 3);
    }

    #[tokio::test]
    async fn captured_hash_matches_hash_op() {
        let mut worker = StepWorker::spawn(Tug::new(0)).unwrap();
        let mut ops = vec![WorkerOp::Reset { seed: 1 }];
        ops.extend(steps(0..5));
        ops.push(WorkerOp::Capture);
        ops.push(WorkerOp::Hash);
        ops.push(WorkerOp::Observe);
        let reply = worker.run_batch(ops).await.unwrap();

        let snap = captured(&reply).unwrap();
        let cs = hashed(&reply).unwrap();
        assert_eq!(snap.hash, cs.hash);
        assert_eq!(cs.frame, 5);
        let stepped = reply
            .results
            .iter()
            .filter(|r| matches!(r, OpResult::Stepped { .. }))
            .count();
        assert_eq!(stepped, 5);
        assert!(matches!(reply.results.last(), Some(OpResult::Observed(_))));
    }

    #[tokio::test]
    async fn env_error_fails_whole_batch() {
        let mut worker = StepWorker::spawn(Tug::new(0)).unwrap();
        let err = worker
            .run_batch(vec![
                WorkerOp::Reset { seed: 1 },
                WorkerOp::Step {
                    frame: 0,
                    actions: vec![1],
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetplayError::Env(EnvError::ActionCount {
                expected: 2,
                got: 1
            })
        ));
    }
}
