//! Environment contract.
//!
//! Rollback only works if stepping is a pure function of
//! `(state, rng, actions)`. Implementations must not read wall clocks or any
//! randomness other than the RNG they are handed, and `get_state` /
//! `set_state` must round-trip exactly.

use mug_proto::messages::peer::Action;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::EnvError;

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Per-player rewards for this step, slot order.
    pub rewards: Vec<f64>,
    pub done: bool,
}

pub trait Environment: Send + 'static {
    type Observation: Send + 'static;

    fn num_players(&self) -> usize;

    fn reset(&mut self, rng: &mut ChaCha8Rng);

    /// Advance one frame. `actions` holds one action per player, slot order.
    fn step(&mut self, actions: &[Action], rng: &mut ChaCha8Rng) -> Result<StepOutcome, EnvError>;

    fn get_state(&self) -> Vec<u8>;

    fn set_state(&mut self, state: &[u8]) -> Result<(), EnvError>;

    fn observe(&self) -> Self::Observation;
}

/// `get_state` for environments whose whole state is one serde value.
pub fn encode_state<T: Serialize>(state: &T) -> Vec<u8> {
    // Serializing plain in-memory data into a Vec cannot fail.
    postcard::to_allocvec(state).unwrap_or_default()
}

/// `set_state` counterpart of [`encode_state`].
pub fn decode_state<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EnvError> {
    postcard::from_bytes(bytes).map_err(|e| EnvError::BadState(e.to_string()))
}

/// Exact position of a [`ChaCha8Rng`] stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngState {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u128,
}

impl RngState {
    pub fn capture(rng: &ChaCha8Rng) -> Self {
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos(),
        }
    }

    pub fn restore(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(self.word_pos);
        rng
    }

    /// Canonical byte form used for hashing.
    pub fn to_bytes(&self) -> [u8; 56] {
        let mut out = [0u8; 56];
        out[..32].copy_from_slice(&self.seed);
        out[32..40].copy_from_slice(&self.stream.to_le_bytes());
        out[40..].copy_from_slice(&self.word_pos.to_le_bytes());
        out
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A two-player toy environment with RNG-driven drift.

    use rand::Rng;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
    pub(crate) struct Tug {
        pub(crate) positions: [i32; 2],
        pub(crate) ticks: u32,
        pub(crate) horizon: u32,
    }

    impl Tug {
        pub(crate) fn new(horizon: u32) -> Self {
            Self {
                horizon,
                ..Default::default()
            }
        }
    }

    impl Environment for Tug {
        type Observation = [i32; 2];

        fn num_players(&self) -> usize {
            2
        }

        fn reset(&mut self, rng: &mut ChaCha8Rng) {
            self.positions = [rng.random_range(-3..=3), rng.random_range(-3..=3)];
            self.ticks = 0;
        }

        fn step(
            &mut self,
            actions: &[Action],
            rng: &mut ChaCha8Rng,
        ) -> Result<StepOutcome, EnvError> {
            if actions.len() != 2 {
                return Err(EnvError::ActionCount {
                    expected: 2,
                    got: actions.len(),
                });
            }
            for (pos, &a) in self.positions.iter_mut().zip(actions) {
                let delta = match a % 3 {
                    0 => 0,
                    1 => 1,
                    _ => -1,
                };
                *pos += delta + rng.random_range(-1..=1);
            }
            self.ticks += 1;
            let lead = f64::from(self.positions[0] - self.positions[1]);
            Ok(StepOutcome {
                rewards: vec![lead, -lead],
                done: self.horizon > 0 && self.ticks >= self.horizon,
            })
        }

        fn get_state(&self) -> Vec<u8> {
            encode_state(self)
        }

        fn set_state(&mut self, state: &[u8]) -> Result<(), EnvError> {
            *self = decode_state(state)?;
            Ok(())
        }

        fn observe(&self) -> [i32; 2] {
            self.positions
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;

    #[test]
    fn rng_state_round_trips_mid_stream() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..13 {
            rng.next_u32();
        }
        let saved = RngState::capture(&rng);
        let a: Vec<u32> = (0..8).map(|_| rng.next_u32()).collect();
        let mut restored = saved.restore();
        let b: Vec<u32> = (0..8).map(|_| restored.next_u32()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_state_is_rejected() {
        let err = decode_state::<testing::Tug>(&[0xff; 3]).unwrap_err();
        assert!(matches!(err, EnvError::BadState(_)));
    }
}
