use std::hash::{DefaultHasher, Hash, Hasher};

use itertools::Itertools;
use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use crate::game::common::{GameMove, IGame};

/// One network request: the legal moves of the position and its flat
/// observation encoding. Value-typed and hashable; the hash doubles as the
/// cache fingerprint.
pub struct InferenceInputs<Game: IGame> {
    pub legal_moves: Vec<Game::Move>,
    pub observation: Vec<f32>,
}

impl<Game: IGame> InferenceInputs<Game> {
    /// 64-bit fingerprint over both fields. Used as the cache key without a
    /// follow-up equality check, so it must be a strong hash.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl<Game: IGame> Clone for InferenceInputs<Game> {
    fn clone(&self) -> Self {
        Self {
            legal_moves: self.legal_moves.clone(),
            observation: self.observation.clone(),
        }
    }
}

impl<Game: IGame> std::fmt::Debug for InferenceInputs<Game> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceInputs")
            .field("legal_moves", &self.legal_moves)
            .field("observation", &self.observation)
            .finish()
    }
}

impl<Game: IGame> PartialEq for InferenceInputs<Game> {
    fn eq(&self, other: &Self) -> bool {
        self.legal_moves == other.legal_moves
            && self.observation.len() == other.observation.len()
            && self
                .observation
                .iter()
                .zip(&other.observation)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}
impl<Game: IGame> Eq for InferenceInputs<Game> {}

impl<Game: IGame> Hash for InferenceInputs<Game> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.legal_moves.hash(state);
        for val in &self.observation {
            val.to_bits().hash(state);
        }
    }
}

/// One network response: the position value (+1 when the first player is
/// winning, -1 when the second is) and a probability per legal move.
pub struct InferenceOutputs<Game: IGame> {
    pub value: f32,
    pub policy: Vec<(Game::Move, f32)>,
}

impl<Game: IGame> Clone for InferenceOutputs<Game> {
    fn clone(&self) -> Self {
        Self {
            value: self.value,
            policy: self.policy.clone(),
        }
    }
}

/// A policy/value network replica. Synchronous: the call holds the device
/// for its duration. Output row `i` always corresponds to input row `i` and
/// the lengths match.
pub trait InferenceModel<Game: IGame>: Send {
    fn inference(&mut self, batch: &[InferenceInputs<Game>]) -> Vec<InferenceOutputs<Game>>;
}

/// Softmax over the raw scores of the legal moves only.
pub fn calc_moves_probs<Game: IGame>(
    moves: &[Game::Move],
    move_scores: &[f32],
) -> Vec<(Game::Move, f32)> {
    let moves_scores = moves.iter().map(|m| move_scores[m.to_nn_idx()]).collect_vec();

    let max_p = moves_scores.iter().cloned().fold(f32::MIN, f32::max);
    let scores = moves_scores.into_iter().map(|p| (p - max_p).exp()).collect_vec();
    let p_sum: f32 = scores.iter().sum();
    let probs = scores.into_iter().map(|p| p / p_sum).collect_vec();

    moves.iter().cloned().zip(probs).collect_vec()
}

/// Knows nothing about the game: value zero, uniform policy over the legal
/// moves. A stand-in for tests and debugging runs.
pub struct UniformModel;

impl<Game: IGame> InferenceModel<Game> for UniformModel {
    fn inference(&mut self, batch: &[InferenceInputs<Game>]) -> Vec<InferenceOutputs<Game>> {
        batch
            .iter()
            .map(|inputs| {
                let prob = 1.0 / inputs.legal_moves.len().max(1) as f32;
                InferenceOutputs {
                    value: 0.0,
                    policy: inputs.legal_moves.iter().map(|m| (*m, prob)).collect_vec(),
                }
            })
            .collect_vec()
    }
}

/// Single-hidden-layer network with a policy head over `Game::MOVES_NUM`
/// scores and a tanh value head. Weights are randomly initialized from a
/// seed; checkpoint loading lives outside this crate.
pub struct TwoHeadedMlp {
    w1: Array2<f32>,
    b1: Array1<f32>,
    wp: Array2<f32>,
    bp: Array1<f32>,
    wv: Array1<f32>,
    bv: f32,
}

impl TwoHeadedMlp {
    pub fn new_random(obs_size: usize, moves_num: usize, hidden: usize, seed: u64) -> Self {
        assert!(obs_size > 0 && moves_num > 0 && hidden > 0);
        let mut rand = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, (1.0 / obs_size as f32).sqrt()).unwrap();
        let mut sample = |shape: usize| (0..shape).map(|_| normal.sample(&mut rand)).collect_vec();

        Self {
            w1: Array2::from_shape_vec((obs_size, hidden), sample(obs_size * hidden)).unwrap(),
            b1: Array1::zeros(hidden),
            wp: Array2::from_shape_vec((hidden, moves_num), sample(hidden * moves_num)).unwrap(),
            bp: Array1::zeros(moves_num),
            wv: Array1::from_vec(sample(hidden)),
            bv: 0.0,
        }
    }
}

impl<Game: IGame> InferenceModel<Game> for TwoHeadedMlp {
    fn inference(&mut self, batch: &[InferenceInputs<Game>]) -> Vec<InferenceOutputs<Game>> {
        let obs_size = self.w1.nrows();
        let mut observations = Array2::<f32>::zeros((batch.len(), obs_size));
        for (b, inputs) in batch.iter().enumerate() {
            assert_eq!(inputs.observation.len(), obs_size);
            for (i, val) in inputs.observation.iter().enumerate() {
                observations[(b, i)] = *val;
            }
        }

        let hidden = (observations.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        let scores = hidden.dot(&self.wp) + &self.bp;
        let values = (hidden.dot(&self.wv) + self.bv).mapv(f32::tanh);

        batch
            .iter()
            .enumerate()
            .map(|(b, inputs)| {
                let sample_scores = scores.row(b).to_vec();
                InferenceOutputs {
                    value: values[b],
                    policy: calc_moves_probs::<Game>(&inputs.legal_moves, &sample_scores),
                }
            })
            .collect_vec()
    }
}
