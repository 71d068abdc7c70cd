use std::sync::{PoisonError, RwLock};

use hashbrown::HashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::metagraph::{PeerId, PeerRecord};

/// Scores how well a peer suits a context. Higher is better. Selection only
/// looks at the ordering and the softmax of these scores.
pub trait Gate: Send + Sync {
    fn score(&self, context: &[f32], peer: &PeerRecord) -> f32;
}

/// Product-key gating: every peer owns a key vector and the score is the
/// scaled dot product between the context and that key.
///
/// Keys start out as a deterministic function of the peer id, so two neurons
/// with the same peer table agree on a cold start, and drift as `learn` is
/// fed rewards.
#[derive(Default)]
pub struct KeyGate {
    keys: RwLock<HashMap<PeerId, Vec<f32>>>,
    stake_prior: f32,
}

impl KeyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `prior * ln(1 + stake)` to every score, biasing selection towards
    /// well-staked peers.
    pub fn with_stake_prior(mut self, prior: f32) -> Self {
        self.stake_prior = prior;
        self
    }

    /// The key currently used for `peer_id` at dimension `dim`.
    pub fn key(&self, peer_id: PeerId, dim: usize) -> Vec<f32> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        match keys.get(&peer_id) {
            Some(key) if key.len() == dim => key.clone(),
            _ => initial_key(peer_id, dim),
        }
    }

    /// Moves the peer's key towards the context when `reward` is positive and
    /// away from it when negative.
    pub fn learn(&self, peer_id: PeerId, context: &[f32], reward: f32, rate: f32) {
        if !reward.is_finite() || context.iter().any(|x| !x.is_finite()) {
            return;
        }
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let key = keys
            .entry(peer_id)
            .or_insert_with(|| initial_key(peer_id, context.len()));
        if key.len() != context.len() {
            *key = initial_key(peer_id, context.len());
        }
        for (k, x) in key.iter_mut().zip(context) {
            *k += rate * reward * x;
        }
    }
}

impl Gate for KeyGate {
    fn score(&self, context: &[f32], peer: &PeerRecord) -> f32 {
        let dim = context.len();
        if dim == 0 {
            return 0.0;
        }
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let dot = match keys.get(&peer.peer_id) {
            Some(key) if key.len() == dim => dot(context, key),
            _ => dot(context, &initial_key(peer.peer_id, dim)),
        };
        let prior = if self.stake_prior != 0.0 {
            self.stake_prior * (peer.stake as f32).ln_1p()
        } else {
            0.0
        };
        dot / (dim as f32).sqrt() + prior
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn initial_key(peer_id: PeerId, dim: usize) -> Vec<f32> {
    let seed = *blake3::hash(&peer_id.0.to_le_bytes()).as_bytes();
    let mut rng = StdRng::from_seed(seed);
    (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metagraph::snapshot_fixtures::record;

    #[test]
    fn initial_keys_are_deterministic() {
        let a = KeyGate::new();
        let b = KeyGate::new();
        assert_eq!(a.key(PeerId(5), 8), b.key(PeerId(5), 8));
        assert_ne!(a.key(PeerId(5), 8), a.key(PeerId(6), 8));
        assert!(a.key(PeerId(5), 8).iter().all(|x| (-1.0..1.0).contains(x)));
    }

    #[test]
    fn learning_raises_the_score_for_that_context() {
        let gate = KeyGate::new();
        let peer = record(3, 0);
        let context = vec![0.5, -0.25, 1.0, 0.0];
        let before = gate.score(&context, &peer);
        gate.learn(peer.peer_id, &context, 1.0, 0.5);
        assert!(gate.score(&context, &peer) > before);
    }

    #[test]
    fn stake_prior_favors_staked_peers() {
        let gate = KeyGate::new().with_stake_prior(1.0);
        let mut rich = record(1, 0);
        let mut poor = record(1, 0);
        rich.stake = 1_000_000;
        poor.stake = 0;
        let context = vec![1.0; 4];
        assert!(gate.score(&context, &rich) > gate.score(&context, &poor));
    }

    #[test]
    fn learning_ignores_non_finite_input() {
        let gate = KeyGate::new();
        let initial = gate.key(PeerId(1), 2);
        gate.learn(PeerId(1), &[f32::NAN, 1.0], 1.0, 1.0);
        gate.learn(PeerId(1), &[1.0, 1.0], f32::INFINITY, 1.0);
        assert_eq!(gate.key(PeerId(1), 2), initial);
    }
}
