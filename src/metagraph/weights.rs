use std::collections::BTreeMap;

use super::PeerId;

/// This neuron's learned opinion of its peers: a distribution over peer ids,
/// updated as an exponential moving average of what each query taught it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalWeights {
    weights: BTreeMap<PeerId, f32>,
}

impl LocalWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: PeerId) -> f32 {
        self.weights.get(&peer_id).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// `w = (1 - decay) * w + decay * learned` for every peer in either set,
    /// then rescaled to sum to 1. The learned weights are normalized first,
    /// so a reduced-support aggregate still moves the average by `decay`.
    pub fn blend(&mut self, learned: &[(PeerId, f32)], decay: f32) {
        let decay = decay.clamp(0.0, 1.0);
        let total: f32 = learned
            .iter()
            .map(|(_, w)| w.max(0.0))
            .filter(|w| w.is_finite())
            .sum();
        if total <= 0.0 {
            return;
        }

        for weight in self.weights.values_mut() {
            *weight *= 1.0 - decay;
        }
        for (peer_id, weight) in learned {
            if !weight.is_finite() || *weight <= 0.0 {
                continue;
            }
            *self.weights.entry(*peer_id).or_insert(0.0) += decay * weight / total;
        }
        self.normalize();
    }

    /// Drops peers for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(PeerId) -> bool) {
        let before = self.weights.len();
        self.weights.retain(|peer_id, _| keep(*peer_id));
        if self.weights.len() != before {
            self.normalize();
        }
    }

    /// L1 distance, treating missing peers as weight 0.
    pub fn distance(&self, other: &LocalWeights) -> f32 {
        let mut distance: f32 = self
            .weights
            .iter()
            .map(|(peer_id, w)| (w - other.get(*peer_id)).abs())
            .sum();
        distance += other
            .weights
            .iter()
            .filter(|(peer_id, _)| !self.weights.contains_key(*peer_id))
            .map(|(_, w)| w.abs())
            .sum::<f32>();
        distance
    }

    pub fn to_vec(&self) -> Vec<(PeerId, f32)> {
        self.weights.iter().map(|(id, w)| (*id, *w)).collect()
    }

    fn normalize(&mut self) {
        let total: f32 = self.weights.values().sum();
        if total > 0.0 {
            for weight in self.weights.values_mut() {
                *weight /= total;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    #[test]
    fn first_blend_adopts_the_learned_distribution() {
        let mut weights = LocalWeights::new();
        weights.blend(&[(PeerId(1), 0.2), (PeerId(2), 0.6)], 0.05);
        assert!((weights.get(PeerId(1)) - 0.25).abs() < EPS);
        assert!((weights.get(PeerId(2)) - 0.75).abs() < EPS);
    }

    #[test]
    fn blend_moves_by_decay() {
        let mut weights = LocalWeights::new();
        weights.blend(&[(PeerId(1), 1.0)], 1.0);
        weights.blend(&[(PeerId(2), 1.0)], 0.1);
        assert!((weights.get(PeerId(1)) - 0.9).abs() < EPS);
        assert!((weights.get(PeerId(2)) - 0.1).abs() < EPS);
    }

    #[test]
    fn empty_or_zero_updates_are_ignored() {
        let mut weights = LocalWeights::new();
        weights.blend(&[(PeerId(1), 1.0)], 1.0);
        let before = weights.clone();
        weights.blend(&[], 0.5);
        weights.blend(&[(PeerId(2), 0.0), (PeerId(3), f32::NAN)], 0.5);
        assert_eq!(weights, before);
    }

    #[test]
    fn distance_counts_both_sides() {
        let mut a = LocalWeights::new();
        a.blend(&[(PeerId(1), 1.0)], 1.0);
        let mut b = LocalWeights::new();
        b.blend(&[(PeerId(2), 1.0)], 1.0);
        assert!((a.distance(&b) - 2.0).abs() < EPS);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn retain_renormalizes() {
        let mut weights = LocalWeights::new();
        weights.blend(&[(PeerId(1), 1.0), (PeerId(2), 1.0), (PeerId(3), 2.0)], 1.0);
        weights.retain(|id| id != PeerId(3));
        assert!((weights.get(PeerId(1)) - 0.5).abs() < EPS);
        assert_eq!(weights.get(PeerId(3)), 0.0);
    }
}
