use std::{cmp::Ordering, sync::Arc};

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::{
    config::RouterConfig,
    error::MeshError,
    metagraph::{Metagraph, PeerId, Snapshot},
    tensor::Tensor,
};

pub mod gate;

use gate::Gate;

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingRequest {
    pub target: PeerId,
    pub payload: Tensor,
}

#[derive(Debug)]
pub struct RoutingResponse {
    pub source: PeerId,
    pub result: Result<Tensor, MeshError>,
}

/// The outcome of `Router::select`, tied to the snapshot it was computed
/// against.
#[derive(Clone, Debug)]
pub struct Selection {
    snapshot: Arc<Snapshot>,
    requests: Vec<RoutingRequest>,
    weights: Vec<f32>,
}

impl Selection {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn requests(&self) -> &[RoutingRequest] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<RoutingRequest> {
        self.requests
    }

    /// One weight per snapshot peer, in dense-index order. Zero for every
    /// peer that wasn't selected.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Selected peers in descending weight order.
    pub fn targets(&self) -> Vec<PeerId> {
        self.requests.iter().map(|r| r.target).collect()
    }

    fn targets_peer(&self, peer_id: PeerId) -> bool {
        self.requests.iter().any(|r| r.target == peer_id)
    }

    /// Sends `payload` to every selected peer instead of the context the
    /// selection was scored with.
    pub fn with_payload(mut self, payload: Tensor) -> Self {
        for request in &mut self.requests {
            request.payload = payload.clone();
        }
        self
    }
}

/// What `Router::join` folds a batch of responses into.
#[derive(Debug)]
pub struct AggregatedResult {
    snapshot: Arc<Snapshot>,
    pub combined: Tensor,
    /// Selection weights with every failed peer zeroed, in dense-index order.
    /// Not renormalized: a partial batch sums to less than 1.
    pub weights: Vec<f32>,
    pub responded: Vec<PeerId>,
    pub failures: Vec<(PeerId, MeshError)>,
}

impl AggregatedResult {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Non-zero weights keyed by peer id.
    pub fn peer_weights(&self) -> Vec<(PeerId, f32)> {
        self.snapshot
            .peers()
            .iter()
            .zip(&self.weights)
            .filter(|(_, w)| **w > 0.0)
            .map(|(record, w)| (record.peer_id, *w))
            .collect()
    }

    /// Total weight of the peers that answered.
    pub fn support(&self) -> f32 {
        self.weights.iter().sum()
    }
}

/// Picks which peers get a piece of work and folds their answers back.
pub struct Router {
    metagraph: Arc<Metagraph>,
    gate: Arc<dyn Gate>,
    config: RouterConfig,
}

impl Router {
    pub fn new(metagraph: Arc<Metagraph>, gate: Arc<dyn Gate>, config: RouterConfig) -> Self {
        Self {
            metagraph,
            gate,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<dyn Gate> {
        &self.gate
    }

    /// Selects against the metagraph's current snapshot.
    pub fn select(&self, context: &[f32], k: usize) -> Result<Selection, MeshError> {
        self.select_in(self.metagraph.snapshot(), context, k)
    }

    /// Scores every qualifying peer in `snapshot` and keeps the best `k`.
    /// Equal scores go to the lower peer id. With no qualifying peers the
    /// selection is empty and its weights are all zero.
    pub fn select_in(
        &self,
        snapshot: Arc<Snapshot>,
        context: &[f32],
        k: usize,
    ) -> Result<Selection, MeshError> {
        if k == 0 {
            return Err(MeshError::InvalidSelection("k must be at least 1".into()));
        }
        if context.is_empty() {
            return Err(MeshError::InvalidSelection("empty context".into()));
        }
        if context.iter().any(|x| !x.is_finite()) {
            return Err(MeshError::InvalidSelection(
                "context holds non-finite values".into(),
            ));
        }

        let mut candidates: Vec<(usize, PeerId, f32)> = snapshot
            .qualifying()
            .map(|(index, record)| {
                let score = self.gate.score(context, record);
                let score = if score.is_nan() { f32::NEG_INFINITY } else { score };
                (index, record.peer_id, score)
            })
            .collect();
        candidates.sort_by(|a, b| match b.2.total_cmp(&a.2) {
            Ordering::Equal => a.1.cmp(&b.1),
            other => other,
        });
        candidates.truncate(k);

        let mut weights = vec![0.0; snapshot.len()];
        for ((index, _, _), weight) in candidates.iter().zip(softmax(&candidates)) {
            weights[*index] = weight;
        }

        let payload = Tensor::vector(context.to_vec());
        let requests = candidates
            .iter()
            .map(|(_, peer_id, _)| RoutingRequest {
                target: *peer_id,
                payload: payload.clone(),
            })
            .collect::<Vec<_>>();

        debug!(
            k,
            qualifying = snapshot.qualifying().count(),
            selected = requests.len(),
            generation = snapshot.generation(),
            "selected peers"
        );

        Ok(Selection {
            snapshot,
            requests,
            weights,
        })
    }

    /// Weighted sum of the successful responses. Failed and missing peers
    /// contribute nothing and keep a zero weight; their share is not handed
    /// to anyone else.
    ///
    /// The output shape is the one carrying the most selection weight among
    /// the successes; answers of any other shape count as failures. A peer
    /// that shows up more than once is failed outright.
    pub fn join(
        &self,
        selection: &Selection,
        responses: Vec<RoutingResponse>,
    ) -> Result<AggregatedResult, MeshError> {
        let snapshot = selection.snapshot.clone();
        let selected = selection.requests.len();
        if selected == 0 {
            return Err(MeshError::NoResponses { attempted: 0 });
        }

        let mut answers: HashMap<PeerId, usize> = HashMap::with_capacity(responses.len());
        for response in &responses {
            *answers.entry(response.source).or_default() += 1;
        }

        let mut successes: Vec<(usize, PeerId, Tensor)> = Vec::with_capacity(responses.len());
        let mut failures = Vec::new();
        for response in responses {
            let index = match snapshot.index_of(response.source) {
                Some(index) if selection.targets_peer(response.source) => index,
                _ => {
                    warn!(peer = %response.source, "dropping response from an unselected peer");
                    continue;
                }
            };
            match answers.get_mut(&response.source) {
                Some(count) if *count > 1 => {
                    warn!(peer = %response.source, answers = *count, "peer answered more than once");
                    *count = 0;
                    failures.push((
                        response.source,
                        MeshError::Malformed("more than one response".into()),
                    ));
                    continue;
                }
                Some(0) => continue,
                _ => {}
            }
            match response.result {
                Ok(tensor) => successes.push((index, response.source, tensor)),
                Err(e) => {
                    trace!(peer = %response.source, error = %e, "peer failed");
                    failures.push((response.source, e));
                }
            }
        }

        // Dense-index order makes the floating point sum independent of the
        // order responses arrived in.
        successes.sort_by_key(|(index, ..)| *index);

        let mut weights = vec![0.0; selection.weights.len()];
        let mut combined = majority_shape(&successes, &selection.weights)
            .map(Tensor::zeros)
            .transpose()
            .map_err(|e| MeshError::Malformed(e.to_string()))?;
        let mut responded = Vec::with_capacity(successes.len());
        for (index, peer_id, tensor) in successes {
            let weight = selection.weights[index];
            let Some(acc) = combined.as_mut() else {
                break;
            };
            if let Err(e) = acc.scaled_add(&tensor, weight) {
                warn!(peer = %peer_id, error = %e, "response doesn't fit the batch");
                failures.push((peer_id, MeshError::Malformed(e.to_string())));
                continue;
            }
            weights[index] = weight;
            responded.push(peer_id);
        }

        // Selected peers that never produced any response at all.
        for request in &selection.requests {
            let seen = responded.contains(&request.target)
                || failures.iter().any(|(peer_id, _)| *peer_id == request.target);
            if !seen {
                failures.push((
                    request.target,
                    MeshError::PeerUnreachable {
                        peer: request.target,
                        reason: "no response".into(),
                    },
                ));
            }
        }

        let combined = match combined {
            Some(combined) if !responded.is_empty() => combined,
            _ => return Err(MeshError::NoResponses { attempted: selected }),
        };

        debug!(
            responded = responded.len(),
            failed = failures.len(),
            "joined responses"
        );

        Ok(AggregatedResult {
            snapshot,
            combined,
            weights,
            responded,
            failures,
        })
    }
}

/// The shape with the largest total weight among `successes`, which must be
/// in dense-index order. Ties go to the shape seen first.
fn majority_shape(successes: &[(usize, PeerId, Tensor)], weights: &[f32]) -> Option<Vec<u32>> {
    let mut support: Vec<(&[u32], f32)> = Vec::new();
    for (index, _, tensor) in successes {
        let weight = weights[*index];
        match support.iter_mut().find(|(shape, _)| *shape == tensor.shape()) {
            Some((_, total)) => *total += weight,
            None => support.push((tensor.shape(), weight)),
        }
    }
    support
        .into_iter()
        .reduce(|best, next| if next.1 > best.1 { next } else { best })
        .map(|(shape, _)| shape.to_vec())
}

/// Numerically stable softmax over the candidates' scores. Infinite scores
/// split the whole mass between them.
fn softmax(candidates: &[(usize, PeerId, f32)]) -> Vec<f32> {
    let max = candidates
        .iter()
        .map(|(_, _, score)| *score)
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::INFINITY {
        let infinite = candidates.iter().filter(|(_, _, s)| *s == f32::INFINITY).count();
        return candidates
            .iter()
            .map(|(_, _, s)| if *s == f32::INFINITY { 1.0 / infinite as f32 } else { 0.0 })
            .collect();
    }
    if !max.is_finite() {
        let uniform = 1.0 / candidates.len().max(1) as f32;
        return vec![uniform; candidates.len()];
    }
    let exps: Vec<f32> = candidates
        .iter()
        .map(|(_, _, score)| (score - max).exp())
        .collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::seq::SliceRandom;

    use super::*;
    use crate::{
        config::MetagraphConfig,
        metagraph::{ledger::InMemoryLedger, snapshot_fixtures::*, PeerRecord},
    };

    /// Scores from a fixed table; unknown peers score 0.
    struct FixedGate(HashMap<u64, f32>);

    impl Gate for FixedGate {
        fn score(&self, _: &[f32], peer: &PeerRecord) -> f32 {
            self.0.get(&peer.peer_id.0).copied().unwrap_or(0.0)
        }
    }

    fn config() -> MetagraphConfig {
        MetagraphConfig::builder()
            .staleness_blocks(10)
            .eviction_blocks(1000)
            .build()
    }

    fn router(scores: &[(u64, f32)]) -> Router {
        let metagraph = Metagraph::new(Arc::new(InMemoryLedger::new()), config());
        Router::new(
            Arc::new(metagraph),
            Arc::new(FixedGate(scores.iter().copied().collect())),
            RouterConfig::default(),
        )
    }

    fn snapshot(peers: Vec<PeerRecord>) -> Arc<Snapshot> {
        Arc::new(snapshot_at(100, peers, &config()))
    }

    fn ok(id: u64, data: Vec<f32>) -> RoutingResponse {
        RoutingResponse {
            source: PeerId(id),
            result: Ok(Tensor::vector(data)),
        }
    }

    fn failed(id: u64) -> RoutingResponse {
        RoutingResponse {
            source: PeerId(id),
            result: Err(MeshError::Timeout {
                peer: PeerId(id),
                after: std::time::Duration::from_millis(10),
            }),
        }
    }

    const EPS: f32 = 1e-5;

    #[test]
    fn selects_exactly_k_with_unit_weight() {
        let router = router(&[(1, 0.1), (2, 0.9), (3, 0.5), (4, 0.3)]);
        let snapshot = snapshot((1..=4).map(|id| record(id, 100)).collect());
        let selection = router.select_in(snapshot, &[1.0, 2.0], 2).unwrap();

        assert_eq!(selection.targets(), vec![PeerId(2), PeerId(3)]);
        let weights = selection.weights();
        assert_eq!(weights.len(), 4);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < EPS);
        assert_eq!(weights[0], 0.0);
        assert_eq!(weights[3], 0.0);
        assert!(weights[1] > weights[2]);
    }

    #[test]
    fn k_larger_than_qualifying_returns_all_qualifying() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 95), record(3, 10)]);
        let selection = router.select_in(snapshot, &[1.0], 10).unwrap();
        assert_eq!(selection.targets(), vec![PeerId(1), PeerId(2)]);
        assert!((selection.weights().iter().sum::<f32>() - 1.0).abs() < EPS);
    }

    #[test]
    fn no_qualifying_peers_is_an_empty_selection() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 10), record(2, 20)]);
        let selection = router.select_in(snapshot, &[1.0], 3).unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.weights(), &[0.0, 0.0]);
    }

    #[test]
    fn stale_peers_are_excluded_whatever_their_score() {
        // C outscores both A and B but is stale.
        let router = router(&[(1, 0.1), (2, 0.2), (3, 100.0)]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 99), record(3, 50)]);
        let selection = router.select_in(snapshot.clone(), &[1.0], 2).unwrap();
        let mut targets = selection.targets();
        targets.sort();
        assert_eq!(targets, vec![PeerId(1), PeerId(2)]);
        assert_eq!(selection.weights()[snapshot.index_of(PeerId(3)).unwrap()], 0.0);
        assert!(snapshot.get(PeerId(3)).is_some());
    }

    #[test]
    fn ties_go_to_the_lower_peer_id() {
        let router = router(&[(5, 1.0), (2, 1.0), (9, 1.0)]);
        let snapshot = snapshot(vec![record(9, 100), record(5, 100), record(2, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 2).unwrap();
        assert_eq!(selection.targets(), vec![PeerId(2), PeerId(5)]);
    }

    #[test]
    fn invalid_selections_are_rejected() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100)]);
        assert!(matches!(
            router.select_in(snapshot.clone(), &[1.0], 0),
            Err(MeshError::InvalidSelection(_))
        ));
        assert!(matches!(
            router.select_in(snapshot.clone(), &[], 1),
            Err(MeshError::InvalidSelection(_))
        ));
        assert!(matches!(
            router.select_in(snapshot, &[1.0, f32::NAN], 1),
            Err(MeshError::InvalidSelection(_))
        ));
    }

    #[test]
    fn with_payload_replaces_every_request() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100)]);
        let input = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let selection = router
            .select_in(snapshot, &[1.0], 2)
            .unwrap()
            .with_payload(input.clone());
        assert!(selection.requests().iter().all(|r| r.payload == input));
    }

    #[test]
    fn join_zeroes_failed_peers_without_redistributing() {
        let router = router(&[(1, 0.0), (2, 0.0), (3, 0.0)]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100), record(3, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 3).unwrap();
        let third = 1.0 / 3.0;

        let result = router
            .join(
                &selection,
                vec![ok(1, vec![3.0, 0.0]), failed(2), ok(3, vec![0.0, 3.0])],
            )
            .unwrap();

        assert!((result.weights[0] - third).abs() < EPS);
        assert_eq!(result.weights[1], 0.0);
        assert!((result.weights[2] - third).abs() < EPS);
        assert!((result.support() - 2.0 * third).abs() < EPS);
        assert!((result.combined.data()[0] - 1.0).abs() < EPS);
        assert!((result.combined.data()[1] - 1.0).abs() < EPS);
        assert_eq!(result.responded, vec![PeerId(1), PeerId(3)]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, PeerId(2));
    }

    #[test]
    fn join_fails_when_every_peer_failed() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 2).unwrap();
        let err = router
            .join(&selection, vec![failed(1), failed(2)])
            .unwrap_err();
        assert!(matches!(err, MeshError::NoResponses { attempted: 2 }));
    }

    #[test]
    fn join_is_order_independent() {
        let router = router(&[(1, 0.3), (2, 0.7), (3, 0.1), (4, 0.9), (5, 0.5)]);
        let snapshot = snapshot((1..=5).map(|id| record(id, 100)).collect());
        let selection = router.select_in(snapshot, &[1.0], 5).unwrap();
        let data = |id: u64| vec![0.1 * id as f32, 1.0 / id as f32, -(id as f32).sqrt()];

        let baseline = router
            .join(&selection, (1..=5).map(|id| ok(id, data(id))).collect())
            .unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut ids: Vec<u64> = (1..=5).collect();
            ids.shuffle(&mut rng);
            let shuffled = router
                .join(&selection, ids.into_iter().map(|id| ok(id, data(id))).collect())
                .unwrap();
            assert_eq!(shuffled.combined, baseline.combined);
            assert_eq!(shuffled.weights, baseline.weights);
        }
    }

    #[test]
    fn join_treats_mismatched_shapes_as_failures() {
        let router = router(&[(1, 1.0), (2, 0.0)]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 2).unwrap();
        let result = router
            .join(&selection, vec![ok(1, vec![1.0, 1.0]), ok(2, vec![1.0])])
            .unwrap();
        assert_eq!(result.responded, vec![PeerId(1)]);
        assert_eq!(result.weights[1], 0.0);
        assert!(matches!(result.failures[0].1, MeshError::Malformed(_)));
    }

    #[test]
    fn join_takes_the_shape_most_peers_agree_on() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100), record(3, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 3).unwrap();
        let result = router
            .join(
                &selection,
                vec![ok(1, vec![9.0]), ok(2, vec![1.0, 1.0]), ok(3, vec![1.0, 1.0])],
            )
            .unwrap();
        assert_eq!(result.responded, vec![PeerId(2), PeerId(3)]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, PeerId(1));
        assert!(matches!(result.failures[0].1, MeshError::Malformed(_)));
        assert_eq!(result.weights[0], 0.0);
        assert_eq!(result.combined.shape(), &[2]);
        assert!((result.combined.data()[0] - 2.0 / 3.0).abs() < EPS);
    }

    #[test]
    fn peers_answering_twice_are_failed_in_any_order() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 2).unwrap();
        for responses in [
            vec![ok(1, vec![1.0]), ok(1, vec![5.0]), ok(2, vec![2.0])],
            vec![ok(1, vec![5.0]), ok(2, vec![2.0]), ok(1, vec![1.0])],
        ] {
            let result = router.join(&selection, responses).unwrap();
            assert_eq!(result.responded, vec![PeerId(2)]);
            assert_eq!(result.failures.len(), 1);
            assert_eq!(result.failures[0].0, PeerId(1));
            assert_eq!(result.weights[0], 0.0);
            assert!((result.combined.data()[0] - 1.0).abs() < EPS);
        }
    }

    #[test]
    fn infinite_scores_take_the_whole_weight() {
        let router = router(&[(1, f32::INFINITY), (2, 0.5), (3, f32::INFINITY)]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100), record(3, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 3).unwrap();
        assert_eq!(selection.weights(), &[0.5, 0.0, 0.5]);
    }

    #[test]
    fn join_reports_silent_peers() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 2).unwrap();
        let result = router.join(&selection, vec![ok(1, vec![1.0])]).unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].1.peer(), Some(PeerId(2)));
    }

    #[test]
    fn peer_weights_skip_zero_slots() {
        let router = router(&[]);
        let snapshot = snapshot(vec![record(1, 100), record(2, 100), record(3, 100)]);
        let selection = router.select_in(snapshot, &[1.0], 3).unwrap();
        let result = router
            .join(&selection, vec![ok(1, vec![1.0]), failed(2), ok(3, vec![1.0])])
            .unwrap();
        let ids: Vec<PeerId> = result.peer_weights().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![PeerId(1), PeerId(3)]);
    }
}
