use std::{net::SocketAddr, sync::Arc};

use tokio::{
    select,
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::MeshConfig,
    error::MeshError,
    metagraph::{
        ledger::{LedgerOracle, LocalDescriptor, WeightUpdate},
        weights::LocalWeights,
        Metagraph, PeerId, Snapshot,
    },
    net::{
        axon::{Axon, AxonState},
        dendrite::Dendrite,
    },
    router::{gate::Gate, AggregatedResult, Router},
    synapse::Synapse,
};

/// One neuron: a metagraph kept in sync with the ledger, a router and a
/// dendrite for outgoing queries, and an axon serving the local synapse.
///
/// Nothing runs until `start`. Must be created inside a tokio runtime.
pub struct Mesh {
    config: MeshConfig,
    local: LocalDescriptor,
    metagraph: Arc<Metagraph>,
    router: Router,
    dendrite: Dendrite,
    axon: Axon,
    weights: Arc<Mutex<WeightState>>,
    background: Mutex<Option<Background>>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct WeightState {
    current: LocalWeights,
    last_emitted: Option<LocalWeights>,
    /// Block of the last emission or registration.
    last_active_block: Option<u64>,
}

impl Mesh {
    pub fn new(
        config: MeshConfig,
        local: LocalDescriptor,
        oracle: Arc<dyn LedgerOracle>,
        gate: Arc<dyn Gate>,
    ) -> Result<Self, MeshError> {
        let metagraph = Arc::new(Metagraph::new(oracle, config.metagraph.clone()));
        let router = Router::new(metagraph.clone(), gate, config.router.clone());
        let dendrite = Dendrite::new(config.dendrite.clone())?.with_source(local.peer_id);
        let axon = Axon::new(config.axon.clone());
        Ok(Self {
            config,
            local,
            metagraph,
            router,
            dendrite,
            axon,
            weights: Arc::new(Mutex::new(WeightState::default())),
            background: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    pub fn metagraph(&self) -> &Arc<Metagraph> {
        &self.metagraph
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn dendrite(&self) -> &Dendrite {
        &self.dendrite
    }

    pub fn axon(&self) -> &Axon {
        &self.axon
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.metagraph.snapshot()
    }

    /// Registers the synapse the axon serves. Can be called again at any time
    /// to swap in a new one.
    pub async fn serve(&self, synapse: Arc<dyn Synapse>) {
        self.axon.serve(synapse).await;
    }

    pub async fn unserve(&self) {
        self.axon.unserve().await;
    }

    /// Syncs the metagraph, starts the axon, registers with the ledger and
    /// spawns the background sync loop. Returns the axon's bound address.
    ///
    /// Fails with `DirectoryUnavailable` if the ledger can't be reached and
    /// no snapshot was ever published. Starting a running mesh does nothing.
    pub async fn start(&self) -> Result<SocketAddr, MeshError> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return self.axon.start().await;
        }

        if let Err(e) = self.metagraph.sync().await {
            if !self.metagraph.is_synced() {
                return Err(e);
            }
            warn!(error = %e, "starting on the last known snapshot");
        }

        let bound = self.axon.start().await?;
        let descriptor = LocalDescriptor {
            address: advertised(self.local.address, bound),
            ..self.local.clone()
        };
        if let Err(e) = self.metagraph.subscribe(descriptor).await {
            self.axon.stop().await;
            return Err(e);
        }
        self.weights.lock().await.last_active_block = Some(self.metagraph.snapshot().block());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = debug_span!("mesh", peer = %self.local.peer_id);
        let handle = tokio::spawn(
            background_loop(
                self.metagraph.clone(),
                self.weights.clone(),
                self.config.clone(),
                self.local.peer_id,
                shutdown_rx,
            )
            .instrument(span),
        );
        *background = Some(Background { shutdown, handle });

        info!(peer = %self.local.peer_id, addr = %bound, "mesh started");
        Ok(bound)
    }

    /// Stops the background loop and the axon. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut background = self.background.lock().await;
        if let Some(Background { shutdown, handle }) = background.take() {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop panicked");
            }
            info!(peer = %self.local.peer_id, "mesh stopped");
        }
        self.axon.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.axon.state() == AxonState::Serving
    }

    /// Routes `context` to the best `k` peers and folds their answers.
    pub async fn query(&self, context: &[f32], k: usize) -> Result<AggregatedResult, MeshError> {
        let selection = self.router.select(context, k)?;
        let responses = self
            .dendrite
            .dispatch(
                selection.snapshot(),
                selection.requests().to_vec(),
                self.config.dendrite.timeout,
            )
            .await;
        self.router.join(&selection, responses)
    }

    /// Sends feedback on earlier answers to the peers that gave them.
    pub async fn grade(
        &self,
        feedback: Vec<(PeerId, Vec<f32>)>,
    ) -> Vec<(PeerId, Result<bool, MeshError>)> {
        let snapshot = self.metagraph.snapshot();
        self.dendrite
            .grade(&snapshot, feedback, self.config.dendrite.timeout)
            .await
    }

    /// Folds the peers' share of an aggregated result into the local weights.
    pub async fn learn(&self, result: &AggregatedResult) {
        let learned = result.peer_weights();
        let mut state = self.weights.lock().await;
        state.current.blend(&learned, self.config.weight_decay);
        debug!(peers = learned.len(), "learned weights");
    }

    pub async fn weights(&self) -> LocalWeights {
        self.weights.lock().await.current.clone()
    }

    /// Runs one round of the background loop right away: sync, then emit if
    /// the weights moved or a heartbeat is due. Returns whether it emitted.
    pub async fn maintain(&self) -> Result<bool, MeshError> {
        if let Err(e) = self.metagraph.sync().await {
            debug!(error = %e, "sync failed, emitting against the last snapshot");
        }
        maybe_emit(&self.metagraph, &self.weights, &self.config, self.local.peer_id).await
    }
}

/// The address other neurons should dial: the configured one, with the
/// bound port and IP filled in where the configuration left them open.
fn advertised(configured: SocketAddr, bound: SocketAddr) -> SocketAddr {
    let mut address = configured;
    if address.port() == 0 {
        address.set_port(bound.port());
    }
    if address.ip().is_unspecified() {
        address.set_ip(bound.ip());
    }
    address
}

async fn background_loop(
    metagraph: Arc<Metagraph>,
    weights: Arc<Mutex<WeightState>>,
    config: MeshConfig,
    source: PeerId,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(config.sync_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and start just synced
    interval.tick().await;

    loop {
        select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        // shutdown cancels a round in flight
        let round = async {
            // failures are logged by the metagraph; the last snapshot stays usable
            let _ = metagraph.sync().await;
            if let Err(e) = maybe_emit(&metagraph, &weights, &config, source).await {
                warn!(error = %e, "weight emission failed");
            }
        };
        select! {
            _ = round => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("background loop exited");
}

async fn maybe_emit(
    metagraph: &Metagraph,
    weights: &Mutex<WeightState>,
    config: &MeshConfig,
    source: PeerId,
) -> Result<bool, MeshError> {
    let snapshot = metagraph.snapshot();
    let block = snapshot.block();
    let (update, emitted, moved, heartbeat) = {
        let mut state = weights.lock().await;
        state.current.retain(|peer_id| snapshot.get(peer_id).is_some());

        let moved = match &state.last_emitted {
            Some(last) => state.current.distance(last) > config.emit_tolerance,
            None => !state.current.is_empty(),
        };
        let heartbeat = match (config.heartbeat_blocks, state.last_active_block) {
            (Some(every), Some(last)) => block.saturating_sub(last) >= every,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !moved && !heartbeat {
            return Ok(false);
        }

        let update = WeightUpdate {
            source,
            block,
            weights: state.current.to_vec(),
        };
        (update, state.current.clone(), moved, heartbeat)
    };

    // not held across the ledger call
    metagraph.emit(update).await?;
    let mut state = weights.lock().await;
    state.last_emitted = Some(emitted);
    state.last_active_block = Some(block);
    debug!(block, moved, heartbeat, "emitted weights");
    Ok(true)
}
