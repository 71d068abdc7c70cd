use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{config::MetagraphConfig, error::MeshError, hex::HexDisplayExt};

pub mod ledger;
mod snapshot;
pub mod weights;

use ledger::{LedgerOracle, LocalDescriptor, WeightUpdate};
pub use snapshot::{PeerId, PeerRecord, Snapshot, SyncReport};

#[cfg(test)]
pub(crate) use snapshot::tests as snapshot_fixtures;

/// The mesh's view of the ledger.
///
/// `sync` is the only writer. Each successful sync publishes a fresh
/// immutable `Snapshot` by swapping it into a watch channel, so readers never
/// see a half-built table and never wait on a sync in progress.
pub struct Metagraph {
    oracle: Arc<dyn LedgerOracle>,
    config: MetagraphConfig,
    published: watch::Sender<Arc<Snapshot>>,
    /// Serializes syncs; readers never touch it.
    sync_lock: Mutex<()>,
}

impl Metagraph {
    pub fn new(oracle: Arc<dyn LedgerOracle>, config: MetagraphConfig) -> Self {
        let (published, _) = watch::channel(Arc::new(Snapshot::empty(&config)));
        Self {
            oracle,
            config,
            published,
            sync_lock: Mutex::new(()),
        }
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.borrow().clone()
    }

    /// A receiver that is notified on every publish.
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.published.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        self.published.borrow().generation() > 0
    }

    pub fn config(&self) -> &MetagraphConfig {
        &self.config
    }

    /// Pulls the peer table from the ledger and publishes it. On failure the
    /// previous snapshot stays published.
    pub async fn sync(&self) -> Result<Arc<Snapshot>, MeshError> {
        let span = debug_span!("metagraph_sync");
        async move {
            let _guard = self.sync_lock.lock().await;
            let state = self.oracle.fetch_peers().await.map_err(|e| {
                warn!(error = %e, "ledger fetch failed, keeping the last snapshot");
                MeshError::DirectoryUnavailable(e)
            })?;

            let current = self.snapshot();
            let (next, report) = current.advance(state, &self.config).map_err(|e| {
                warn!(error = %e, "discarding ledger fetch");
                MeshError::DirectoryUnavailable(e)
            })?;

            if report.added > 0 || report.evicted > 0 {
                info!(
                    block = next.block(),
                    peers = next.len(),
                    added = report.added,
                    evicted = report.evicted,
                    "peer table changed"
                );
            } else {
                debug!(
                    block = next.block(),
                    peers = next.len(),
                    carried = report.carried,
                    "synced"
                );
            }

            let next = Arc::new(next);
            self.published.send_replace(next.clone());
            Ok(next)
        }
        .instrument(span)
        .await
    }

    /// Registers this neuron with the ledger.
    pub async fn subscribe(&self, descriptor: LocalDescriptor) -> Result<(), MeshError> {
        debug!(
            peer = %descriptor.peer_id,
            hotkey = %descriptor.hotkey.short_hex(),
            address = %descriptor.address,
            "subscribing to the ledger"
        );
        self.oracle.register(descriptor).await?;
        Ok(())
    }

    /// Publishes locally learned weights to the ledger.
    pub async fn emit(&self, update: WeightUpdate) -> Result<(), MeshError> {
        debug!(
            peer = %update.source,
            block = update.block,
            entries = update.weights.len(),
            "emitting weights"
        );
        self.oracle.publish_weights(update).await?;
        Ok(())
    }
}
