use std::{collections::BTreeMap, fmt, net::SocketAddr, sync::Arc};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use super::{PeerId, PeerRecord};

/// The chain the mesh reads its peer table from and reports weights to.
/// Consensus happens elsewhere; from here the ledger is just an oracle.
pub trait LedgerOracle: Send + Sync {
    /// The current block and every registered neuron.
    fn fetch_peers(&self) -> BoxFuture<'_, Result<LedgerState, LedgerError>>;

    /// Registers (or refreshes) this neuron's endpoint and stake.
    fn register(&self, descriptor: LocalDescriptor) -> BoxFuture<'_, Result<(), LedgerError>>;

    /// Publishes this neuron's learned weights over its peers.
    fn publish_weights(&self, update: WeightUpdate) -> BoxFuture<'_, Result<(), LedgerError>>;
}

#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub block: u64,
    pub peers: Vec<PeerRecord>,
}

/// How this neuron presents itself to the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalDescriptor {
    pub peer_id: PeerId,
    pub hotkey: [u8; 32],
    pub address: SocketAddr,
    pub stake: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WeightUpdate {
    pub source: PeerId,
    /// Block of the snapshot the weights were learned against.
    pub block: u64,
    pub weights: Vec<(PeerId, f32)>,
}

#[derive(Debug)]
pub enum LedgerError {
    Unreachable(String),
    Rejected(String),
    /// The ledger answered with a block older than the one already published.
    BlockRegressed { published: u64, fetched: u64 },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Unreachable(reason) => write!(f, "ledger unreachable: {reason}"),
            LedgerError::Rejected(reason) => write!(f, "ledger rejected the call: {reason}"),
            LedgerError::BlockRegressed { published, fetched } => write!(
                f,
                "ledger returned block {fetched}, older than published block {published}"
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

/// An in-process ledger. Blocks only advance when told to.
///
/// Can be cloned to obtain another handle to the same ledger.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    inner: Arc<RwLock<LedgerInner>>,
}

#[derive(Default)]
struct LedgerInner {
    block: u64,
    peers: BTreeMap<PeerId, PeerRecord>,
    published: Vec<WeightUpdate>,
    unreachable: bool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn block(&self) -> u64 {
        self.inner.read().await.block
    }

    /// Moves the chain forward and returns the new block.
    pub async fn advance(&self, blocks: u64) -> u64 {
        let mut inner = self.inner.write().await;
        inner.block += blocks;
        inner.block
    }

    /// Inserts or replaces a peer verbatim.
    pub async fn upsert(&self, record: PeerRecord) {
        self.inner.write().await.peers.insert(record.peer_id, record);
    }

    pub async fn remove(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.inner.write().await.peers.remove(&peer_id)
    }

    /// Marks a peer active at the current block.
    pub async fn touch(&self, peer_id: PeerId) {
        let mut inner = self.inner.write().await;
        let block = inner.block;
        if let Some(record) = inner.peers.get_mut(&peer_id) {
            record.last_active_block = block;
        }
    }

    /// While unreachable, every call fails with `LedgerError::Unreachable`.
    pub async fn set_reachable(&self, reachable: bool) {
        self.inner.write().await.unreachable = !reachable;
    }

    pub async fn published(&self) -> Vec<WeightUpdate> {
        self.inner.read().await.published.clone()
    }

    pub async fn get(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.inner.read().await.peers.get(&peer_id).cloned()
    }
}

impl LedgerInner {
    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.unreachable {
            Err(LedgerError::Unreachable("ledger is offline".into()))
        } else {
            Ok(())
        }
    }
}

impl LedgerOracle for InMemoryLedger {
    fn fetch_peers(&self) -> BoxFuture<'_, Result<LedgerState, LedgerError>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            inner.check_reachable()?;
            Ok(LedgerState {
                block: inner.block,
                peers: inner.peers.values().cloned().collect(),
            })
        })
    }

    fn register(&self, descriptor: LocalDescriptor) -> BoxFuture<'_, Result<(), LedgerError>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            inner.check_reachable()?;
            let block = inner.block;
            let record = inner
                .peers
                .entry(descriptor.peer_id)
                .or_insert_with(|| PeerRecord {
                    peer_id: descriptor.peer_id,
                    hotkey: descriptor.hotkey,
                    address: descriptor.address,
                    stake: descriptor.stake,
                    weight: 0.0,
                    last_active_block: block,
                    registered_block: block,
                });
            if record.hotkey != descriptor.hotkey {
                return Err(LedgerError::Rejected(format!(
                    "uid {} is registered to another hotkey",
                    descriptor.peer_id
                )));
            }
            record.address = descriptor.address;
            record.stake = descriptor.stake;
            record.last_active_block = block;
            debug!(peer = %descriptor.peer_id, %block, "registered neuron");
            Ok(())
        })
    }

    fn publish_weights(&self, update: WeightUpdate) -> BoxFuture<'_, Result<(), LedgerError>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            inner.check_reachable()?;
            let block = inner.block;
            match inner.peers.get_mut(&update.source) {
                Some(record) => record.last_active_block = block,
                None => {
                    return Err(LedgerError::Rejected(format!(
                        "uid {} is not registered",
                        update.source
                    )))
                }
            }
            inner.published.push(update);
            Ok(())
        })
    }
}
