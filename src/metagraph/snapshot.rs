use std::{fmt, net::SocketAddr};

use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::warn;

use super::ledger::{LedgerError, LedgerState};
use crate::{config::MetagraphConfig, hex::HexDisplayExt};

/// A neuron's ledger uid. Stable for as long as the neuron stays registered.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One neuron as the ledger sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// The neuron's public key on the ledger.
    pub hotkey: [u8; 32],
    /// Where the neuron's axon listens.
    pub address: SocketAddr,
    pub stake: u64,
    /// Row-normalized across the snapshot.
    pub weight: f32,
    pub last_active_block: u64,
    pub registered_block: u64,
}

/// An immutable view of the peer table at one ledger block.
///
/// Peers are kept sorted by id; the dense index of a peer is its position in
/// that order and is only meaningful together with this snapshot's
/// `generation`.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    generation: u64,
    block: u64,
    peers: Vec<PeerRecord>,
    index: HashMap<PeerId, usize>,
    /// Consecutive fetches a carried-over peer has been missing from.
    absent: HashMap<PeerId, u32>,
    staleness_blocks: u64,
}

/// What changed between two snapshots. Only used for logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub carried: usize,
    pub evicted: usize,
}

impl Snapshot {
    /// The empty snapshot published before the first successful sync.
    pub fn empty(config: &MetagraphConfig) -> Self {
        Self {
            staleness_blocks: config.staleness_blocks,
            ..Default::default()
        }
    }

    /// Builds the successor of `self` from a fresh ledger fetch.
    pub(crate) fn advance(
        &self,
        state: LedgerState,
        config: &MetagraphConfig,
    ) -> Result<(Snapshot, SyncReport), LedgerError> {
        if self.generation > 0 && state.block < self.block {
            return Err(LedgerError::BlockRegressed {
                published: self.block,
                fetched: state.block,
            });
        }

        let mut report = SyncReport::default();
        let mut fetched: HashMap<PeerId, PeerRecord> = HashMap::with_capacity(state.peers.len());
        for record in state.peers {
            if let Some(previous) = fetched.insert(record.peer_id, record) {
                warn!(
                    peer = %previous.peer_id,
                    hotkey = %previous.hotkey.short_hex(),
                    "ledger listed a peer twice, keeping the last entry"
                );
            }
        }

        let mut absent = HashMap::new();
        for record in &self.peers {
            if fetched.contains_key(&record.peer_id) {
                continue;
            }
            let missed = self.absent.get(&record.peer_id).copied().unwrap_or(0) + 1;
            if missed < config.eviction_syncs() {
                absent.insert(record.peer_id, missed);
                fetched.insert(record.peer_id, record.clone());
                report.carried += 1;
            } else {
                report.evicted += 1;
            }
        }

        let eviction_blocks = config.eviction_blocks();
        let mut peers: Vec<PeerRecord> = fetched
            .into_values()
            .filter(|record| {
                let keep = state.block.saturating_sub(record.last_active_block) <= eviction_blocks;
                if !keep {
                    report.evicted += 1;
                    absent.remove(&record.peer_id);
                }
                keep
            })
            .collect();
        peers.sort_by_key(|record| record.peer_id);
        normalize_weights(&mut peers);

        report.added = peers
            .iter()
            .filter(|record| !self.index.contains_key(&record.peer_id))
            .count();

        let index = peers
            .iter()
            .enumerate()
            .map(|(i, record)| (record.peer_id, i))
            .collect();

        let next = Snapshot {
            generation: self.generation + 1,
            block: state.block,
            peers,
            index,
            absent,
            staleness_blocks: config.staleness_blocks,
        };
        Ok((next, report))
    }

    /// Bumped on every published snapshot; 0 means never synced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All peers in dense-index order, stale ones included.
    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerRecord> {
        self.index_of(peer_id).map(|i| &self.peers[i])
    }

    pub fn index_of(&self, peer_id: PeerId) -> Option<usize> {
        self.index.get(&peer_id).copied()
    }

    /// Blocks since the peer was last active.
    pub fn staleness(&self, record: &PeerRecord) -> u64 {
        self.block.saturating_sub(record.last_active_block)
    }

    pub fn qualifies(&self, record: &PeerRecord) -> bool {
        self.staleness(record) <= self.staleness_blocks
    }

    /// Peers eligible for routing, with their dense index.
    pub fn qualifying(&self) -> impl Iterator<Item = (usize, &PeerRecord)> + '_ {
        self.peers
            .iter()
            .enumerate()
            .filter(move |(_, record)| self.qualifies(record))
    }

    /// Ledger weights in dense-index order.
    pub fn weights(&self) -> Vec<f32> {
        self.peers.iter().map(|record| record.weight).collect()
    }

    /// Number of consecutive fetches this peer has been missing from.
    pub fn missed_syncs(&self, peer_id: PeerId) -> u32 {
        self.absent.get(&peer_id).copied().unwrap_or(0)
    }
}

/// Scales weights to sum to 1. Negative or non-finite weights count as 0; if
/// nothing is left the whole row is zeroed.
fn normalize_weights(peers: &mut [PeerRecord]) {
    for record in peers.iter_mut() {
        if !record.weight.is_finite() || record.weight < 0.0 {
            record.weight = 0.0;
        }
    }
    let total: f32 = peers.iter().map(|record| record.weight).sum();
    for record in peers.iter_mut() {
        record.weight = if total > 0.0 {
            record.weight / total
        } else {
            0.0
        };
    }
}
