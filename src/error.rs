use std::{fmt, time::Duration};

use crate::{metagraph::ledger::LedgerError, metagraph::PeerId, net};

/// Everything that can go wrong in the mesh.
///
/// Per-peer variants (`PeerUnreachable`, `Timeout`, `NotServing`, `Synapse`,
/// `Malformed`) travel as data inside a `RoutingResponse`; only whole-call
/// failures are returned as `Err`.
#[derive(Debug)]
pub enum MeshError {
    /// The ledger couldn't be reached or returned something unusable. The
    /// last published snapshot stays valid.
    DirectoryUnavailable(LedgerError),
    PeerUnreachable { peer: PeerId, reason: String },
    Timeout { peer: PeerId, after: Duration },
    /// Every selected peer failed.
    NoResponses { attempted: usize },
    /// The remote axon has no synapse registered, or is shutting down.
    NotServing,
    /// Rejected before any network call was made.
    InvalidSelection(String),
    /// The synapse behind an axon failed.
    Synapse(String),
    /// A peer sent something that doesn't decode or doesn't fit.
    Malformed(String),
    /// Local endpoint setup failed (bind, TLS).
    Transport(net::error::Error),
}

impl MeshError {
    /// The peer this failure is attributed to, where the error itself knows.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            MeshError::PeerUnreachable { peer, .. } | MeshError::Timeout { peer, .. } => {
                Some(*peer)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::DirectoryUnavailable(e) => write!(f, "peer directory unavailable: {e}"),
            MeshError::PeerUnreachable { peer, reason } => {
                write!(f, "peer {peer} unreachable: {reason}")
            }
            MeshError::Timeout { peer, after } => {
                write!(f, "peer {peer} timed out after {after:?}")
            }
            MeshError::NoResponses { attempted } => {
                write!(f, "none of the {attempted} selected peers responded")
            }
            MeshError::NotServing => write!(f, "axon is not serving"),
            MeshError::InvalidSelection(reason) => write!(f, "invalid selection: {reason}"),
            MeshError::Synapse(reason) => write!(f, "synapse failed: {reason}"),
            MeshError::Malformed(reason) => write!(f, "malformed message: {reason}"),
            MeshError::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for MeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MeshError::DirectoryUnavailable(e) => Some(e),
            MeshError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LedgerError> for MeshError {
    fn from(error: LedgerError) -> Self {
        Self::DirectoryUnavailable(error)
    }
}

impl From<net::error::Error> for MeshError {
    fn from(error: net::error::Error) -> Self {
        Self::Transport(error)
    }
}
