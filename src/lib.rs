// Every neuron in the mesh plays two roles at once. As a server, its axon
// accepts forward and grade calls from other neurons and hands them to the
// locally registered synapse. As a client, it picks a handful of peers for
// each piece of work, fans the work out through its dendrite and folds the
// answers back together, weighting each peer by how useful it has been.

// Who the peers are is decided by the ledger, not by gossip. The metagraph
// pulls the peer table from the ledger on a timer and publishes it as an
// immutable snapshot. Readers hold an `Arc` to whichever snapshot was current
// when their call began, so a sync landing halfway through a query never
// reshuffles the dense indices the router scattered its weights into. A
// failed sync leaves the previous snapshot in place; a stale table is still a
// usable table.

// Failures of individual peers are data, not errors. A dispatch returns one
// tagged response per peer and only gives up as a whole when nobody answered.

pub mod config;
pub mod error;
mod hex;
pub mod mesh;
pub mod metagraph;
pub mod net;
pub mod router;
pub mod synapse;
pub mod tensor;

pub use config::{AxonConfig, DendriteConfig, MeshConfig, MetagraphConfig, RouterConfig};
pub use error::MeshError;
pub use mesh::Mesh;
pub use metagraph::{
    ledger::{InMemoryLedger, LedgerError, LedgerOracle, LedgerState, LocalDescriptor, WeightUpdate},
    Metagraph, PeerId, PeerRecord, Snapshot,
};
pub use net::{
    axon::{Axon, AxonState},
    dendrite::Dendrite,
};
pub use router::{
    gate::{Gate, KeyGate},
    AggregatedResult, Router, RoutingRequest, RoutingResponse, Selection,
};
pub use synapse::{Synapse, SynapseError};
pub use tensor::Tensor;
