use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::net::{ip_addr_to_socket_addr, AXON_PORT};

/// Peer table policy. Block counts are ledger blocks.
#[derive(TypedBuilder, Clone, Debug)]
pub struct MetagraphConfig {
    /// A peer only qualifies for routing if it was active within this many
    /// blocks of the current block.
    #[builder(default = 100)]
    pub staleness_blocks: u64,
    /// Peers lagging more than this many blocks are dropped from the table.
    /// Clamped to at least `staleness_blocks`.
    #[builder(default = 1000)]
    pub eviction_blocks: u64,
    /// Peers missing from this many consecutive ledger fetches are dropped.
    /// Clamped to at least 1.
    #[builder(default = 3)]
    pub eviction_syncs: u32,
}

impl MetagraphConfig {
    pub(crate) fn eviction_blocks(&self) -> u64 {
        self.eviction_blocks.max(self.staleness_blocks)
    }

    pub(crate) fn eviction_syncs(&self) -> u32 {
        self.eviction_syncs.max(1)
    }
}

impl Default for MetagraphConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct RouterConfig {
    /// Number of peers `Mesh::query` routes to.
    #[builder(default = 10)]
    pub topk: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct DendriteConfig {
    /// Local address of the client endpoint.
    #[builder(default = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))]
    pub bind: SocketAddr,
    /// Upper bound on outbound calls in flight for one dispatch.
    #[builder(default = 32)]
    pub max_concurrent_calls: usize,
    /// Per-peer deadline used by `Mesh::query`.
    #[builder(default = Duration::from_secs(5))]
    pub timeout: Duration,
    /// Request bodies larger than this are zstd-compressed.
    #[builder(default = 16 * 1024)]
    pub compress_threshold: usize,
}

impl Default for DendriteConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct AxonConfig {
    #[builder(default = ip_addr_to_socket_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED), AXON_PORT))]
    pub bind: SocketAddr,
    /// How long `stop` waits for in-flight requests before aborting them.
    #[builder(default = Duration::from_secs(5))]
    pub grace_period: Duration,
    /// Upper bound on a single synapse call.
    #[builder(default = Duration::from_secs(10))]
    pub request_timeout: Duration,
    /// Concurrent request streams a single caller may have open.
    #[builder(default = 64)]
    pub max_concurrent_streams: u32,
    /// Response bodies larger than this are zstd-compressed.
    #[builder(default = 16 * 1024)]
    pub compress_threshold: usize,
}

impl Default for AxonConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct MeshConfig {
    #[builder(default)]
    pub metagraph: MetagraphConfig,
    #[builder(default)]
    pub router: RouterConfig,
    #[builder(default)]
    pub dendrite: DendriteConfig,
    #[builder(default)]
    pub axon: AxonConfig,
    /// Period of the background ledger sync.
    #[builder(default = Duration::from_secs(12))]
    pub sync_interval: Duration,
    /// Minimum L1 distance between the local weights and the last emitted
    /// weights before a new emission is worth sending.
    #[builder(default = 0.01)]
    pub emit_tolerance: f32,
    /// Emit anyway once this many blocks passed since the last emission, so
    /// the ledger keeps seeing this neuron as active. `None` disables it.
    #[builder(default = Some(50))]
    pub heartbeat_blocks: Option<u64>,
    /// Step size of the moving average applied by `Mesh::learn`.
    #[builder(default = 0.05)]
    pub weight_decay: f32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
