use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use neuron_mesh::{
    AxonConfig, DendriteConfig, InMemoryLedger, KeyGate, LocalDescriptor, Mesh, MeshConfig,
    PeerId, Synapse, SynapseError, Tensor,
};
use tracing::{info, warn};

/// Stands in for a model: multiplies its input by a fixed factor.
struct Scale(f32);

impl Synapse for Scale {
    fn forward(
        &self,
        source: Option<PeerId>,
        input: Tensor,
    ) -> BoxFuture<'_, Result<Tensor, SynapseError>> {
        Box::pin(async move {
            tracing::debug!(?source, factor = self.0, "forward");
            Ok(input.scaled(self.0))
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let ledger = InMemoryLedger::new();

    let mut neurons = Vec::new();
    for id in 1..=3u64 {
        let config = MeshConfig::builder()
            .dendrite(
                DendriteConfig::builder()
                    .bind(loopback)
                    .timeout(Duration::from_secs(2))
                    .build(),
            )
            .axon(AxonConfig::builder().bind(loopback).build())
            .sync_interval(Duration::from_secs(1))
            .build();
        let local = LocalDescriptor {
            peer_id: PeerId(id),
            hotkey: *blake3::hash(format!("neuron-{id}").as_bytes()).as_bytes(),
            address: loopback,
            stake: 1_000 * id,
        };
        let mesh = Mesh::new(
            config,
            local,
            Arc::new(ledger.clone()),
            Arc::new(KeyGate::new().with_stake_prior(0.1)),
        )
        .unwrap();
        mesh.serve(Arc::new(Scale(id as f32))).await;
        let addr = mesh.start().await.unwrap();
        info!(peer = id, %addr, "neuron up");
        neurons.push(mesh);
    }
    for neuron in &neurons {
        neuron.maintain().await.unwrap();
    }

    let caller = &neurons[0];
    for round in 0..5 {
        ledger.advance(1).await;
        let context = vec![1.0, round as f32 * 0.25, -0.5, 0.75];
        match caller.query(&context, 2).await {
            Ok(result) => {
                info!(
                    round,
                    responded = ?result.responded,
                    combined = ?result.combined.data(),
                    "query answered"
                );
                caller.learn(&result).await;
                let feedback = result
                    .responded
                    .iter()
                    .map(|peer_id| (*peer_id, vec![1.0]))
                    .collect();
                for (peer_id, ack) in caller.grade(feedback).await {
                    if let Err(e) = ack {
                        warn!(peer = %peer_id, error = %e, "grade failed");
                    }
                }
            }
            Err(e) => warn!(round, error = %e, "query failed"),
        }
    }

    match caller.maintain().await {
        Ok(emitted) => info!(emitted, weights = ?caller.weights().await.to_vec(), "weights"),
        Err(e) => warn!(error = %e, "emission failed"),
    }

    for neuron in &neurons {
        neuron.stop().await;
    }
}
