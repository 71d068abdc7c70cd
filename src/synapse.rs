use std::fmt;

use futures::future::BoxFuture;

use crate::{metagraph::PeerId, tensor::Tensor};

/// The compute unit an axon serves. The mesh never looks inside a synapse;
/// it only feeds it tensors and relays what comes back.
pub trait Synapse: Send + Sync {
    /// Runs the model on an input sent by `source` (if the caller identified
    /// itself).
    fn forward(&self, source: Option<PeerId>, input: Tensor)
        -> BoxFuture<'_, Result<Tensor, SynapseError>>;

    /// Receives feedback about a previous forward. The returned flag is the
    /// acknowledgment sent back to the caller.
    fn grade(
        &self,
        source: Option<PeerId>,
        feedback: Vec<f32>,
    ) -> BoxFuture<'_, Result<bool, SynapseError>> {
        let _ = (source, feedback);
        Box::pin(async { Ok(true) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynapseError(pub String);

impl SynapseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl fmt::Display for SynapseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SynapseError {}
