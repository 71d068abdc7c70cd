use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use hashbrown::HashSet;
use quinn::VarInt;
use tokio::{
    sync::Semaphore,
    time::{self, Instant},
};
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    error::Error,
    tls,
    wire::{read_frame, write_frame, ErrorCode, WireRequest, WireResponse},
    SERVER_NAME,
};
use crate::{
    config::DendriteConfig,
    error::MeshError,
    metagraph::{PeerId, Snapshot},
    router::{RoutingRequest, RoutingResponse},
    tensor::Tensor,
};

/// The calling side of a neuron. Fans requests out to peer axons, at most
/// `max_concurrent_calls` at a time, and hands back one tagged result per
/// request. A dispatch never fails as a whole.
pub struct Dendrite {
    endpoint: quinn::Endpoint,
    limit: Arc<Semaphore>,
    config: DendriteConfig,
    source: Option<PeerId>,
}

impl Dendrite {
    pub fn new(config: DendriteConfig) -> Result<Self, MeshError> {
        let mut endpoint = quinn::Endpoint::client(config.bind).map_err(Error::from)?;
        endpoint.set_default_client_config(tls::client_config()?);
        Ok(Self {
            endpoint,
            limit: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
            config,
            source: None,
        })
    }

    /// Identifies outgoing calls as coming from `source`.
    pub fn with_source(mut self, source: PeerId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &DendriteConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MeshError> {
        Ok(self.endpoint.local_addr().map_err(Error::from)?)
    }

    /// Sends each request's payload to its target's synapse. Responses come
    /// back in request order. Every peer's deadline is `timeout` from the
    /// moment the dispatch started, including time spent waiting for a slot.
    pub async fn dispatch(
        &self,
        snapshot: &Snapshot,
        requests: Vec<RoutingRequest>,
        timeout: Duration,
    ) -> Vec<RoutingResponse> {
        let span = debug_span!(
            "dispatch",
            calls = requests.len(),
            generation = snapshot.generation()
        );
        async move {
            let sent_at = Utc::now().timestamp_micros();
            let calls = requests
                .into_iter()
                .map(|request| {
                    let wire = WireRequest::Forward {
                        source: self.source,
                        sent_at,
                        payload: request.payload,
                    };
                    (request.target, wire)
                })
                .collect();

            let results = self.fan_out(snapshot, calls, timeout, forward_output).await;
            debug!(
                failed = results.iter().filter(|(_, r)| r.is_err()).count(),
                "dispatch finished"
            );
            results
                .into_iter()
                .map(|(source, result)| RoutingResponse { source, result })
                .collect()
        }
        .instrument(span)
        .await
    }

    /// Sends feedback to each peer's synapse and collects the
    /// acknowledgments, with the same containment as `dispatch`.
    pub async fn grade(
        &self,
        snapshot: &Snapshot,
        feedback: Vec<(PeerId, Vec<f32>)>,
        timeout: Duration,
    ) -> Vec<(PeerId, Result<bool, MeshError>)> {
        let span = debug_span!("grade", calls = feedback.len());
        async move {
            let sent_at = Utc::now().timestamp_micros();
            let calls = feedback
                .into_iter()
                .map(|(peer_id, feedback)| {
                    let wire = WireRequest::Grade {
                        source: self.source,
                        sent_at,
                        feedback,
                    };
                    (peer_id, wire)
                })
                .collect();
            self.fan_out(snapshot, calls, timeout, grade_output).await
        }
        .instrument(span)
        .await
    }

    /// Refuses further calls and closes every open connection.
    pub fn close(&self) {
        self.limit.close();
        self.endpoint.close(VarInt::from_u32(0), b"closed");
    }

    async fn fan_out<T>(
        &self,
        snapshot: &Snapshot,
        calls: Vec<(PeerId, WireRequest)>,
        timeout: Duration,
        extract: fn(WireResponse) -> Result<T, Error>,
    ) -> Vec<(PeerId, Result<T, MeshError>)> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or_else(far_future);
        let mut seen = HashSet::with_capacity(calls.len());

        let calls = calls.into_iter().map(|(peer_id, request)| {
            let address = if !seen.insert(peer_id) {
                Err(MeshError::InvalidSelection(format!(
                    "peer {peer_id} targeted more than once"
                )))
            } else {
                snapshot
                    .get(peer_id)
                    .map(|record| record.address)
                    .ok_or_else(|| MeshError::PeerUnreachable {
                        peer: peer_id,
                        reason: "not in the peer table".into(),
                    })
            };

            async move {
                let address = match address {
                    Ok(address) => address,
                    Err(e) => return (peer_id, Err(e)),
                };
                let call = async {
                    let _permit = self
                        .limit
                        .acquire()
                        .await
                        .map_err(|_| Error::EndpointClosed)?;
                    let response = self.call(address, &request).await?;
                    extract(response)
                };
                let result = match time::timeout_at(deadline, call).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(attribute(peer_id, e, started.elapsed())),
                    Err(_) => Err(MeshError::Timeout {
                        peer: peer_id,
                        after: timeout,
                    }),
                };
                if let Err(e) = &result {
                    trace!(error = %e, "call failed");
                }
                (peer_id, result)
            }
            .instrument(debug_span!("call", peer = %peer_id))
        });
        join_all(calls).await
    }

    /// One connection and one stream per call.
    async fn call(&self, address: SocketAddr, request: &WireRequest) -> Result<WireResponse, Error> {
        let conn = self.endpoint.connect(address, SERVER_NAME)?.await?;
        trace!(remote = %address, "connected via QUIC");
        let (mut send, mut recv) = conn.open_bi().await?;
        write_frame(&mut send, request, self.config.compress_threshold).await?;
        send.finish().await?;
        let response = read_frame(&mut recv).await?;
        conn.close(VarInt::from_u32(0), b"done");
        Ok(response)
    }
}

/// Roughly 30 years from now. Stands in for deadlines too far out for
/// `Instant` to represent.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

fn forward_output(response: WireResponse) -> Result<Tensor, Error> {
    match response {
        WireResponse::Forward(tensor) => {
            tensor
                .validate()
                .map_err(|e| Error::CouldNotDecodeMessage(e.to_string()))?;
            Ok(tensor)
        }
        WireResponse::Error { code, message } => Err(Error::Remote { code, message }),
        WireResponse::Grade(_) => Err(Error::UnexpectedResponse),
    }
}

fn grade_output(response: WireResponse) -> Result<bool, Error> {
    match response {
        WireResponse::Grade(ack) => Ok(ack),
        WireResponse::Error { code, message } => Err(Error::Remote { code, message }),
        WireResponse::Forward(_) => Err(Error::UnexpectedResponse),
    }
}

/// Turns a transport failure into a per-peer `MeshError`.
fn attribute(peer: PeerId, error: Error, elapsed: Duration) -> MeshError {
    match error {
        Error::Remote { code, message } => match code {
            ErrorCode::NotServing => MeshError::NotServing,
            ErrorCode::SynapseFailed => MeshError::Synapse(message),
            ErrorCode::Timeout => MeshError::Timeout {
                peer,
                after: elapsed,
            },
            ErrorCode::BadRequest => MeshError::Malformed(message),
        },
        e @ (Error::CouldNotDecodeMessage(_)
        | Error::CouldNotEncodeMessage(_)
        | Error::UnsupportedVersion(_)
        | Error::FrameTooLarge(_)
        | Error::UnexpectedResponse) => MeshError::Malformed(e.to_string()),
        e => MeshError::PeerUnreachable {
            peer,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::MetagraphConfig, metagraph::snapshot_fixtures::*};

    fn dendrite() -> Dendrite {
        Dendrite::new(
            DendriteConfig::builder()
                .bind("127.0.0.1:0".parse().unwrap())
                .build(),
        )
        .unwrap()
    }

    fn request(id: u64) -> RoutingRequest {
        RoutingRequest {
            target: PeerId(id),
            payload: Tensor::vector(vec![1.0]),
        }
    }

    #[tokio::test]
    async fn rejects_duplicates_and_unknown_peers_per_slot() {
        let dendrite = dendrite();
        let snapshot = snapshot_at(10, vec![], &MetagraphConfig::default());

        let responses = dendrite
            .dispatch(
                &snapshot,
                vec![request(1), request(1)],
                Duration::from_millis(200),
            )
            .await;
        assert_eq!(responses.len(), 2);
        assert!(matches!(
            responses[0].result,
            Err(MeshError::PeerUnreachable { peer: PeerId(1), .. })
        ));
        assert!(matches!(
            responses[1].result,
            Err(MeshError::InvalidSelection(_))
        ));
    }

    #[tokio::test]
    async fn unbounded_timeouts_do_not_overflow() {
        let dendrite = dendrite();
        let snapshot = snapshot_at(10, vec![], &MetagraphConfig::default());
        let responses = dendrite
            .dispatch(&snapshot, vec![request(1)], Duration::MAX)
            .await;
        assert!(matches!(
            responses[0].result,
            Err(MeshError::PeerUnreachable { peer: PeerId(1), .. })
        ));
        let acks = dendrite
            .grade(&snapshot, vec![(PeerId(1), vec![1.0])], Duration::MAX)
            .await;
        assert!(acks[0].1.is_err());
    }

    #[tokio::test]
    async fn closed_dendrites_refuse_calls() {
        let dendrite = dendrite();
        let snapshot = snapshot_at(10, vec![record(1, 10)], &MetagraphConfig::default());
        dendrite.close();
        let responses = dendrite
            .dispatch(&snapshot, vec![request(1)], Duration::from_millis(200))
            .await;
        assert!(matches!(
            responses[0].result,
            Err(MeshError::PeerUnreachable { .. })
        ));
    }

    #[test]
    fn remote_codes_map_to_mesh_errors() {
        let remote = |code| Error::Remote {
            code,
            message: "boom".into(),
        };
        let elapsed = Duration::from_millis(3);
        assert!(matches!(
            attribute(PeerId(1), remote(ErrorCode::NotServing), elapsed),
            MeshError::NotServing
        ));
        assert!(matches!(
            attribute(PeerId(1), remote(ErrorCode::SynapseFailed), elapsed),
            MeshError::Synapse(m) if m == "boom"
        ));
        assert!(matches!(
            attribute(PeerId(1), remote(ErrorCode::Timeout), elapsed),
            MeshError::Timeout { peer: PeerId(1), .. }
        ));
        assert!(matches!(
            attribute(PeerId(1), Error::UnexpectedResponse, elapsed),
            MeshError::Malformed(_)
        ));
        assert!(matches!(
            attribute(PeerId(1), Error::EndpointClosed, elapsed),
            MeshError::PeerUnreachable { peer: PeerId(1), .. }
        ));
    }

    #[test]
    fn mismatched_response_kinds_are_rejected() {
        assert!(matches!(
            forward_output(WireResponse::Grade(true)),
            Err(Error::UnexpectedResponse)
        ));
        assert!(matches!(
            grade_output(WireResponse::Forward(Tensor::vector(vec![1.0]))),
            Err(Error::UnexpectedResponse)
        ));
    }
}
