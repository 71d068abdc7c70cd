use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use quinn::{ConnectionError, RecvStream, SendStream, VarInt};
use tokio::{
    select,
    sync::{watch, Mutex, RwLock},
    task::{JoinHandle, JoinSet},
    time,
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    error::Error,
    tls,
    wire::{read_frame, write_frame, ErrorCode, WireRequest, WireResponse},
};
use crate::{config::AxonConfig, error::MeshError, synapse::Synapse};

type SharedSynapse = Arc<RwLock<Option<Arc<dyn Synapse>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxonState {
    Stopped,
    Starting,
    Serving,
    Stopping,
}

struct Running {
    endpoint: quinn::Endpoint,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The serving side of a neuron. Accepts QUIC connections from other
/// neurons' dendrites and answers each request stream with one call into the
/// registered synapse.
///
/// Every request runs in its own task; a slow synapse call only holds up its
/// own stream.
pub struct Axon {
    config: AxonConfig,
    synapse: SharedSynapse,
    state: watch::Sender<AxonState>,
    running: Mutex<Option<Running>>,
}

impl Axon {
    pub fn new(config: AxonConfig) -> Self {
        let (state, _) = watch::channel(AxonState::Stopped);
        Self {
            config,
            synapse: Arc::new(RwLock::new(None)),
            state,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AxonConfig {
        &self.config
    }

    /// Registers the synapse requests are handed to, replacing any previous
    /// one. Requests already running keep the synapse they started with.
    pub async fn serve(&self, synapse: Arc<dyn Synapse>) {
        *self.synapse.write().await = Some(synapse);
        debug!("synapse registered");
    }

    /// Removes the synapse. Until the next `serve`, requests are answered with
    /// `NotServing`.
    pub async fn unserve(&self) {
        *self.synapse.write().await = None;
        debug!("synapse removed");
    }

    pub fn state(&self) -> AxonState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AxonState> {
        self.state.subscribe()
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Binds the endpoint and starts accepting connections. Calling this on a
    /// running axon returns the address it is already bound to.
    pub async fn start(&self) -> Result<SocketAddr, MeshError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }

        self.state.send_replace(AxonState::Starting);
        let (endpoint, local_addr) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                warn!(bind = %self.config.bind, error = %e, "axon failed to start");
                self.state.send_replace(AxonState::Stopped);
                return Err(e.into());
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = debug_span!("axon", addr = %local_addr);
        let acceptor = tokio::spawn(
            accept_loop(
                endpoint.clone(),
                self.synapse.clone(),
                self.config.clone(),
                shutdown_rx,
            )
            .instrument(span),
        );

        *running = Some(Running {
            endpoint,
            shutdown,
            acceptor,
            local_addr,
        });
        self.state.send_replace(AxonState::Serving);
        info!(addr = %local_addr, "axon serving");
        Ok(local_addr)
    }

    fn bind(&self) -> Result<(quinn::Endpoint, SocketAddr), Error> {
        let server_config = tls::server_config(self.config.max_concurrent_streams)?;
        let endpoint = quinn::Endpoint::server(server_config, self.config.bind)?;
        let local_addr = endpoint.local_addr()?;
        Ok((endpoint, local_addr))
    }

    /// Stops accepting, lets in-flight requests finish for up to the grace
    /// period, then aborts whatever is left and closes the endpoint. Stopping
    /// a stopped axon does nothing.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            endpoint,
            shutdown,
            acceptor,
            local_addr,
        }) = running.take()
        else {
            return;
        };

        self.state.send_replace(AxonState::Stopping);
        debug!(addr = %local_addr, "axon stopping");
        let _ = shutdown.send(true);
        if let Err(e) = acceptor.await {
            warn!(error = %e, "axon acceptor panicked");
        }
        endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.state.send_replace(AxonState::Stopped);
        info!(addr = %local_addr, "axon stopped");
    }
}

/// Accepts connections until shutdown, then drains them.
async fn accept_loop(
    endpoint: quinn::Endpoint,
    synapse: SharedSynapse,
    config: AxonConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        select! {
            incoming = endpoint.accept() => match incoming {
                Some(connecting) => {
                    connections.spawn(serve_connection(
                        connecting,
                        synapse.clone(),
                        config.clone(),
                        shutdown.clone(),
                    ));
                }
                None => break,
            },
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let in_flight = connections.len();
    let drain = async { while connections.join_next().await.is_some() {} };
    if time::timeout(config.grace_period, drain).await.is_err() {
        warn!(
            in_flight,
            grace_period = ?config.grace_period,
            "grace period elapsed, aborting remaining requests"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn serve_connection(
    connecting: quinn::Connecting,
    synapse: SharedSynapse,
    config: AxonConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let span = debug_span!("connection", remote = %connecting.remote_address());
    async move {
        let conn = match connecting.await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "handshake failed");
                return;
            }
        };
        trace!("connected via QUIC");

        let mut streams = JoinSet::new();
        loop {
            select! {
                stream = conn.accept_bi() => match stream {
                    Ok((send, recv)) => {
                        streams.spawn(
                            serve_stream(send, recv, synapse.clone(), config.clone(), shutdown.clone())
                                .in_current_span(),
                        );
                    }
                    Err(ConnectionError::ApplicationClosed(_)) | Err(ConnectionError::LocallyClosed) => break,
                    Err(e) => {
                        debug!(error = %e, "connection lost");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
            }
        }
        while streams.join_next().await.is_some() {}
    }
    .instrument(span)
    .await
}

async fn serve_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    synapse: SharedSynapse,
    config: AxonConfig,
    shutdown: watch::Receiver<bool>,
) {
    let response = match read_frame::<_, WireRequest>(&mut recv).await {
        Ok(_) if *shutdown.borrow() => {
            WireResponse::error(ErrorCode::NotServing, "axon is shutting down")
        }
        Ok(request) => handle_request(&synapse, request, config.request_timeout).await,
        Err(e) => {
            debug!(error = %e, "unreadable request");
            WireResponse::error(ErrorCode::BadRequest, e.to_string())
        }
    };

    if let Err(e) = write_frame(&mut send, &response, config.compress_threshold).await {
        debug!(error = %e, "could not write response");
        return;
    }
    if let Err(e) = send.finish().await {
        trace!(error = %e, "caller went away before the response was acknowledged");
    }
}

/// Runs one request against the registered synapse.
pub(crate) async fn handle_request(
    synapse: &RwLock<Option<Arc<dyn Synapse>>>,
    request: WireRequest,
    timeout: Duration,
) -> WireResponse {
    let Some(synapse) = synapse.read().await.clone() else {
        return WireResponse::error(ErrorCode::NotServing, "no synapse registered");
    };

    match request {
        WireRequest::Forward {
            source,
            sent_at,
            payload,
        } => {
            if let Err(e) = payload.validate() {
                return WireResponse::error(ErrorCode::BadRequest, e.to_string());
            }
            trace!(
                source = ?source,
                transit_us = Utc::now().timestamp_micros() - sent_at,
                numel = payload.numel(),
                "forward"
            );
            match time::timeout(timeout, synapse.forward(source, payload)).await {
                Ok(Ok(output)) => WireResponse::Forward(output),
                Ok(Err(e)) => WireResponse::error(ErrorCode::SynapseFailed, e.to_string()),
                Err(_) => WireResponse::error(
                    ErrorCode::Timeout,
                    format!("synapse took longer than {timeout:?}"),
                ),
            }
        }
        WireRequest::Grade {
            source,
            sent_at,
            feedback,
        } => {
            trace!(
                source = ?source,
                transit_us = Utc::now().timestamp_micros() - sent_at,
                len = feedback.len(),
                "grade"
            );
            match time::timeout(timeout, synapse.grade(source, feedback)).await {
                Ok(Ok(ack)) => WireResponse::Grade(ack),
                Ok(Err(e)) => WireResponse::error(ErrorCode::SynapseFailed, e.to_string()),
                Err(_) => WireResponse::error(
                    ErrorCode::Timeout,
                    format!("synapse took longer than {timeout:?}"),
                ),
            }
        }
    }
}
