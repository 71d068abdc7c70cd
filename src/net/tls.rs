use std::{sync::Arc, time::SystemTime};

use quinn::{congestion::BbrConfig, TransportConfig, VarInt};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};

use super::{error::Error, SERVER_NAME};

/// Shared transport configuration for the server and client sides.
/// This is the default config with the BBR congestion controller enabled.
fn transport_config(max_concurrent_streams: u32) -> Arc<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.congestion_controller_factory(Arc::new(BbrConfig::default()));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(max_concurrent_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    Arc::new(transport)
}

/// Server config with a freshly generated self-signed certificate. Axons are
/// identified by the ledger, so the certificate only buys transport
/// encryption.
pub(crate) fn server_config(max_concurrent_streams: u32) -> Result<quinn::ServerConfig, Error> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let der = cert.serialize_der()?;
    let key = cert.serialize_private_key_der();

    let mut server_tls = rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(der)], PrivateKey(key))?;
    server_tls.max_early_data_size = u32::MAX;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
    config.transport_config(transport_config(max_concurrent_streams));
    Ok(config)
}

pub(crate) fn client_config() -> Result<quinn::ClientConfig, Error> {
    let client_tls = rustls::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_custom_certificate_verifier(Arc::new(AcceptAnyAxon))
        .with_no_client_auth();

    let mut config = quinn::ClientConfig::new(Arc::new(client_tls));
    // the client never accepts streams, but both sides should agree on BBR
    config.transport_config(transport_config(0));
    Ok(config)
}

/// Accepts any certificate. Whether a peer may be called at all is decided
/// by the metagraph snapshot, not by a certificate authority.
struct AcceptAnyAxon;

impl ServerCertVerifier for AcceptAnyAxon {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
