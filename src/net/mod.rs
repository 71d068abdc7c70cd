use std::net::{IpAddr, SocketAddr};

pub mod axon;
pub mod dendrite;
pub mod error;
mod tls;
pub mod wire;

/// Converts an IP address and port to a socket address.
pub(crate) fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

/// Default axon port.
pub const AXON_PORT: u16 = 8091;

/// Name every axon certificate is issued for. Neurons are identified by the
/// ledger, not by DNS, so this is a constant rather than a hostname.
pub(crate) const SERVER_NAME: &str = "axon.neuron";
