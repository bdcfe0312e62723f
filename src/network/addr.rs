//! Local address selection

use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Local interface address the OS would route through to reach `remote`.
///
/// Connecting a UDP socket sends no packets; it only resolves the route.
pub fn local_ip_for_remote(remote: IpAddr) -> Option<IpAddr> {
    let bind_addr = match remote {
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect(SocketAddr::new(remote, 9)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_loopback_routes_to_loopback() {
        let local = local_ip_for_remote(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(local, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
